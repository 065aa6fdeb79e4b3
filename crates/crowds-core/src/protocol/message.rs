//! Wire messages and their codec.
//!
//! One message is one JSON object on one line. The `type` field is read
//! first and selects which fields are required:
//!
//! | type                 | fields                                        |
//! |----------------------|-----------------------------------------------|
//! | `HELLO`              | srcAddr, srcPort                              |
//! | `WELCOME`            | routingTable                                  |
//! | `BROADCAST`          | newNodeAddr, newNodePort                      |
//! | `DATA`               | dstAddr, dstPort, data                        |
//! | `ACK`                | srcAddr, srcPort                              |
//! | `VOTE_BROADCAST`     | vote                                          |
//! | `VOTE_CAST`          | dstAddr, dstPort, vote                        |
//! | `VOTE_RESULTS_QUERY` | dstAddr, dstPort, srcAddr, srcPort, vote      |
//! | `VOTE_RESULTS`       | dstAddr, dstPort, srcAddr, srcPort, vote      |

use super::Vote;
use crate::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Errors produced while decoding a wire message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Message is not a JSON object")]
    NotAnObject,
    #[error("Message has no type field")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("{message_type} message is missing required fields: {}", missing.join(", "))]
    InvalidSchema {
        message_type: MessageType,
        missing: Vec<&'static str>,
    },
}

/// Discriminant of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Welcome,
    Broadcast,
    Data,
    Ack,
    VoteBroadcast,
    VoteCast,
    VoteResultsQuery,
    VoteResults,
}

impl MessageType {
    pub const ALL: [MessageType; 9] = [
        MessageType::Hello,
        MessageType::Welcome,
        MessageType::Broadcast,
        MessageType::Data,
        MessageType::Ack,
        MessageType::VoteBroadcast,
        MessageType::VoteCast,
        MessageType::VoteResultsQuery,
        MessageType::VoteResults,
    ];

    /// Wire spelling of the discriminant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Broadcast => "BROADCAST",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::VoteBroadcast => "VOTE_BROADCAST",
            Self::VoteCast => "VOTE_CAST",
            Self::VoteResultsQuery => "VOTE_RESULTS_QUERY",
            Self::VoteResults => "VOTE_RESULTS",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Fields that must be present for this type to decode.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Hello | Self::Ack => &["srcAddr", "srcPort"],
            Self::Welcome => &["routingTable"],
            Self::Broadcast => &["newNodeAddr", "newNodePort"],
            Self::Data => &["dstAddr", "dstPort", "data"],
            Self::VoteBroadcast => &["vote"],
            Self::VoteCast => &["dstAddr", "dstPort", "vote"],
            Self::VoteResultsQuery | Self::VoteResults => {
                &["dstAddr", "dstPort", "srcAddr", "srcPort", "vote"]
            }
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Join request from a forwarder to the directory.
    #[serde(rename_all = "camelCase")]
    Hello { src_addr: String, src_port: u16 },

    /// Directory's reply to HELLO with its full membership table.
    #[serde(rename_all = "camelCase")]
    Welcome { routing_table: Vec<Node> },

    /// Directory announcing a newly joined member.
    #[serde(rename_all = "camelCase")]
    Broadcast {
        new_node_addr: String,
        new_node_port: u16,
    },

    /// Application payload addressed to a destination, relayed hop by hop.
    #[serde(rename_all = "camelCase")]
    Data {
        dst_addr: String,
        dst_port: u16,
        data: String,
    },

    /// Acknowledges that the next hop accepted a DATA message.
    #[serde(rename_all = "camelCase")]
    Ack { src_addr: String, src_port: u16 },

    /// Directory opening a vote on every member.
    VoteBroadcast { vote: Vote },

    /// A ballot, relayed like DATA toward the directory.
    ///
    /// The source is optional and only stamped when source exclusion is
    /// enabled, since it names the originator to every later hop.
    #[serde(rename_all = "camelCase")]
    VoteCast {
        dst_addr: String,
        dst_port: u16,
        vote: Vote,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_addr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_port: Option<u16>,
    },

    /// Point-to-point results request from a forwarder to the directory.
    #[serde(rename_all = "camelCase")]
    VoteResultsQuery {
        dst_addr: String,
        dst_port: u16,
        src_addr: String,
        src_port: u16,
        vote: Vote,
    },

    /// Directory's out-of-band answer to a results query.
    #[serde(rename_all = "camelCase")]
    VoteResults {
        dst_addr: String,
        dst_port: u16,
        src_addr: String,
        src_port: u16,
        vote: Vote,
    },
}

impl Message {
    pub fn hello(node: &Node) -> Self {
        Self::Hello {
            src_addr: node.address().to_string(),
            src_port: node.port(),
        }
    }

    pub fn welcome(routing_table: Vec<Node>) -> Self {
        Self::Welcome { routing_table }
    }

    pub fn broadcast(new_node: &Node) -> Self {
        Self::Broadcast {
            new_node_addr: new_node.address().to_string(),
            new_node_port: new_node.port(),
        }
    }

    pub fn data(dst_addr: impl Into<String>, dst_port: u16, data: impl Into<String>) -> Self {
        Self::Data {
            dst_addr: dst_addr.into(),
            dst_port,
            data: data.into(),
        }
    }

    pub fn ack(node: &Node) -> Self {
        Self::Ack {
            src_addr: node.address().to_string(),
            src_port: node.port(),
        }
    }

    pub fn vote_cast(directory: &Node, ballot: Vote) -> Self {
        Self::VoteCast {
            dst_addr: directory.address().to_string(),
            dst_port: directory.port(),
            vote: ballot,
            src_addr: None,
            src_port: None,
        }
    }

    pub fn vote_results_query(directory: &Node, from: &Node, vote: Vote) -> Self {
        Self::VoteResultsQuery {
            dst_addr: directory.address().to_string(),
            dst_port: directory.port(),
            src_addr: from.address().to_string(),
            src_port: from.port(),
            vote,
        }
    }

    /// Answer to a query: addressed back to the querier, sourced at the directory.
    pub fn vote_results(querier: &Node, directory: &Node, vote: Vote) -> Self {
        Self::VoteResults {
            dst_addr: querier.address().to_string(),
            dst_port: querier.port(),
            src_addr: directory.address().to_string(),
            src_port: directory.port(),
            vote,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Hello { .. } => MessageType::Hello,
            Self::Welcome { .. } => MessageType::Welcome,
            Self::Broadcast { .. } => MessageType::Broadcast,
            Self::Data { .. } => MessageType::Data,
            Self::Ack { .. } => MessageType::Ack,
            Self::VoteBroadcast { .. } => MessageType::VoteBroadcast,
            Self::VoteCast { .. } => MessageType::VoteCast,
            Self::VoteResultsQuery { .. } => MessageType::VoteResultsQuery,
            Self::VoteResults { .. } => MessageType::VoteResults,
        }
    }

    /// Declared destination, for types that carry one.
    pub fn destination(&self) -> Option<(&str, u16)> {
        match self {
            Self::Data {
                dst_addr, dst_port, ..
            }
            | Self::VoteCast {
                dst_addr, dst_port, ..
            }
            | Self::VoteResultsQuery {
                dst_addr, dst_port, ..
            }
            | Self::VoteResults {
                dst_addr, dst_port, ..
            } => Some((dst_addr, *dst_port)),
            _ => None,
        }
    }

    /// Declared source, for types that carry one.
    pub fn source(&self) -> Option<(&str, u16)> {
        match self {
            Self::Hello { src_addr, src_port }
            | Self::Ack { src_addr, src_port }
            | Self::VoteResultsQuery {
                src_addr, src_port, ..
            }
            | Self::VoteResults {
                src_addr, src_port, ..
            } => Some((src_addr, *src_port)),
            Self::VoteCast {
                src_addr: Some(addr),
                src_port: Some(port),
                ..
            } => Some((addr, *port)),
            _ => None,
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).expect("Message serialization should not fail");
        line.push(b'\n');
        line
    }

    /// Decode one JSON line.
    ///
    /// Validates the discriminant and the per-type required fields before
    /// handing the object to serde, so a missing field is reported by name.
    pub fn decode(line: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(line)?;
        let object = value.as_object().ok_or(CodecError::NotAnObject)?;

        let tag = match object.get("type") {
            None | Some(Value::Null) => return Err(CodecError::MissingType),
            Some(Value::String(tag)) => tag.as_str(),
            Some(other) => return Err(CodecError::UnknownType(other.to_string())),
        };
        let message_type =
            MessageType::from_wire(tag).ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;

        let missing: Vec<&'static str> = message_type
            .required_fields()
            .iter()
            .copied()
            .filter(|field| object.get(*field).is_none_or(Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(CodecError::InvalidSchema {
                message_type,
                missing,
            });
        }

        Ok(serde_json::from_value(value)?)
    }
}
