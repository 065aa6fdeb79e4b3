//! Node identity: who a peer is and where to reach it.
//!
//! A peer's UID is derived from its endpoint, never assigned. Every process
//! computes the same UID for the same `(address, port)`, which is what makes
//! duplicate-join detection work across the overlay.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Length of a UID digest in bytes (SHA-1).
pub const UID_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum UidError {
    #[error("Invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("Invalid UID length: expected {expected} bytes, got {0}", expected = UID_LEN)]
    InvalidLength(usize),
}

/// Content-derived identifier of a peer.
///
/// `SHA1(address_bytes || big_endian_u32(port))`, displayed and transported
/// as standard base64.
///
/// # Examples
/// ```
/// use crowds_core::Uid;
///
/// let uid = Uid::derive("127.0.0.1", 6000);
/// assert_eq!(uid, Uid::derive("127.0.0.1", 6000));
/// assert_eq!(uid.to_string(), "k1nf56mnURajNn6Zf9wZEnGlVT4=");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// Derive the UID for an endpoint.
    ///
    /// The port is widened to a 4-byte big-endian integer before hashing.
    pub fn derive(address: &str, port: u16) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(address.as_bytes());
        hasher.update(u32::from(port).to_be_bytes());
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl FromStr for Uid {
    type Err = UidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD.decode(s)?;
        let digest: [u8; UID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| UidError::InvalidLength(bytes.len()))?;
        Ok(Self(digest))
    }
}

// Serialize as base64 string, same as Display
impl Serialize for Uid {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A peer in the overlay.
///
/// Immutable once created. On the wire a node is just `{"addr","port"}`;
/// the UID is recomputed on receipt rather than trusted from the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "NodeRepr", into = "NodeRepr")]
pub struct Node {
    address: String,
    port: u16,
    uid: Uid,
}

impl Node {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        let uid = Uid::derive(&address, port);
        Self { address, port, uid }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Check whether this node lives at the given endpoint.
    pub fn is_at(&self, address: &str, port: u16) -> bool {
        self.port == port && self.address == address
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Wire shape of a node inside WELCOME routing tables.
#[derive(Serialize, Deserialize)]
struct NodeRepr {
    addr: String,
    port: u16,
}

impl From<NodeRepr> for Node {
    fn from(repr: NodeRepr) -> Self {
        Node::new(repr.addr, repr.port)
    }
}

impl From<Node> for NodeRepr {
    fn from(node: Node) -> Self {
        NodeRepr {
            addr: node.address,
            port: node.port,
        }
    }
}
