//! Forwarder node (jondo).
//!
//! Joins the directory once at startup, then relays DATA and VOTE_CAST
//! traffic for the rest of the overlay using the biased relay decision.
//! Forwarders never store themselves in their own table.

use crate::server::MessageHandler;
use crate::session::{ForwarderEvent, Session, VoteError};
use crate::transport::{self, LineConnection, TransportError};
use anyhow::{Result, bail};
use async_trait::async_trait;
use crowds_core::{Hop, MembershipTable, Message, MessageType, Node, RelayPolicy, Vote};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers miss older events.
const EVENT_CAPACITY: usize = 256;

/// Failure to join the overlay. Fatal for a forwarder process.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Could not reach directory at {directory}: {source}")]
    Connect {
        directory: Node,
        #[source]
        source: TransportError,
    },
    #[error("Directory at {0} closed the connection without replying")]
    Closed(Node),
    #[error("Directory replied with {0} instead of WELCOME")]
    UnexpectedReply(MessageType),
}

pub struct Forwarder {
    node: Node,
    directory: Node,
    members: MembershipTable,
    policy: RelayPolicy,
    session: Session,
    events: broadcast::Sender<ForwarderEvent>,
}

impl Forwarder {
    /// Send HELLO to the directory and build a forwarder from its WELCOME.
    ///
    /// The caller should already be listening on `node`'s endpoint, so that
    /// announcements sent while the join is in flight are not lost.
    pub async fn join(node: Node, directory: Node, policy: RelayPolicy) -> Result<Self, JoinError> {
        info!("Joining directory at {} as {}", directory, node);
        let reply = transport::request(directory.address(), directory.port(), &Message::hello(&node))
            .await
            .map_err(|source| JoinError::Connect {
                directory: directory.clone(),
                source,
            })?;

        let routing_table = match reply {
            Some(Message::Welcome { routing_table }) => routing_table,
            Some(other) => return Err(JoinError::UnexpectedReply(other.message_type())),
            None => return Err(JoinError::Closed(directory)),
        };

        let forwarder = Self::new(node, directory, policy);
        let added = forwarder
            .members
            .extend(routing_table.into_iter().filter(|member| *member != forwarder.node));
        info!(
            "Joined overlay with {} other member(s) (relay bias {})",
            added, forwarder.policy.bias
        );
        Ok(forwarder)
    }

    fn new(node: Node, directory: Node, policy: RelayPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node,
            directory,
            members: MembershipTable::new(),
            policy,
            session: Session::new(),
            events,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn directory(&self) -> &Node {
        &self.directory
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Snapshot of the other members this forwarder knows.
    pub fn members(&self) -> Vec<Node> {
        self.members.snapshot()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwarderEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ForwarderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Add a member announced by the directory.
    pub fn add_member(&self, node: Node) -> bool {
        if node == self.node {
            debug!("Ignoring announcement of ourselves");
            return false;
        }
        if !self.members.insert(node.clone()) {
            warn!("Ignoring duplicate announcement of {}", node);
            return false;
        }
        info!("Learned of {} ({} member(s))", node, self.members.len());
        self.emit(ForwarderEvent::member_added(&node));
        true
    }

    /// Draw the relay decision for a message at this node.
    fn decide(&self, destination: (&str, u16), source: Option<(&str, u16)>) -> Hop {
        let mut rng = rand::rng();
        self.policy
            .next_hop(&mut rng, &self.node, &self.members, destination, source)
    }

    /// Hand a message to the next hop without waiting for any reply.
    async fn forward(&self, hop: &Hop, message: &Message) -> Result<(), TransportError> {
        match hop {
            Hop::Random(node) => transport::send_once(node.address(), node.port(), message).await,
            Hop::Direct { address, port } => transport::send_once(address, *port, message).await,
            Hop::Local | Hop::Dropped => Ok(()),
        }
    }

    /// Relay a DATA or VOTE_CAST that arrived from another node.
    ///
    /// Best effort: a failed forward is logged and the message is lost.
    pub async fn relay(&self, message: &Message) -> Hop {
        let Some(destination) = message.destination() else {
            warn!("Cannot relay {} without a destination", message.message_type());
            return Hop::Dropped;
        };
        let hop = self.decide(destination, message.source());
        debug!("Relaying {}: {}", message.message_type(), hop);

        match &hop {
            Hop::Local => self.deliver(message),
            Hop::Dropped => {}
            _ => {
                if let Err(e) = self.forward(&hop, message).await {
                    warn!("Failed to relay {} ({}): {}", message.message_type(), hop, e);
                }
            }
        }
        hop
    }

    /// Terminate a message addressed to this forwarder.
    fn deliver(&self, message: &Message) {
        match message {
            Message::Data { data, .. } => {
                info!("Delivered DATA ({} bytes)", data.len());
                self.session.record_delivery(data);
                self.emit(ForwarderEvent::Delivered { data: data.clone() });
            }
            other => warn!("Discarding {} addressed to this forwarder", other.message_type()),
        }
    }

    /// Originate a DATA message at this node.
    ///
    /// Applies the relay decision here and waits for the first hop's ACK.
    pub async fn send_data(&self, dst_addr: &str, dst_port: u16, data: &str) -> Result<Hop> {
        let message = Message::data(dst_addr, dst_port, data);
        let hop = self.decide((dst_addr, dst_port), None);

        let (address, port) = match &hop {
            Hop::Local => {
                self.deliver(&message);
                return Ok(hop);
            }
            Hop::Dropped => return Ok(hop),
            Hop::Random(node) => (node.address(), node.port()),
            Hop::Direct { address, port } => (address.as_str(), *port),
        };

        match transport::request(address, port, &message).await? {
            Some(Message::Ack { .. }) => {
                debug!("DATA for {}:{} acknowledged by {}:{}", dst_addr, dst_port, address, port);
                Ok(hop)
            }
            Some(other) => bail!("{}:{} replied with {} instead of ACK", address, port, other.message_type()),
            None => bail!("{}:{} closed without acknowledging", address, port),
        }
    }

    /// Cast a ballot for the 1-based `option` of the current vote.
    pub async fn cast_vote(&self, option: usize) -> Result<(Vote, Hop), VoteError> {
        let vote = self.session.current_vote().ok_or(VoteError::NoOpenVote)?;
        self.cast_ballot(&vote, option).await
    }

    /// Cast a ballot for the 1-based `option` of a specific vote.
    pub async fn cast_vote_on(&self, vote_id: &str, option: usize) -> Result<(Vote, Hop), VoteError> {
        let vote = self
            .session
            .vote(vote_id)
            .ok_or_else(|| VoteError::NoSuchVote(vote_id.to_string()))?;
        self.cast_ballot(&vote, option).await
    }

    async fn cast_ballot(&self, vote: &Vote, option: usize) -> Result<(Vote, Hop), VoteError> {
        let selection = vote.option(option).ok_or(VoteError::InvalidOption {
            index: option,
            available: vote.options.len(),
        })?;
        let ballot = Vote::ballot(vote.vote_id.clone(), selection);
        let mut message = Message::vote_cast(&self.directory, ballot.clone());
        if self.policy.exclude_source
            && let Message::VoteCast {
                src_addr, src_port, ..
            } = &mut message
        {
            *src_addr = Some(self.node.address().to_string());
            *src_port = Some(self.node.port());
        }

        let hop = self.decide((self.directory.address(), self.directory.port()), message.source());
        match &hop {
            Hop::Local => self.deliver(&message),
            Hop::Dropped => {
                warn!("Ballot for {} dropped: no member to relay through", vote.vote_id);
                return Ok((ballot, hop));
            }
            _ => self.forward(&hop, &message).await?,
        }
        self.session.record_cast(&vote.vote_id, selection);
        info!("Cast {} for vote {} via {}", selection, vote.vote_id, hop);
        Ok((ballot, hop))
    }

    /// Ask the directory for a vote's results.
    ///
    /// The answer arrives later on a separate connection and is reported as
    /// `ForwarderEvent::ResultsReceived`.
    pub async fn query_results(&self, vote_id: &str) -> Result<(), TransportError> {
        let query = Message::vote_results_query(&self.directory, &self.node, Vote::reference(vote_id));
        transport::send_once(self.directory.address(), self.directory.port(), &query).await
    }

    fn receive_results(&self, vote: Vote) {
        let results = vote.results.unwrap_or_default();
        info!("Results for {}: {:?}", vote.vote_id, results);
        self.session.record_results(&vote.vote_id, results.clone());
        self.emit(ForwarderEvent::ResultsReceived {
            vote_id: vote.vote_id,
            results,
        });
    }

    fn open_vote(&self, vote: Vote) {
        info!(
            "Vote {} opened: {}",
            vote.vote_id,
            vote.question.as_deref().unwrap_or("(no question)")
        );
        self.emit(ForwarderEvent::vote_opened(&vote));
        self.session.open_vote(vote);
    }
}

#[async_trait]
impl MessageHandler for Forwarder {
    async fn handle(&self, message: Message, conn: &mut LineConnection) -> Result<()> {
        match message {
            Message::Broadcast {
                new_node_addr,
                new_node_port,
            } => {
                self.add_member(Node::new(new_node_addr, new_node_port));
            }
            Message::Data { .. } => {
                self.relay(&message).await;
                // Relaying hops hang up without reading the ACK.
                if let Err(e) = conn.send(&Message::ack(&self.node)).await {
                    debug!("ACK not read by previous hop: {}", e);
                }
            }
            Message::VoteCast { .. } => {
                self.relay(&message).await;
            }
            Message::VoteBroadcast { vote } => self.open_vote(vote),
            Message::VoteResults { vote, .. } => self.receive_results(vote),
            other => {
                warn!(
                    "Forwarder does not handle {} messages; closing",
                    other.message_type()
                );
            }
        }
        Ok(())
    }
}
