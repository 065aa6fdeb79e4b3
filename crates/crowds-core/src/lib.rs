//! crowds-core: shared library for a Crowds-style anonymity overlay.
//!
//! This crate provides the I/O-free parts of the protocol:
//! - Node identity derived from endpoints (`Uid`, `Node`)
//! - The line-delimited JSON wire protocol and the vote payload
//! - The membership table shared by the directory and forwarders
//! - Vote tallying on the directory
//! - The biased per-hop relay decision

pub mod membership;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod tally;

pub use membership::MembershipTable;
pub use node::{Node, UID_LEN, Uid, UidError};
pub use protocol::{CodecError, MAX_MESSAGE_SIZE, Message, MessageType, Vote};
pub use relay::{Bias, BiasError, DEFAULT_BIAS, Hop, RelayPolicy};
pub use tally::VoteTally;
