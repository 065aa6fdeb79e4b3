//! Wire protocol for the overlay.
//!
//! Every exchange is a short-lived TCP connection carrying newline-delimited
//! JSON objects:
//! - Typed messages with per-type required fields (`message`)
//! - The vote payload nested inside the VOTE_* messages (`vote`)

pub mod message;
pub mod vote;

pub use message::{CodecError, Message, MessageType};
pub use vote::{Vote, format_result_line, parse_result_line, vote_id};

/// Largest accepted message line in bytes, newline included.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
