//! Per-forwarder session state and events.
//!
//! Everything a forwarder learns while running that is not membership: the
//! votes it has been offered, the ballots it has cast, results it has been
//! sent and payloads delivered to it. Owned by one `Forwarder`.

use crowds_core::{Node, Vote};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::transport::TransportError;

/// Number of delivered payloads a session keeps; older ones are evicted.
pub const DELIVERED_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("No vote is currently open")]
    NoOpenVote,
    #[error("Unknown vote: {0}")]
    NoSuchVote(String),
    #[error("Option {index} is not valid; vote has {available} option(s)")]
    InvalidOption { index: usize, available: usize },
    #[error("A vote needs at least one option")]
    NoOptions,
    #[error("Failed to send ballot: {0}")]
    Transport(#[from] TransportError),
}

/// Events emitted by a forwarder for monitoring and the console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwarderEvent {
    /// A BROADCAST added a member to the local table.
    MemberAdded { addr: String, port: u16 },
    /// A DATA payload addressed to this forwarder arrived.
    Delivered { data: String },
    /// The directory opened a vote.
    VoteOpened {
        #[serde(rename = "voteId")]
        vote_id: String,
        question: Option<String>,
        options: Vec<String>,
    },
    /// The directory answered a results query.
    ResultsReceived {
        #[serde(rename = "voteId")]
        vote_id: String,
        results: Vec<String>,
    },
}

impl ForwarderEvent {
    pub fn member_added(node: &Node) -> Self {
        Self::MemberAdded {
            addr: node.address().to_string(),
            port: node.port(),
        }
    }

    pub fn vote_opened(vote: &Vote) -> Self {
        Self::VoteOpened {
            vote_id: vote.vote_id.clone(),
            question: vote.question.clone(),
            options: vote.options.clone(),
        }
    }
}

#[derive(Default)]
struct SessionState {
    votes: HashMap<String, Vote>,
    current: Option<String>,
    cast: HashMap<String, String>,
    results: HashMap<String, Vec<String>>,
    delivered: VecDeque<String>,
}

/// Mutable forwarder state, safe to share between connection tasks.
#[derive(Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Record a broadcast vote and make it the current one.
    pub fn open_vote(&self, vote: Vote) {
        self.with_state(|s| {
            s.current = Some(vote.vote_id.clone());
            s.votes.insert(vote.vote_id.clone(), vote);
        });
    }

    pub fn current_vote(&self) -> Option<Vote> {
        self.with_state(|s| s.current.as_ref().and_then(|id| s.votes.get(id)).cloned())
    }

    pub fn vote(&self, vote_id: &str) -> Option<Vote> {
        self.with_state(|s| s.votes.get(vote_id).cloned())
    }

    /// Remember the option this forwarder chose for a vote.
    pub fn record_cast(&self, vote_id: &str, selection: &str) {
        self.with_state(|s| {
            s.cast.insert(vote_id.to_string(), selection.to_string());
        });
    }

    pub fn cast_selection(&self, vote_id: &str) -> Option<String> {
        self.with_state(|s| s.cast.get(vote_id).cloned())
    }

    pub fn record_results(&self, vote_id: &str, results: Vec<String>) {
        self.with_state(|s| {
            s.results.insert(vote_id.to_string(), results);
        });
    }

    pub fn results(&self, vote_id: &str) -> Option<Vec<String>> {
        self.with_state(|s| s.results.get(vote_id).cloned())
    }

    pub fn record_delivery(&self, data: &str) {
        self.with_state(|s| {
            if s.delivered.len() == DELIVERED_CAPACITY {
                s.delivered.pop_front();
            }
            s.delivered.push_back(data.to_string());
        });
    }

    /// The most recent payloads delivered to this forwarder, oldest first.
    pub fn delivered(&self) -> Vec<String> {
        self.with_state(|s| s.delivered.iter().cloned().collect())
    }
}
