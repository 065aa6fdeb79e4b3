//! Directory node (blender).
//!
//! Owns the authoritative membership table and the vote tally. Joins are
//! serialized together with their BROADCAST fan-out, so every member sees
//! new members announced in the order the directory admitted them.

use crate::server::MessageHandler;
use crate::session::VoteError;
use crate::transport::{self, LineConnection};
use anyhow::Result;
use async_trait::async_trait;
use crowds_core::{MembershipTable, Message, Node, Vote, VoteTally};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct Directory {
    node: Node,
    members: MembershipTable,
    tally: VoteTally,
    /// Votes opened from this directory, by id.
    votes: RwLock<HashMap<String, Vote>>,
    /// Held across insert and fan-out of a join.
    join_lock: Mutex<()>,
}

impl Directory {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            members: MembershipTable::new(),
            tally: VoteTally::new(),
            votes: RwLock::new(HashMap::new()),
            join_lock: Mutex::new(()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Node> {
        self.members.snapshot()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Admit a member and announce it to everyone else.
    ///
    /// Returns false if a member with the same UID was already present, in
    /// which case nothing is announced. Announcements are sequential, one
    /// connection per member; a member that cannot be reached is skipped.
    pub async fn join(&self, node: Node) -> bool {
        let _guard = self.join_lock.lock().await;

        if !self.members.insert(node.clone()) {
            warn!("Rejected duplicate join from {} ({})", node, node.uid());
            return false;
        }
        info!("{} joined ({} member(s))", node, self.members.len());

        let announcement = Message::broadcast(&node);
        for member in self.members.snapshot() {
            if member == node {
                continue;
            }
            match transport::send_once(member.address(), member.port(), &announcement).await {
                Ok(()) => debug!("Announced {} to {}", node, member),
                Err(e) => warn!("Failed to announce {} to {}: {}", node, member, e),
            }
        }
        true
    }

    /// Count one ballot.
    pub fn tally_vote(&self, vote_id: &str, option: &str) {
        let count = self.tally.tally_vote(vote_id, option);
        debug!("Tallied {} for vote {} (now {})", option, vote_id, count);
    }

    /// Results as `"option: count"` lines; empty if nothing was cast.
    pub fn results(&self, vote_id: &str) -> Vec<String> {
        self.tally.results(vote_id)
    }

    /// Raw counts for a vote, if any ballot was cast.
    pub fn tally(&self, vote_id: &str) -> Option<BTreeMap<String, u64>> {
        self.tally.counts(vote_id)
    }

    pub fn vote(&self, vote_id: &str) -> Option<Vote> {
        self.votes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vote_id)
            .cloned()
    }

    /// Send VOTE_BROADCAST to every member. Returns how many were reached.
    pub async fn broadcast_vote(&self, vote: &Vote) -> usize {
        self.votes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vote.vote_id.clone(), vote.clone());

        let message = Message::VoteBroadcast { vote: vote.clone() };
        let mut reached = 0;
        for member in self.members.snapshot() {
            match transport::send_once(member.address(), member.port(), &message).await {
                Ok(()) => reached += 1,
                Err(e) => warn!("Failed to send vote {} to {}: {}", vote.vote_id, member, e),
            }
        }
        info!("Vote {} broadcast to {} member(s)", vote.vote_id, reached);
        reached
    }

    /// Create a vote from a question and options and open it on all members.
    pub async fn create_and_broadcast_vote(
        &self,
        question: &str,
        options: Vec<String>,
    ) -> Result<Vote, VoteError> {
        if options.is_empty() {
            return Err(VoteError::NoOptions);
        }
        let vote = Vote::open(question, options);
        self.broadcast_vote(&vote).await;
        Ok(vote)
    }

    async fn answer_results_query(&self, querier: Node, vote_id: &str) {
        let results = self.results(vote_id);
        debug!("Answering results query for {} from {}", vote_id, querier);
        let answer = Message::vote_results(
            &querier,
            &self.node,
            Vote::with_results(vote_id, results),
        );
        if let Err(e) = transport::send_once(querier.address(), querier.port(), &answer).await {
            warn!("Failed to deliver results for {} to {}: {}", vote_id, querier, e);
        }
    }
}

#[async_trait]
impl MessageHandler for Directory {
    async fn handle(&self, message: Message, conn: &mut LineConnection) -> Result<()> {
        match message {
            Message::Hello { src_addr, src_port } => {
                // Duplicates are still welcomed with the current table.
                self.join(Node::new(src_addr, src_port)).await;
                conn.send(&Message::welcome(self.members())).await?;
            }
            Message::VoteCast { vote, .. } => match &vote.selection {
                Some(selection) => self.tally_vote(&vote.vote_id, selection),
                None => warn!("Ignoring ballot for {} with no selection", vote.vote_id),
            },
            Message::VoteResultsQuery {
                src_addr,
                src_port,
                vote,
                ..
            } => {
                self.answer_results_query(Node::new(src_addr, src_port), &vote.vote_id)
                    .await;
            }
            other => {
                warn!(
                    "Directory does not handle {} messages; closing",
                    other.message_type()
                );
            }
        }
        Ok(())
    }
}
