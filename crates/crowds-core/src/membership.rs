//! Membership table: the set of overlay members a node knows about.
//!
//! Keyed by UID, so two nodes at the same endpoint are the same member.
//! Safe for concurrent use from many connection handlers; wrap in `Arc`
//! for shared ownership.

use crate::{Node, Uid};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MembershipTable {
    members: RwLock<HashMap<Uid, Node>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member.
    ///
    /// Returns false (and leaves the table unchanged) if a member with the
    /// same UID is already present.
    pub fn insert(&self, node: Node) -> bool {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if members.contains_key(&node.uid()) {
            return false;
        }
        tracing::debug!("Member added: {}", node);
        members.insert(node.uid(), node);
        true
    }

    /// Add every node in turn; returns how many were new.
    pub fn extend(&self, nodes: impl IntoIterator<Item = Node>) -> usize {
        nodes.into_iter().filter(|node| self.insert(node.clone())).count()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(uid)
    }

    pub fn get(&self, uid: &Uid) -> Option<Node> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(uid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all members, in no particular order.
    pub fn snapshot(&self) -> Vec<Node> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Uniformly pick a member not rejected by `exclude`.
    pub fn random_member<R, F>(&self, rng: &mut R, exclude: F) -> Option<Node>
    where
        R: Rng + ?Sized,
        F: Fn(&Node) -> bool,
    {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let candidates: Vec<&Node> = members.values().filter(|node| !exclude(node)).collect();
        candidates.choose(rng).map(|node| (*node).clone())
    }
}
