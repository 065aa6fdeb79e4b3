//! Per-vote ballot counts kept by the directory.

use crate::protocol::format_result_line;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Counts of selected options, per vote.
///
/// Counts only ever increase. Options are kept ordered so results render
/// the same way every time.
#[derive(Default)]
pub struct VoteTally {
    votes: Mutex<HashMap<String, BTreeMap<String, u64>>>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one ballot for `option` in `vote_id`. Returns the new count.
    pub fn tally_vote(&self, vote_id: &str, option: &str) -> u64 {
        let mut votes = self.votes.lock().unwrap_or_else(|e| e.into_inner());
        let count = votes
            .entry(vote_id.to_string())
            .or_default()
            .entry(option.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Results as `"option: count"` lines. Empty for a vote with no ballots.
    pub fn results(&self, vote_id: &str) -> Vec<String> {
        self.counts(vote_id)
            .map(|counts| {
                counts
                    .iter()
                    .map(|(option, count)| format_result_line(option, *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counts(&self, vote_id: &str) -> Option<BTreeMap<String, u64>> {
        self.votes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(vote_id)
            .cloned()
    }

    /// Total ballots counted for a vote.
    pub fn total(&self, vote_id: &str) -> u64 {
        self.counts(vote_id)
            .map(|counts| counts.values().sum())
            .unwrap_or(0)
    }
}
