//! Vote payload carried by the VOTE_* messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed vote identifier.
///
/// `base64(SHA256(question || concat(options)))`. Re-issuing the same
/// question with the same options yields the same id, so forwarders can
/// refer to a vote without the directory confirming it.
pub fn vote_id(question: &str, options: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(question.as_bytes());
    for option in options {
        hasher.update(option.as_bytes());
    }
    STANDARD.encode(hasher.finalize())
}

/// A vote as it travels on the wire.
///
/// Only `voteId` is always present. A broadcast carries the question and
/// options, a ballot carries the selection, and a results answer carries
/// the results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub vote_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Vote {
    /// Reference to a vote by id alone (used for results queries).
    pub fn reference(vote_id: impl Into<String>) -> Self {
        Self {
            vote_id: vote_id.into(),
            question: None,
            options: Vec::new(),
            selection: None,
            results: None,
            voter_id: None,
            timestamp: None,
        }
    }

    /// Create a new open vote, deriving its id from the content.
    pub fn open(question: impl Into<String>, options: Vec<String>) -> Self {
        let question = question.into();
        Self {
            vote_id: vote_id(&question, &options),
            question: Some(question),
            options,
            ..Self::reference(String::new())
        }
    }

    /// A ballot selecting one option of this vote.
    pub fn ballot(vote_id: impl Into<String>, selection: impl Into<String>) -> Self {
        Self {
            selection: Some(selection.into()),
            ..Self::reference(vote_id)
        }
    }

    /// A results answer for this vote.
    pub fn with_results(vote_id: impl Into<String>, results: Vec<String>) -> Self {
        Self {
            results: Some(results),
            ..Self::reference(vote_id)
        }
    }

    /// Option text for a 1-based index, as shown to a user.
    pub fn option(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.options.get(i))
            .map(String::as_str)
    }
}

/// Format one tally entry the way results are reported: `"option: count"`.
pub fn format_result_line(option: &str, count: u64) -> String {
    format!("{option}: {count}")
}

/// Parse a `"option: count"` results entry.
///
/// Splits on the last `": "` so options may themselves contain colons.
pub fn parse_result_line(line: &str) -> Option<(String, u64)> {
    let (option, count) = line.rsplit_once(": ")?;
    Some((option.to_string(), count.trim().parse().ok()?))
}
