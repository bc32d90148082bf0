//! Per-entry state machine
//!
//! ```text
//! Fetched -> Dispatched -> Downloaded -> Resolved -> Renamed -> Notified
//!    \___________\_____________\____________\___________\____-> Failed
//! ```
//!
//! Retryable errors keep an entry in its current state until a later cycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Fetched,
    Dispatched,
    Downloaded,
    Resolved,
    Renamed,
    Notified,
    Failed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Fetched => "fetched",
            EntryState::Dispatched => "dispatched",
            EntryState::Downloaded => "downloaded",
            EntryState::Resolved => "resolved",
            EntryState::Renamed => "renamed",
            EntryState::Notified => "notified",
            EntryState::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "fetched" => Some(EntryState::Fetched),
            "dispatched" => Some(EntryState::Dispatched),
            "downloaded" => Some(EntryState::Downloaded),
            "resolved" => Some(EntryState::Resolved),
            "renamed" => Some(EntryState::Renamed),
            "notified" => Some(EntryState::Notified),
            "failed" => Some(EntryState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Notified | EntryState::Failed)
    }

    /// The state reached when the current step succeeds
    pub fn next(&self) -> Option<EntryState> {
        match self {
            EntryState::Fetched => Some(EntryState::Dispatched),
            EntryState::Dispatched => Some(EntryState::Downloaded),
            EntryState::Downloaded => Some(EntryState::Resolved),
            EntryState::Resolved => Some(EntryState::Renamed),
            EntryState::Renamed => Some(EntryState::Notified),
            EntryState::Notified | EntryState::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: EntryState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == EntryState::Failed || self.next() == Some(to)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry ended up in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Download did not finish within the configured timeout
    Timeout,
    /// Title could not be resolved without a human
    NeedsReview,
    /// Destination already exists
    Conflict,
    /// Backend reported the download task as failed
    DownloadFailed,
    /// Retryable errors hit the per-state attempt limit
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::NeedsReview => "needs_review",
            FailureReason::Conflict => "conflict",
            FailureReason::DownloadFailed => "download_failed",
            FailureReason::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "timeout" => Some(FailureReason::Timeout),
            "needs_review" => Some(FailureReason::NeedsReview),
            "conflict" => Some(FailureReason::Conflict),
            "download_failed" => Some(FailureReason::DownloadFailed),
            "retries_exhausted" => Some(FailureReason::RetriesExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
