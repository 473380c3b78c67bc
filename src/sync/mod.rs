//! Fleet sync: push locally originated rows to the shared remote store, pull
//! rows written by other kiosks, and reconcile them into the local store.
//!
//! A round walks `Idle → Collecting → Pushing → Pulling → Reconciling → Idle`.
//! Any remote phase may fail; a failed round waits out a backoff delay and
//! starts collecting again. The local store stays fully usable while sync is
//! failing, it is merely stale.

pub mod backoff;
pub mod checksum;
pub mod engine;
pub mod poller;
pub mod reconcile;
pub mod remote;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SyncErrorReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Collecting,
    Pushing,
    Pulling,
    Reconciling,
    Failed,
    Backoff,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Collecting => "collecting",
            SyncState::Pushing => "pushing",
            SyncState::Pulling => "pulling",
            SyncState::Reconciling => "reconciling",
            SyncState::Failed => "failed",
            SyncState::Backoff => "backoff",
        }
    }

    /// Allowed transitions. Returning to `Idle` is always allowed (shutdown,
    /// or a round abandoned on a fatal local error).
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (_, Idle)
                | (Idle, Collecting)
                | (Backoff, Collecting)
                | (Collecting, Pushing)
                | (Pushing, Pulling)
                | (Pulling, Reconciling)
                | (Pushing, Failed)
                | (Pulling, Failed)
                | (Reconciling, Failed)
                | (Failed, Backoff)
        )
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the sync engine for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<SyncErrorReport>,
    /// Set when a failure was escalated and needs a person to look at it.
    /// Cleared by the next fully successful round.
    pub operator_alert: Option<SyncErrorReport>,
    pub consecutive_failures: u32,
    /// Locally originated rows not yet confirmed by the remote, as of the
    /// last collection.
    pub pending: i64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_success: None,
            last_error: None,
            operator_alert: None,
            consecutive_failures: 0,
            pending: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            SyncState::Idle,
            SyncState::Collecting,
            SyncState::Pushing,
            SyncState::Pulling,
            SyncState::Reconciling,
            SyncState::Idle,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failure_path_transitions() {
        for from in [SyncState::Pushing, SyncState::Pulling, SyncState::Reconciling] {
            assert!(from.can_transition_to(SyncState::Failed));
        }
        assert!(SyncState::Failed.can_transition_to(SyncState::Backoff));
        assert!(SyncState::Backoff.can_transition_to(SyncState::Collecting));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!SyncState::Idle.can_transition_to(SyncState::Pushing));
        assert!(!SyncState::Collecting.can_transition_to(SyncState::Failed));
        assert!(!SyncState::Collecting.can_transition_to(SyncState::Reconciling));
        assert!(!SyncState::Failed.can_transition_to(SyncState::Collecting));
        assert!(!SyncState::Backoff.can_transition_to(SyncState::Pushing));
        assert!(!SyncState::Pulling.can_transition_to(SyncState::Pushing));
    }
}
