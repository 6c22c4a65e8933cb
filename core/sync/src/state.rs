//! Sync reports and engine status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conflict::ConflictEntry;

/// Error message of a pass skipped because the device is offline.
pub const OFFLINE_MESSAGE: &str = "offline";
/// Error message of a pass aborted through its cancellation token.
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Outcome of one reconciliation pass.
///
/// Failures are reported here rather than raised, so callers inspect the
/// report instead of handling errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Whether the pass completed without failures.
    pub success: bool,
    /// Total writes performed: `replayed + pushed + pulled`.
    pub items_processed: usize,
    /// Write-write conflicts left for explicit resolution.
    pub conflicts: Vec<ConflictEntry>,
    /// First failure encountered, if any.
    pub error_message: Option<String>,
    /// Queued mutations pushed during replay.
    pub replayed: usize,
    /// Local records pushed during reconciliation.
    pub pushed: usize,
    /// Remote records pulled during reconciliation.
    pub pulled: usize,
    /// Writes that failed and were queued for the next pass.
    pub failed: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl SyncReport {
    /// Report for a pass that did nothing and failed with `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            items_processed: 0,
            conflicts: Vec::new(),
            error_message: Some(message.into()),
            replayed: 0,
            pushed: 0,
            pulled: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }

    /// Report for a pass skipped while offline.
    pub fn offline() -> Self {
        Self::failure(OFFLINE_MESSAGE)
    }

    /// Whether the pass was skipped while offline.
    pub fn is_offline(&self) -> bool {
        self.error_message.as_deref() == Some(OFFLINE_MESSAGE)
    }

    /// Whether the pass was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.error_message.as_deref() == Some(CANCELLED_MESSAGE)
    }
}

/// Counters accumulated while a pass runs.
#[derive(Debug, Default)]
pub(crate) struct PassTally {
    pub replayed: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub failed: usize,
    pub conflicts: Vec<ConflictEntry>,
    pub first_error: Option<String>,
}

impl PassTally {
    /// Remember a failure; the first one becomes the report's message.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.into());
        }
    }

    /// Report with these counters and an explicit outcome.
    pub fn finish(self, abort: Option<String>, duration: Duration) -> SyncReport {
        let error_message = abort.or(self.first_error);
        SyncReport {
            success: error_message.is_none(),
            items_processed: self.replayed + self.pushed + self.pulled,
            conflicts: self.conflicts,
            error_message,
            replayed: self.replayed,
            pushed: self.pushed,
            pulled: self.pulled,
            failed: self.failed,
            duration,
        }
    }
}

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// No pass in flight.
    Idle,
    /// A reconciliation pass is running.
    Syncing,
}

/// Observable engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    /// Current activity.
    pub status: SyncStatus,
    /// Report of the most recent pass.
    pub last_report: Option<SyncReport>,
    /// When the most recent pass finished.
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Create a new idle state.
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Idle,
            last_report: None,
            last_sync: None,
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offline_report() {
        let report = SyncReport::offline();
        assert!(!report.success);
        assert!(report.is_offline());
        assert_eq!(report.items_processed, 0);
    }

    #[test]
    fn test_tally_success() {
        let tally = PassTally {
            replayed: 1,
            pushed: 2,
            pulled: 3,
            ..PassTally::default()
        };
        let report = tally.finish(None, Duration::from_millis(5));
        assert!(report.success);
        assert_eq!(report.items_processed, 6);
        assert!(report.error_message.is_none());
    }

    #[test]
    fn test_tally_keeps_first_failure() {
        let mut tally = PassTally::default();
        tally.record_failure("first");
        tally.record_failure("second");
        let report = tally.finish(None, Duration::ZERO);
        assert!(!report.success);
        assert_eq!(report.failed, 2);
        assert_eq!(report.error_message.as_deref(), Some("first"));
    }

    #[test]
    fn test_report_serialization_format() {
        let mut report = SyncReport::failure("boom");
        report.conflicts.push(ConflictEntry {
            key: "k2".to_string(),
            local_value: json!("X"),
            remote_value: json!("Y"),
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["itemsProcessed"], 0);
        assert_eq!(json["errorMessage"], "boom");
        assert_eq!(json["conflicts"][0]["localValue"], "X");
    }
}
