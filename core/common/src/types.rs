//! Common types used throughout DraftSync.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Check that a key can be stored in either replica.
///
/// # Errors
/// - Returns error if the key is empty
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Record key cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// A single value held by a replica.
///
/// `last_modified` is stamped by whoever performed the write and is the only
/// ordering signal between replicas. A deletion is stored as a tombstone
/// (`deleted == true`, `value == null`) so that it travels through
/// reconciliation like any other write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Key, unique within the user's namespace.
    pub key: String,
    /// Opaque payload.
    pub value: serde_json::Value,
    /// Time of the write that produced this record.
    pub last_modified: Timestamp,
    /// Tombstone flag.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Record {
    /// Create a live record.
    pub fn new(key: impl Into<String>, value: serde_json::Value, last_modified: Timestamp) -> Self {
        Self {
            key: key.into(),
            value,
            last_modified,
            deleted: false,
        }
    }

    /// Create a tombstone for `key`.
    pub fn tombstone(key: impl Into<String>, last_modified: Timestamp) -> Self {
        Self {
            key: key.into(),
            value: serde_json::Value::Null,
            last_modified,
            deleted: true,
        }
    }

    /// Whether this record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Whether two records carry the same content, ignoring timestamps.
    pub fn same_content(&self, other: &Record) -> bool {
        self.deleted == other.deleted && self.value == other.value
    }
}
