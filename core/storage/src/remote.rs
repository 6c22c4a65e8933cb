//! Remote replica abstraction and wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use draftsync_common::{Record, Result, Timestamp};

/// Version tag sent with every write.
pub const WIRE_VERSION: u32 = 1;

/// Networked key-value store scoped to one authenticated user.
///
/// # Errors
/// Every call fails with `Error::Network` while offline or when the transport
/// fails, `Error::Auth` when credentials are rejected, and `Error::Remote` for
/// any other unexpected response.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the provider name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Fetch one record.
    ///
    /// `Ok(None)` means the key has never been written remotely; it is not an
    /// error.
    async fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Write one record, keeping the caller's `last_modified`.
    async fn put(&self, record: &Record) -> Result<()>;

    /// Fetch every record in the user's data set.
    async fn list_all(&self) -> Result<BTreeMap<String, Record>>;
}

/// A record as carried over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Payload.
    pub data: serde_json::Value,
    /// Writer's modification time in milliseconds.
    pub timestamp: Timestamp,
    /// Wire format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Tombstone flag.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

fn default_version() -> u32 {
    WIRE_VERSION
}

impl WireEntry {
    /// Wire form of a record.
    pub fn from_record(record: &Record) -> Self {
        Self {
            data: record.value.clone(),
            timestamp: record.last_modified,
            version: WIRE_VERSION,
            deleted: record.deleted,
        }
    }

    /// Record stored under `key`.
    pub fn into_record(self, key: impl Into<String>) -> Record {
        Record {
            key: key.into(),
            value: self.data,
            last_modified: self.timestamp,
            deleted: self.deleted,
        }
    }
}
