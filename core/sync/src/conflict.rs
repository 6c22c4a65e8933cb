//! Conflict detection and resolution.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use draftsync_common::{now_millis, Error, Record, Result, Timestamp};
use draftsync_storage::{LocalStore, RemoteStore};

use crate::queue::{MutationQueue, QueuedMutation};
use crate::retry::RetryExecutor;

/// A write-write conflict: equal timestamps, different content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    /// Conflicting key.
    pub key: String,
    /// Local payload (null for a tombstone).
    pub local_value: serde_json::Value,
    /// Remote payload (null for a tombstone).
    pub remote_value: serde_json::Value,
}

/// How a key present in both replicas should converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Local is newer: push it.
    Push,
    /// Remote is newer: pull it.
    Pull,
    /// Already converged.
    InSync,
    /// Same timestamp, different content.
    Conflict,
}

/// Decide how two copies of one key converge.
///
/// `last_modified` is the only ordering signal; equal timestamps with equal
/// content are treated as converged so repeated passes stay quiet.
pub fn compare(local: &Record, remote: &Record) -> Verdict {
    match local.last_modified.cmp(&remote.last_modified) {
        Ordering::Greater => Verdict::Push,
        Ordering::Less => Verdict::Pull,
        Ordering::Equal if local.same_content(remote) => Verdict::InSync,
        Ordering::Equal => Verdict::Conflict,
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local value everywhere.
    Local,
    /// Keep the remote value everywhere.
    Remote,
    /// Combine both values with the configured [`Merger`].
    Merge,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge => "merge",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(Error::InvalidInput(format!(
                "Unknown strategy '{}'. Use: local, remote, or merge",
                other
            ))),
        }
    }
}

/// Combines two conflicting payloads into one.
///
/// Implement this to plug payload-aware merging into the resolver.
pub trait Merger: Send + Sync {
    /// Produce the merged payload.
    fn merge(&self, local: &serde_json::Value, remote: &serde_json::Value) -> serde_json::Value;
}

/// Shallow field union: remote object fields overlaid by local ones.
///
/// Not aware of the payload's meaning. If either side is not a JSON object the
/// local value wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShallowMerge;

impl Merger for ShallowMerge {
    fn merge(&self, local: &serde_json::Value, remote: &serde_json::Value) -> serde_json::Value {
        match (local, remote) {
            (serde_json::Value::Object(local), serde_json::Value::Object(remote)) => {
                let mut merged = remote.clone();
                for (field, value) in local {
                    merged.insert(field.clone(), value.clone());
                }
                serde_json::Value::Object(merged)
            }
            _ => local.clone(),
        }
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    /// Record now stored locally (and remotely unless deferred).
    pub record: Record,
    /// The remote write failed transiently and was queued instead.
    pub remote_deferred: bool,
}

/// Applies a [`ConflictStrategy`] to one key across both replicas.
pub struct ConflictResolver {
    merger: Arc<dyn Merger>,
}

impl ConflictResolver {
    /// Create a resolver using `merger` for [`ConflictStrategy::Merge`].
    pub fn new(merger: Arc<dyn Merger>) -> Self {
        Self { merger }
    }

    /// Pick the surviving record for `key`.
    ///
    /// The result carries a timestamp newer than both inputs so that no
    /// straggling pass can override the resolution.
    pub fn select(
        &self,
        key: &str,
        local: Option<&Record>,
        remote: Option<&Record>,
        strategy: ConflictStrategy,
        now: Timestamp,
    ) -> Result<Record> {
        let newest = local
            .iter()
            .chain(remote.iter())
            .map(|r| r.last_modified)
            .max()
            .ok_or_else(|| Error::NotFound(format!("No record for {} in either store", key)))?;
        let stamp = now.max(newest.saturating_add(1));

        let chosen = match strategy {
            ConflictStrategy::Local => local,
            ConflictStrategy::Remote => remote,
            ConflictStrategy::Merge => match (local, remote) {
                (Some(l), Some(r)) if !l.deleted && !r.deleted => {
                    return Ok(Record::new(
                        key,
                        self.merger.merge(&l.value, &r.value),
                        stamp,
                    ));
                }
                // Merging with a tombstone or a missing side keeps the live value.
                (Some(l), Some(r)) => Some(if l.deleted { r } else { l }),
                (only @ Some(_), None) | (None, only @ Some(_)) => only,
                (None, None) => None,
            },
        };

        let chosen = chosen.ok_or_else(|| {
            Error::Resolution(format!("{} side has no record for {}", strategy, key))
        })?;
        Ok(restamp(chosen, stamp))
    }

    /// Resolve `key` with `strategy`, writing the result to both stores.
    ///
    /// Local is written first. A transient remote failure queues the write
    /// (`remote_deferred`). A rejected remote write restores the previous local
    /// state, removing the key if it was absent, and fails. A local write made
    /// by the app in the meantime is left in place.
    ///
    /// # Errors
    /// - `NotFound` if neither store knows the key
    /// - `Resolution` if a store cannot be read or written
    pub async fn resolve<L, R>(
        &self,
        key: &str,
        strategy: ConflictStrategy,
        local: &L,
        remote: &R,
        queue: &MutationQueue,
        retry: &RetryExecutor,
    ) -> Result<ResolutionOutcome>
    where
        L: LocalStore + ?Sized,
        R: RemoteStore + ?Sized,
    {
        let local_record = local
            .get(key)
            .map_err(|e| Error::Resolution(format!("Cannot read local {}: {}", key, e)))?;
        let remote_record = retry
            .execute(|| remote.get(key))
            .await
            .map_err(|e| Error::Resolution(format!("Cannot read remote {}: {}", key, e)))?;

        let resolved = self.select(
            key,
            local_record.as_ref(),
            remote_record.as_ref(),
            strategy,
            now_millis(),
        )?;

        local
            .put_record(&resolved)
            .map_err(|e| Error::Resolution(format!("Cannot write local {}: {}", key, e)))?;

        match retry.execute(|| remote.put(&resolved)).await {
            Ok(()) => {
                info!("Resolved {} with {} strategy", key, strategy);
                Ok(ResolutionOutcome {
                    record: resolved,
                    remote_deferred: false,
                })
            }
            Err(err) if err.is_retryable() => {
                warn!("Remote write for {} deferred: {}", key, err);
                queue
                    .enqueue(QueuedMutation::from_record(&resolved))
                    .await
                    .map_err(|e| Error::Resolution(format!("Cannot queue {}: {}", key, e)))?;
                Ok(ResolutionOutcome {
                    record: resolved,
                    remote_deferred: true,
                })
            }
            Err(err) => {
                // Undo the local half unless the app has written since.
                match local.rollback(&resolved, local_record.as_ref()) {
                    Ok(true) => debug!("Restored local {} after rejected resolution", key),
                    Ok(false) => warn!("Local {} changed during resolution, keeping it", key),
                    Err(e) => {
                        warn!("Failed to restore local {} after rejected resolution: {}", key, e)
                    }
                }
                Err(Error::Resolution(format!(
                    "Remote rejected resolution of {}: {}",
                    key, err
                )))
            }
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Arc::new(ShallowMerge))
    }
}

fn restamp(record: &Record, stamp: Timestamp) -> Record {
    Record {
        last_modified: stamp,
        ..record.clone()
    }
}
