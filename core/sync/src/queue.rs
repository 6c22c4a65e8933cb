//! Durable queue of writes waiting for the remote.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use draftsync_common::{Error, Record, Result, Timestamp};

/// What a queued mutation does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    /// Store a value.
    Save,
    /// Store a tombstone.
    Delete,
}

/// A write that has not yet been confirmed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Unique ID for this mutation.
    pub id: String,
    /// Kind of write.
    pub action: MutationAction,
    /// Target key.
    pub key: String,
    /// Value written (null for deletions).
    pub value: serde_json::Value,
    /// Modification time captured when the write happened.
    pub last_modified: Timestamp,
    /// When the mutation was queued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
    /// Queue entry carrying `record` to the remote.
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: if record.deleted {
                MutationAction::Delete
            } else {
                MutationAction::Save
            },
            key: record.key.clone(),
            value: record.value.clone(),
            last_modified: record.last_modified,
            enqueued_at: Utc::now(),
        }
    }

    /// Record to push when replaying this mutation.
    pub fn to_record(&self) -> Record {
        match self.action {
            MutationAction::Save => Record::new(&self.key, self.value.clone(), self.last_modified),
            MutationAction::Delete => Record::tombstone(&self.key, self.last_modified),
        }
    }
}

/// Persisted queue contents.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueState {
    /// Waiting to be drained, oldest first.
    pending: VecDeque<QueuedMutation>,
    /// Drained but not yet confirmed.
    in_flight: Vec<QueuedMutation>,
}

impl QueueState {
    /// Append, replacing any pending entry for the same key.
    fn push(&mut self, mutation: QueuedMutation) {
        self.pending.retain(|m| m.key != mutation.key);
        self.pending.push_back(mutation);
    }
}

/// FIFO of pending remote writes, durable across restarts.
///
/// `drain` moves items to an in-flight set that is persisted alongside the
/// pending list; only `confirm` forgets an item. After a crash, in-flight
/// items are loaded back as pending, so nothing unconfirmed is ever lost.
pub struct MutationQueue {
    state: Mutex<QueueState>,
    /// Path to persist the queue, `None` for memory-only queues.
    path: Option<PathBuf>,
}

impl MutationQueue {
    /// Open (or create) a queue persisted at `path`.
    ///
    /// # Errors
    /// - The queue file exists but cannot be read or parsed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let state = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let stored: QueueState = serde_json::from_str(&content)?;
            Self::recover(stored)
        } else {
            QueueState::default()
        };

        info!(
            "Mutation queue opened at {:?} with {} pending",
            path,
            state.pending.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Create a queue that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            path: None,
        }
    }

    /// Treat everything left in flight by a previous process as pending.
    fn recover(stored: QueueState) -> QueueState {
        if !stored.in_flight.is_empty() {
            warn!(
                "Recovering {} unconfirmed mutations from an interrupted drain",
                stored.in_flight.len()
            );
        }

        let mut state = QueueState::default();
        for mutation in stored.in_flight.into_iter().chain(stored.pending) {
            state.push(mutation);
        }
        state
    }

    /// Append a mutation.
    ///
    /// A pending mutation for the same key is superseded and removed.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!("Queueing {:?} for {}", mutation.action, mutation.key);
        state.push(mutation);
        self.persist(&state).await
    }

    /// Take every pending mutation for replay, oldest first.
    pub async fn drain(&self) -> Result<Vec<QueuedMutation>> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return Ok(Vec::new());
        }

        let drained: Vec<QueuedMutation> = state.pending.drain(..).collect();
        state.in_flight.extend(drained.iter().cloned());
        self.persist(&state).await?;

        debug!("Drained {} mutations", drained.len());
        Ok(drained)
    }

    /// Forget a drained mutation whose push was confirmed.
    pub async fn confirm(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.in_flight.len();
        state.in_flight.retain(|m| m.id != id);
        if state.in_flight.len() == before {
            return Err(Error::NotFound(format!("In-flight mutation not found: {}", id)));
        }
        self.persist(&state).await
    }

    /// Put a drained mutation back at the tail after a failed push.
    ///
    /// Dropped instead if a newer write for the same key is already pending.
    pub async fn requeue(&self, mutation: QueuedMutation) -> Result<()> {
        let mut state = self.state.lock().await;
        state.in_flight.retain(|m| m.id != mutation.id);

        let superseded = state
            .pending
            .iter()
            .any(|m| m.key == mutation.key && m.last_modified >= mutation.last_modified);
        if superseded {
            debug!("Dropping superseded mutation for {}", mutation.key);
        } else {
            state.push(mutation);
        }
        self.persist(&state).await
    }

    /// Copy of the pending mutations, oldest first.
    pub async fn snapshot(&self) -> Vec<QueuedMutation> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    /// Count of pending plus in-flight mutations.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.in_flight.len()
    }

    /// Check if nothing is waiting for the remote.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Persist the queue to disk.
    ///
    /// Writes a sibling temp file and renames it over the queue file so a
    /// crash never leaves a truncated queue behind.
    async fn persist(&self, state: &QueueState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}
