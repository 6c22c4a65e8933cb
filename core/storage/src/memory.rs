//! In-memory replicas for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use draftsync_common::{validate_key, Error, Record, Result};

use crate::connectivity::ConnectivityMonitor;
use crate::local::LocalStore;
use crate::remote::RemoteStore;

/// In-memory local store.
///
/// All data is stored in memory and lost on drop.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: RwLock<BTreeMap<String, Record>>,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.records.read().unwrap().get(key).cloned())
    }

    fn put_record(&self, record: &Record) -> Result<()> {
        validate_key(&record.key)?;
        self.records
            .write()
            .unwrap()
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn apply_remote(&self, record: &Record) -> Result<bool> {
        validate_key(&record.key)?;
        let mut records = self.records.write().unwrap();
        match records.get(&record.key) {
            Some(existing) if existing.last_modified >= record.last_modified => Ok(false),
            _ => {
                records.insert(record.key.clone(), record.clone());
                Ok(true)
            }
        }
    }

    fn list_all(&self, prefix: &str) -> Result<BTreeMap<String, Record>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    fn rollback(&self, written: &Record, previous: Option<&Record>) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        if records.get(&written.key) != Some(written) {
            return Ok(false);
        }
        match previous {
            Some(previous) => records.insert(written.key.clone(), previous.clone()),
            None => records.remove(&written.key),
        };
        Ok(true)
    }
}

/// Failure injected into a [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Fail like an unreachable host.
    Network,
    /// Fail like rejected credentials.
    Auth,
    /// Fail like a 5xx response.
    Server,
}

impl InjectedFailure {
    fn to_error(self, op: &str) -> Error {
        match self {
            InjectedFailure::Network => Error::Network(format!("{}: connection refused", op)),
            InjectedFailure::Auth => Error::Auth(format!("{}: token rejected", op)),
            InjectedFailure::Server => Error::Remote {
                status: 503,
                message: format!("{}: service unavailable", op),
            },
        }
    }
}

/// In-memory remote store.
///
/// Honors an optional connectivity monitor and supports failure injection,
/// which makes it the remote of choice for engine tests and offline demos.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    records: Arc<RwLock<BTreeMap<String, Record>>>,
    failure: Arc<RwLock<Option<InjectedFailure>>>,
    /// Remaining successful puts before `failure` applies to puts.
    puts_before_failure: Arc<RwLock<Option<usize>>>,
    connectivity: Option<ConnectivityMonitor>,
    put_count: Arc<AtomicUsize>,
}

impl MemoryRemoteStore {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote that fails with `Network` while `connectivity` is offline.
    pub fn with_connectivity(connectivity: ConnectivityMonitor) -> Self {
        Self {
            connectivity: Some(connectivity),
            ..Self::default()
        }
    }

    /// Make every subsequent call fail, or clear the failure with `None`.
    pub fn set_failure(&self, failure: Option<InjectedFailure>) {
        *self.failure.write().unwrap() = failure;
        *self.puts_before_failure.write().unwrap() = None;
    }

    /// Let `successes` puts through, then fail puts with `failure`.
    pub fn fail_puts_after(&self, successes: usize, failure: InjectedFailure) {
        *self.failure.write().unwrap() = Some(failure);
        *self.puts_before_failure.write().unwrap() = Some(successes);
    }

    /// Seed a record directly, bypassing failure injection.
    pub fn insert(&self, record: Record) {
        self.records
            .write()
            .unwrap()
            .insert(record.key.clone(), record);
    }

    /// Read a record directly, bypassing failure injection.
    pub fn peek(&self, key: &str) -> Option<Record> {
        self.records.read().unwrap().get(key).cloned()
    }

    /// Number of successful puts so far.
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    fn check(&self, op: &str) -> Result<()> {
        if let Some(connectivity) = &self.connectivity {
            if !connectivity.is_online() {
                return Err(Error::Network("offline".to_string()));
            }
        }
        // Put-only failures are handled in `check_put`.
        if self.puts_before_failure.read().unwrap().is_some() {
            return Ok(());
        }
        match *self.failure.read().unwrap() {
            Some(failure) => Err(failure.to_error(op)),
            None => Ok(()),
        }
    }

    fn check_put(&self) -> Result<()> {
        self.check("put")?;
        let mut remaining = self.puts_before_failure.write().unwrap();
        if let Some(left) = remaining.as_mut() {
            if *left == 0 {
                let failure = self.failure.read().unwrap().unwrap_or(InjectedFailure::Network);
                return Err(failure.to_error("put"));
            }
            *left -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.check("get")?;
        Ok(self.peek(key))
    }

    async fn put(&self, record: &Record) -> Result<()> {
        validate_key(&record.key)?;
        self.check_put()?;
        self.insert(record.clone());
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, Record>> {
        self.check("list")?;
        Ok(self.records.read().unwrap().clone())
    }
}
