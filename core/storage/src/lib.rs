//! Replica adapters for DraftSync.
//!
//! This module provides the two stores the sync engine reconciles, plus the
//! connectivity signal that gates remote traffic:
//! - [`LocalStore`]: durable on-device persistence (SQLite or in-memory)
//! - [`RemoteStore`]: user-scoped networked store (HTTP or in-memory)
//! - [`ConnectivityMonitor`]: observable online/offline state
//!
//! # Design Principles
//! - Local calls never suspend; remote calls are async
//! - "Not found" on the remote is a value, not an error
//! - Unified error semantics across adapters

pub mod connectivity;
pub mod http;
pub mod local;
pub mod memory;
pub mod remote;

pub use connectivity::{ConnectivityMonitor, ConnectivitySubscription};
pub use http::{HttpRemoteStore, RemoteConfig};
pub use local::{LocalStore, SqliteLocalStore, DEFAULT_NAMESPACE};
pub use memory::{InjectedFailure, MemoryLocalStore, MemoryRemoteStore};
pub use remote::{RemoteStore, WireEntry, WIRE_VERSION};
