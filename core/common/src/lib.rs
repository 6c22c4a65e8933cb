//! Common utilities and types shared across DraftSync modules.
//!
//! This module provides the record model and the error taxonomy used by the
//! storage adapters and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{now_millis, validate_key, Record, Timestamp};
