//! Error kinds surfaced by every component of the core, grounded on
//! `helix_engine::types::GraphError`: a hand-rolled
//! enum with a manual `Display` impl and `From` conversions at the IO
//! edges, rather than a `thiserror`-derived type.

use core::fmt;
use std::io;

/// Structured error type shared by every module in this crate.
#[derive(Debug)]
pub enum StratumError {
    /// Requested id or key is absent. Expected in normal operation.
    NotFound { what: String, key: String },
    /// Id collision on an explicit-id insert.
    AlreadyExists { key: String },
    /// Dimension mismatch, malformed metadata, or a type outside the
    /// noun/verb taxonomy.
    InvalidInput(String),
    /// Chunk checksum failure, a dangling HNSW neighbor, or an LSM
    /// tombstone that contradicts live data. Carries enough context to
    /// find the exact failing unit.
    IndexCorruption {
        index: &'static str,
        detail: String,
    },
    /// Retryable IO (timeout, 5xx, conflict) after policy is exhausted.
    StorageTransient(String),
    /// Non-retryable IO (auth, quota, precondition).
    StoragePermanent(String),
    /// The COW branch-ref compare-and-swap lost a race. Caller must
    /// rebase: re-read the branch and retry the logical operation.
    ConcurrentWrite { branch: String },
    /// A pagination cursor refers to a commit that is no longer current.
    CursorInvalidated,
    /// Deadline exceeded or explicit cancellation.
    Cancelled,
    /// An item is larger than the Unified Cache's total capacity.
    CapacityExceeded { requested: usize, capacity: usize },
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StratumError::NotFound { what, key } => write!(f, "{what} not found: {key}"),
            StratumError::AlreadyExists { key } => write!(f, "already exists: {key}"),
            StratumError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            StratumError::IndexCorruption { index, detail } => {
                write!(f, "index corruption in {index}: {detail}")
            }
            StratumError::StorageTransient(msg) => write!(f, "transient storage error: {msg}"),
            StratumError::StoragePermanent(msg) => write!(f, "permanent storage error: {msg}"),
            StratumError::ConcurrentWrite { branch } => {
                write!(f, "concurrent write lost the race on branch {branch}")
            }
            StratumError::CursorInvalidated => write!(f, "cursor invalidated by a newer commit"),
            StratumError::Cancelled => write!(f, "operation cancelled"),
            StratumError::CapacityExceeded {
                requested,
                capacity,
            } => write!(
                f,
                "item of {requested} bytes exceeds cache capacity of {capacity} bytes"
            ),
        }
    }
}

impl std::error::Error for StratumError {}

impl From<io::Error> for StratumError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StratumError::NotFound {
                what: "blob".into(),
                key: err.to_string(),
            },
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                StratumError::StorageTransient(err.to_string())
            }
            _ => StratumError::StoragePermanent(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        StratumError::InvalidInput(format!("json error: {err}"))
    }
}

impl From<bincode::Error> for StratumError {
    fn from(err: bincode::Error) -> Self {
        StratumError::InvalidInput(format!("bincode error: {err}"))
    }
}

impl From<uuid::Error> for StratumError {
    fn from(err: uuid::Error) -> Self {
        StratumError::InvalidInput(format!("uuid error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;

impl StratumError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StratumError::StorageTransient(_))
    }

    pub fn not_found(what: impl Into<String>, key: impl Into<String>) -> Self {
        StratumError::NotFound {
            what: what.into(),
            key: key.into(),
        }
    }

    pub fn corruption(index: &'static str, detail: impl Into<String>) -> Self {
        StratumError::IndexCorruption {
            index,
            detail: detail.into(),
        }
    }
}
