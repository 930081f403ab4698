//! Blob Store Adapter: a thin uniform key→bytes
//! interface over pluggable backends.
//!
//! Grounded on `helix_engine::storage_core::storage_methods`'s pattern of
//! one trait implemented per backend behind a feature flag
//! (`StorageMethods` for `lmdb`/`rocks`/`slate`); here the backends are
//! selected at runtime via `BlobStoreConfig::backend` instead, since all
//! three ship unconditionally and are cheap enough not to gate behind
//! Cargo features.

mod local_fs;
mod memory;
mod object_store;

pub use local_fs::LocalFsStore;
pub use memory::MemoryStore;
pub use object_store::ObjectStoreBackend;

use async_trait::async_trait;
use std::time::Duration;

use crate::config::{BlobStoreBackend, BlobStoreConfig};
use crate::error::{Result, StratumError};

/// Opaque version token returned by `put`/`get`, used by
/// `compare_and_swap`. Backends that lack a native ETag (local FS)
/// simulate one with a content hash plus a lockfile-guarded counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version(pub String);

/// What a backend actually supports, so callers can choose a strategy
/// (e.g. the COW store falls back to an advisory lock if
/// `conditional_writes` is false).
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    pub conditional_writes: bool,
    pub batch_delete: bool,
    pub cursor_listing: bool,
    pub lifecycle_policies: bool,
}

/// Outcome of `get`: distinguishes "not found" from a transport error,
/// which surfaces as `Err` instead.
pub enum GetResult {
    Found(Vec<u8>, Version),
    NotFound,
}

/// Per-item outcome of a batch delete; partial success is not itself a
/// fatal error.
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<GetResult>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<Version>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn delete_batch(&self, keys: &[String]) -> Result<BatchDeleteOutcome>;
    async fn list_prefix(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, Option<String>)>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Version>,
        new_bytes: Vec<u8>,
    ) -> Result<Version>;
    fn capabilities(&self) -> Capabilities;
}

/// Builds the configured backend.
pub fn build_backend(config: &BlobStoreConfig, root: std::path::PathBuf) -> Box<dyn BlobStore> {
    match config.backend {
        BlobStoreBackend::LocalFs => Box::new(LocalFsStore::new(root, config.gzip)),
        BlobStoreBackend::Memory => Box::new(MemoryStore::new()),
        BlobStoreBackend::ObjectStore => Box::new(ObjectStoreBackend::new()),
    }
}

/// Retry policy for transient-class errors: exponential backoff applies
/// only to `StorageTransient` failures, capped at 10s and 3 attempts by
/// default.
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Runs `op`, retrying only `StorageTransient` failures, up to
    /// `max_attempts` times total.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    tracing::warn!(attempt, "transient blob store error, retrying: {e}");
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) fn not_found(key: &str) -> StratumError {
    StratumError::not_found("blob", key)
}
