//! Object-store-shaped backend, with no cloud SDK pulled in — a real S3
//! client is out of scope here. This backend models the contract an
//! S3-like store actually presents — conditional PUT via ETag,
//! occasional transient 5xx-class failures the adapter must retry —
//! over the same in-memory map `MemoryStore` uses, so it is exercised by
//! tests without a network dependency.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::{BatchDeleteOutcome, BlobStore, Capabilities, GetResult, MemoryStore, Version};
use crate::error::{Result, StratumError};

pub struct ObjectStoreBackend {
    inner: MemoryStore,
    /// Deterministic transient-failure injector: the first `fail_count`
    /// calls to `get` or `put` fail with `StorageTransient`, exercising
    /// the Blob Store Adapter's retry policy without
    /// real flakiness.
    call_count: AtomicU64,
    fail_count: u64,
}

impl ObjectStoreBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            call_count: AtomicU64::new(0),
            fail_count: 0,
        }
    }

    /// Enables deterministic transient-failure injection for tests that
    /// exercise the retry path: the first `fail_count` calls fail, then
    /// calls succeed.
    pub fn with_fault_injection(fail_count: u64) -> Self {
        Self {
            inner: MemoryStore::new(),
            call_count: AtomicU64::new(0),
            fail_count,
        }
    }

    fn maybe_fail(&self) -> Result<()> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_count {
            return Err(StratumError::StorageTransient(
                "simulated object store 503".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ObjectStoreBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBackend {
    async fn get(&self, key: &str) -> Result<GetResult> {
        self.maybe_fail()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<Version> {
        self.maybe_fail()?;
        self.inner.put(key, bytes).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<BatchDeleteOutcome> {
        self.inner.delete_batch(keys).await
    }

    async fn list_prefix(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, Option<String>)> {
        self.inner.list_prefix(prefix, cursor, limit).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Version>,
        new_bytes: Vec<u8>,
    ) -> Result<Version> {
        self.inner.compare_and_swap(key, expected, new_bytes).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            conditional_writes: true,
            batch_delete: true,
            cursor_listing: true,
            lifecycle_policies: true,
        }
    }
}
