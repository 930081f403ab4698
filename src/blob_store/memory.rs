//! Single-process in-memory backend, grounded on 
//! `papaya::HashMap` concurrent-map usage in `vector_core::hnsw`.
//! Used heavily in this crate's own test suite, where a fresh in-memory
//! store stands in for a throwaway database directory.

use async_trait::async_trait;
use papaya::HashMap;
use sha2::{Digest, Sha256};

use super::{BatchDeleteOutcome, BlobStore, Capabilities, GetResult, Version};
use crate::error::{Result, StratumError};

pub struct MemoryStore {
    data: HashMap<String, (Vec<u8>, Version)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    fn version_of(bytes: &[u8]) -> Version {
        let digest = Sha256::digest(bytes);
        Version(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<GetResult> {
        let guard = self.data.pin();
        match guard.get(key) {
            Some((bytes, version)) => Ok(GetResult::Found(bytes.clone(), version.clone())),
            None => Ok(GetResult::NotFound),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<Version> {
        let version = Self::version_of(&bytes);
        let guard = self.data.pin();
        guard.insert(key.to_string(), (bytes, version.clone()));
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let guard = self.data.pin();
        guard.remove(key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<BatchDeleteOutcome> {
        let guard = self.data.pin();
        let deleted: Vec<String> = keys
            .iter()
            .filter(|k| {
                guard.remove(k.as_str());
                true
            })
            .cloned()
            .collect();
        Ok(BatchDeleteOutcome {
            deleted,
            failed: Vec::new(),
        })
    }

    async fn list_prefix(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let guard = self.data.pin();
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        let start = match cursor {
            Some(c) => keys.iter().position(|k| k.as_str() > c.as_str()).unwrap_or(keys.len()),
            None => 0,
        };
        let limit = limit.unwrap_or(keys.len());
        let page: Vec<String> = keys[start..].iter().take(limit).cloned().collect();
        let next_cursor = if start + page.len() < keys.len() {
            page.last().cloned()
        } else {
            None
        };
        Ok((page, next_cursor))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let guard = self.data.pin();
        Ok(guard.contains_key(key))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Version>,
        new_bytes: Vec<u8>,
    ) -> Result<Version> {
        let guard = self.data.pin();
        let current_version = guard.get(key).map(|(_, v)| v.clone());
        if current_version.as_ref() != expected {
            return Err(StratumError::ConcurrentWrite {
                branch: key.to_string(),
            });
        }
        let version = Self::version_of(&new_bytes);
        guard.insert(key.to_string(), (new_bytes, version.clone()));
        Ok(version)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            conditional_writes: true,
            batch_delete: true,
            cursor_listing: true,
            lifecycle_policies: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_idempotent_on_identical_bytes() {
        let store = MemoryStore::new();
        let v1 = store.put("k", b"same".to_vec()).await.unwrap();
        let v2 = store.put("k", b"same".to_vec()).await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn cas_conflict_is_distinct_error() {
        let store = MemoryStore::new();
        store.put("k", b"v1".to_vec()).await.unwrap();
        let err = store
            .compare_and_swap("k", None, b"v2".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::ConcurrentWrite { .. }));
    }
}
