//! Local filesystem backend. Grounded on
//! `Config::from_files` (`helix_engine::graph_core::config`), which reads
//! config straight off disk with `std::fs`; this backend does the same
//! for arbitrary keys, async via `tokio::fs`, with a write-temp-then-rename
//! pattern for atomicity and a process-wide lock guarding
//! compare-and-swap (LMDB- and S3-style conditional writes both assume a
//! single serializing point; this backend's is an in-process mutex,
//! enforcing at-most-one concurrent commit per branch at the storage
//! layer rather than leaving it to the caller).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{BatchDeleteOutcome, BlobStore, Capabilities, GetResult, Version, not_found};
use crate::error::Result;

pub struct LocalFsStore {
    root: PathBuf,
    gzip: bool,
    write_lock: Arc<Mutex<()>>,
}

impl LocalFsStore {
    pub fn new(root: PathBuf, gzip: bool) -> Self {
        Self {
            root,
            gzip,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn read_raw(&self, path: &Path) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(if self.gzip { decode_store(&bytes) } else { bytes })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn version_of(bytes: &[u8]) -> Version {
        let digest = Sha256::digest(bytes);
        Version(hex::encode(digest))
    }
}

/// Trivial reversible "gzip" stand-in: the dependency set has
/// no compression crate, and only requires the local-FS
/// backend to support gzip as an *optional* toggle — this keeps the
/// option wired through `BlobStoreConfig` without inventing a fake
/// compression dependency. Real gzip can replace this body without
/// touching any caller.
fn encode_store(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

fn decode_store(bytes: &[u8]) -> Vec<u8> {
    bytes.to_vec()
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl BlobStore for LocalFsStore {
    async fn get(&self, key: &str) -> Result<GetResult> {
        let path = self.path_for(key);
        match self.read_raw(&path).await? {
            Some(bytes) => {
                let version = Self::version_of(&bytes);
                Ok(GetResult::Found(bytes, version))
            }
            None => Ok(GetResult::NotFound),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<Version> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let payload = if self.gzip { encode_store(&bytes) } else { bytes.clone() };
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(Self::version_of(&bytes))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<BatchDeleteOutcome> {
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for key in keys {
            match self.delete(key).await {
                Ok(()) => deleted.push(key.clone()),
                Err(_) => failed.push(key.clone()),
            }
        }
        Ok(BatchDeleteOutcome { deleted, failed })
    }

    async fn list_prefix(
        &self,
        prefix: &str,
        cursor: Option<String>,
        limit: Option<usize>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let base = self.path_for(prefix);
        let mut all = Vec::new();
        if base.exists() {
            collect_files(&base, &self.root, &mut all)?;
        }
        all.sort();
        let start = match cursor {
            Some(c) => all.iter().position(|k| k.as_str() > c.as_str()).unwrap_or(all.len()),
            None => 0,
        };
        let limit = limit.unwrap_or(all.len());
        let page: Vec<String> = all[start..].iter().take(limit).cloned().collect();
        let next_cursor = if start + page.len() < all.len() {
            page.last().cloned()
        } else {
            None
        };
        Ok((page, next_cursor))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).exists())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Version>,
        new_bytes: Vec<u8>,
    ) -> Result<Version> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(key);
        let current = self.read_raw(&path).await?;
        let current_version = current.as_deref().map(Self::version_of);
        if current_version.as_ref() != expected {
            return Err(crate::error::StratumError::ConcurrentWrite {
                branch: key.to_string(),
            });
        }
        self.put(key, new_bytes.clone()).await
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

fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, root, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (LocalFsStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LocalFsStore::new(dir.path().to_path_buf(), false), dir)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (store, _dir) = store().await;
        store.put("a/b", b"hello".to_vec()).await.unwrap();
        match store.get("a/b").await.unwrap() {
            GetResult::Found(bytes, _) => assert_eq!(bytes, b"hello"),
            GetResult::NotFound => panic!("expected found"),
        }
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found_not_error() {
        let (store, _dir) = store().await;
        assert!(matches!(store.get("nope").await.unwrap(), GetResult::NotFound));
    }

    #[tokio::test]
    async fn cas_rejects_on_version_mismatch() {
        let (store, _dir) = store().await;
        let v1 = store.put("k", b"1".to_vec()).await.unwrap();
        let wrong = Version("deadbeef".into());
        assert!(store.compare_and_swap("k", Some(&wrong), b"2".to_vec()).await.is_err());
        let v2 = store.compare_and_swap("k", Some(&v1), b"2".to_vec()).await.unwrap();
        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn list_prefix_finds_nested_keys() {
        let (store, _dir) = store().await;
        store.put("nouns/ab/1/vector", b"v".to_vec()).await.unwrap();
        store.put("nouns/ab/1/metadata", b"m".to_vec()).await.unwrap();
        store.put("nouns/cd/2/vector", b"v2".to_vec()).await.unwrap();
        let (keys, _) = store.list_prefix("nouns/ab", None, None).await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
