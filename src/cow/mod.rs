//! COW Object Store: content-addressed blob/tree/commit
//! objects with branch refs, built atop the Blob Store Adapter.
//!
//! Grounded on `helix_engine::storage_core::txn::Txn` for
//! the read/write transaction split (`readBranchAt` here plays the role
//! of a read-only txn snapshot; `create_commit` the role of a write txn
//! that must be serialized). Object hashing is content-addressed SHA-256
//!, deduplicating identical blobs automatically.

pub mod hash;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::blob_store::{BlobStore, GetResult, Version};
use crate::error::{Result, StratumError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Blob,
    Tree,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    pub tree_hash: String,
    pub parent_hash: Option<String>,
    pub author: String,
    pub timestamp_ms: i64,
    pub message: String,
    pub branch: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BranchRef {
    commit: String,
    updated: i64,
}

pub struct CowStore {
    store: Arc<dyn BlobStore>,
}

const MAX_COMMIT_RETRIES: u32 = 5;

impl CowStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    fn blob_key(hash: &str) -> String {
        format!("_cow/blobs/{}/{}", hash::shard_prefix(hash), hash)
    }

    fn tree_key(hash: &str) -> String {
        format!("_cow/trees/{}/{}", hash::shard_prefix(hash), hash)
    }

    fn commit_key(hash: &str) -> String {
        format!("_cow/commits/{}/{}", hash::shard_prefix(hash), hash)
    }

    fn branch_ref_key(branch: &str) -> String {
        format!("_cow/refs/heads/{branch}")
    }

    fn tag_ref_key(name: &str) -> String {
        format!("_cow/refs/tags/{name}")
    }

    /// Deduplicates by content hash.
    pub async fn write_blob(&self, bytes: Vec<u8>) -> Result<String> {
        let digest = hash::hash_bytes(&bytes);
        let key = Self::blob_key(&digest);
        if !self.store.exists(&key).await? {
            self.store.put(&key, bytes).await?;
        }
        Ok(digest)
    }

    pub async fn read_blob(&self, hash: &str) -> Result<Vec<u8>> {
        match self.store.get(&Self::blob_key(hash)).await? {
            GetResult::Found(bytes, _) => Ok(bytes),
            GetResult::NotFound => Err(StratumError::not_found("cow blob", hash)),
        }
    }

    pub async fn write_tree(&self, mut entries: Vec<TreeEntry>) -> Result<String> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let tree = Tree { entries };
        let bytes = serde_json::to_vec(&tree)?;
        let digest = hash::hash_bytes(&bytes);
        let key = Self::tree_key(&digest);
        if !self.store.exists(&key).await? {
            self.store.put(&key, bytes).await?;
        }
        Ok(digest)
    }

    pub async fn read_tree(&self, hash: &str) -> Result<Tree> {
        match self.store.get(&Self::tree_key(hash)).await? {
            GetResult::Found(bytes, _) => Ok(serde_json::from_slice(&bytes)?),
            GetResult::NotFound => Err(StratumError::not_found("cow tree", hash)),
        }
    }

    async fn read_commit(&self, hash: &str) -> Result<Commit> {
        match self.store.get(&Self::commit_key(hash)).await? {
            GetResult::Found(bytes, _) => Ok(serde_json::from_slice(&bytes)?),
            GetResult::NotFound => Err(StratumError::not_found("cow commit", hash)),
        }
    }

    async fn read_branch_ref(&self, branch: &str) -> Result<Option<(BranchRef, Option<Version>)>> {
        match self.store.get(&Self::branch_ref_key(branch)).await? {
            GetResult::Found(bytes, version) => {
                Ok(Some((serde_json::from_slice(&bytes)?, Some(version))))
            }
            GetResult::NotFound => Ok(None),
        }
    }

    pub async fn current_commit(&self, branch: &str) -> Result<Option<String>> {
        Ok(self.read_branch_ref(branch).await?.map(|(r, _)| r.commit))
    }

    /// Compare-and-swap update of the branch ref; retries on conflict by
    /// re-reading the parent.
    pub async fn create_commit(
        &self,
        branch: &str,
        tree_hash: &str,
        author: &str,
        message: &str,
    ) -> Result<String> {
        let mut last_err = None;
        for _ in 0..MAX_COMMIT_RETRIES {
            let existing = self.read_branch_ref(branch).await?;
            let (parent_hash, expected_version) = match &existing {
                Some((r, v)) => (Some(r.commit.clone()), v.clone()),
                None => (None, None),
            };
            let commit = Commit {
                tree_hash: tree_hash.to_string(),
                parent_hash,
                author: author.to_string(),
                timestamp_ms: Utc::now().timestamp_millis(),
                message: message.to_string(),
                branch: branch.to_string(),
            };
            let bytes = serde_json::to_vec(&commit)?;
            let commit_hash = hash::hash_bytes(&bytes);
            self.store.put(&Self::commit_key(&commit_hash), bytes).await?;

            let new_ref = BranchRef {
                commit: commit_hash.clone(),
                updated: commit.timestamp_ms,
            };
            let ref_bytes = serde_json::to_vec(&new_ref)?;
            match self
                .store
                .compare_and_swap(&Self::branch_ref_key(branch), expected_version.as_ref(), ref_bytes)
                .await
            {
                Ok(_) => return Ok(commit_hash),
                Err(StratumError::ConcurrentWrite { .. }) => {
                    last_err = Some(StratumError::ConcurrentWrite {
                        branch: branch.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(StratumError::ConcurrentWrite {
            branch: branch.to_string(),
        }))
    }

    /// Walks parents until the commit at or before `timestamp_ms`, for
    /// "as-of" reads.
    pub async fn read_branch_at(&self, branch: &str, timestamp_ms: Option<i64>) -> Result<Option<String>> {
        let Some((branch_ref, _)) = self.read_branch_ref(branch).await? else {
            return Ok(None);
        };
        let Some(ts) = timestamp_ms else {
            let commit = self.read_commit(&branch_ref.commit).await?;
            return Ok(Some(commit.tree_hash));
        };
        let mut current = Some(branch_ref.commit);
        while let Some(hash) = current {
            let commit = self.read_commit(&hash).await?;
            if commit.timestamp_ms <= ts {
                return Ok(Some(commit.tree_hash));
            }
            current = commit.parent_hash;
        }
        Ok(None)
    }

    /// Atomic ref copy; no data movement.
    pub async fn branch_from(&self, existing_branch: &str, new_branch: &str) -> Result<()> {
        let Some((branch_ref, _)) = self.read_branch_ref(existing_branch).await? else {
            return Err(StratumError::not_found("branch", existing_branch));
        };
        let bytes = serde_json::to_vec(&branch_ref)?;
        self.store.put(&Self::branch_ref_key(new_branch), bytes).await?;
        Ok(())
    }

    pub async fn create_tag(&self, name: &str, commit_hash: &str) -> Result<()> {
        #[derive(Serialize)]
        struct TagRef<'a> {
            commit: &'a str,
            timestamp: i64,
        }
        let bytes = serde_json::to_vec(&TagRef {
            commit: commit_hash,
            timestamp: Utc::now().timestamp_millis(),
        })?;
        self.store.put(&Self::tag_ref_key(name), bytes).await?;
        Ok(())
    }

    /// Materializes a tree into a flat path→hash map, for callers that
    /// need to walk the full snapshot (e.g. rebuilding an index).
    pub async fn flatten_tree(&self, tree_hash: &str, prefix: &str) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let tree = self.read_tree(tree_hash).await?;
        for entry in tree.entries {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            match entry.kind {
                EntryKind::Blob => {
                    out.insert(path, entry.hash);
                }
                EntryKind::Tree => {
                    let nested = Box::pin(self.flatten_tree(&entry.hash, &path)).await?;
                    out.extend(nested);
                }
            }
        }
        Ok(out)
    }
}
