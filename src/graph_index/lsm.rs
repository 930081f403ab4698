//! A single LSM-tree over composite `(from, to)` edge keys: four of
//! these back the graph adjacency index, each really a sorted multimap
//! from one id to a set of related ids.
//!
//! Grounded on the memtable/flush/compaction shape described for
//! `StorageEngine` in the `lsmdb` reference crate pulled into this
//! pack: a `BTreeMap` memtable buffers writes, flushing to an
//! immutable, sorted on-disk run once it crosses a size threshold;
//! runs accumulate in level 0 and periodically merge upward at
//! `lsm_size_ratio`, with tombstones (`alive: false`) carried until a
//! merge reaches what is, at that moment, the deepest level.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::blob_store::{BlobStore, GetResult};
use crate::error::Result;

pub type EdgeKey = (u32, u32);

#[derive(Clone, Serialize, Deserialize)]
struct Run {
    entries: Vec<(EdgeKey, bool)>,
}

impl Run {
    fn lookup(&self, key: &EdgeKey) -> Option<bool> {
        self.entries
            .binary_search_by_key(key, |(k, _)| *k)
            .ok()
            .map(|idx| self.entries[idx].1)
    }

    fn range_from(&self, from: u32) -> impl Iterator<Item = (EdgeKey, bool)> + '_ {
        let start = self.entries.partition_point(|((f, _), _)| *f < from);
        self.entries[start..]
            .iter()
            .take_while(move |((f, _), _)| *f == from)
            .copied()
    }
}

#[derive(Default)]
struct State {
    memtable: BTreeMap<EdgeKey, bool>,
    /// `levels[0]` is freshly flushed, most-recent-last within a level;
    /// `levels[i]` for `i > 0` holds progressively older, compacted runs.
    levels: Vec<Vec<Run>>,
}

pub struct LsmTree {
    name: String,
    store: Arc<dyn BlobStore>,
    flush_threshold: usize,
    size_ratio: usize,
    state: RwLock<State>,
}

fn run_key(name: &str, level: usize, run_id: usize) -> String {
    format!("_system/graph_index/{name}/L{level}/{run_id}")
}

impl LsmTree {
    pub fn new(name: impl Into<String>, store: Arc<dyn BlobStore>, flush_threshold: usize, size_ratio: usize) -> Self {
        Self {
            name: name.into(),
            store,
            flush_threshold,
            size_ratio,
            state: RwLock::new(State::default()),
        }
    }

    /// Appends an edge write, flushing the memtable if it has grown past
    /// `flush_threshold`.
    pub async fn put(&self, key: EdgeKey) -> Result<()> {
        let should_flush = {
            let mut state = self.state.write().await;
            state.memtable.insert(key, true);
            state.memtable.len() >= self.flush_threshold
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes a tombstone.
    pub async fn delete(&self, key: EdgeKey) -> Result<()> {
        let mut state = self.state.write().await;
        state.memtable.insert(key, false);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.memtable.is_empty() {
            return Ok(());
        }
        let entries: Vec<(EdgeKey, bool)> = std::mem::take(&mut state.memtable).into_iter().collect();
        let run = Run { entries };
        if state.levels.is_empty() {
            state.levels.push(Vec::new());
        }
        let run_id = state.levels[0].len();
        let bytes = bincode::serialize(&run)?;
        self.store.put(&run_key(&self.name, 0, run_id), bytes).await?;
        state.levels[0].push(run);
        let needs_compaction = state.levels[0].len() > self.size_ratio;
        drop(state);
        if needs_compaction {
            self.compact_level(0).await?;
        }
        Ok(())
    }

    /// Merges every run at `level` into one run promoted to `level + 1`
    ///. Tombstones
    /// are dropped only when the merge target is, for now, the deepest
    /// level that exists — a correct approximation since nothing older
    /// can be shadowed by a tombstone that has nowhere lower to hide.
    pub async fn compact_level(&self, level: usize) -> Result<()> {
        let mut state = self.state.write().await;
        if level >= state.levels.len() || state.levels[level].len() <= self.size_ratio {
            return Ok(());
        }
        let runs = std::mem::take(&mut state.levels[level]);
        let is_bottom = level + 1 >= state.levels.len();

        let mut merged: BTreeMap<EdgeKey, bool> = BTreeMap::new();
        for run in &runs {
            for &(key, alive) in &run.entries {
                merged.insert(key, alive);
            }
        }
        if is_bottom {
            merged.retain(|_, alive| *alive);
        }

        if state.levels.len() <= level + 1 {
            state.levels.push(Vec::new());
        }
        let next_run_id = state.levels[level + 1].len();
        let promoted = Run {
            entries: merged.into_iter().collect(),
        };
        let bytes = bincode::serialize(&promoted)?;
        self.store.put(&run_key(&self.name, level + 1, next_run_id), bytes).await?;
        state.levels[level + 1].push(promoted);

        tracing::debug!(tree = %self.name, level, "compacted level");

        let cascade = state.levels[level + 1].len() > self.size_ratio;
        drop(state);
        if cascade {
            Box::pin(self.compact_level(level + 1)).await?;
        }
        Ok(())
    }

    /// All live targets reachable from `from`, newest write wins. Each
    /// hop is O(1) against the memtable; older, compacted levels degrade
    /// to the number of surviving runs, bounded by `log` growth.
    pub async fn adjacent(&self, from: u32) -> Vec<u32> {
        let state = self.state.read().await;
        let mut resolved: std::collections::HashMap<u32, bool> = std::collections::HashMap::new();

        for (&(f, t), &alive) in &state.memtable {
            if f == from {
                resolved.entry(t).or_insert(alive);
            }
        }
        for level in &state.levels {
            for run in level.iter().rev() {
                for ((_, t), alive) in run.range_from(from) {
                    resolved.entry(t).or_insert(alive);
                }
            }
        }
        resolved.into_iter().filter(|(_, alive)| *alive).map(|(t, _)| t).collect()
    }

    pub async fn contains(&self, key: EdgeKey) -> bool {
        let state = self.state.read().await;
        if let Some(&alive) = state.memtable.get(&key) {
            return alive;
        }
        for level in &state.levels {
            for run in level.iter().rev() {
                if let Some(alive) = run.lookup(&key) {
                    return alive;
                }
            }
        }
        false
    }

    /// Reconstructs `self` by replaying every persisted run, for a
    /// process restart (no prior art needed here: runs are already
    /// immutable on disk, so this is a straight re-read of the index
    /// files this tree itself wrote).
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.levels.clear();
        let mut level = 0;
        loop {
            let mut runs = Vec::new();
            let mut run_id = 0;
            loop {
                match self.store.get(&run_key(&self.name, level, run_id)).await? {
                    GetResult::Found(bytes, _) => {
                        runs.push(bincode::deserialize::<Run>(&bytes)?);
                        run_id += 1;
                    }
                    GetResult::NotFound => break,
                }
            }
            if runs.is_empty() {
                break;
            }
            state.levels.push(runs);
            level += 1;
        }
        Ok(())
    }

    /// Forces the memtable to disk regardless of size, used when a
    /// caller needs durability before proceeding (e.g. before a commit).
    pub async fn force_flush(&self) -> Result<()> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryStore;

    fn tree(flush_threshold: usize, size_ratio: usize) -> LsmTree {
        LsmTree::new("test", Arc::new(MemoryStore::new()), flush_threshold, size_ratio)
    }

    #[tokio::test]
    async fn put_then_adjacent_finds_target() {
        let t = tree(100, 4);
        t.put((1, 2)).await.unwrap();
        t.put((1, 3)).await.unwrap();
        let mut adj = t.adjacent(1).await;
        adj.sort();
        assert_eq!(adj, vec![2, 3]);
    }

    #[tokio::test]
    async fn delete_tombstones_override_earlier_put() {
        let t = tree(100, 4);
        t.put((1, 2)).await.unwrap();
        t.delete((1, 2)).await.unwrap();
        assert!(t.adjacent(1).await.is_empty());
        assert!(!t.contains((1, 2)).await);
    }

    #[tokio::test]
    async fn flush_moves_memtable_into_a_run_and_adjacency_still_resolves() {
        let t = tree(2, 4);
        t.put((1, 2)).await.unwrap();
        t.put((1, 3)).await.unwrap(); // crosses flush_threshold=2
        t.put((1, 4)).await.unwrap();
        let mut adj = t.adjacent(1).await;
        adj.sort();
        assert_eq!(adj, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn compaction_merges_runs_and_preserves_membership() {
        let t = tree(1, 2);
        for i in 0..10u32 {
            t.put((1, i)).await.unwrap();
        }
        let mut adj = t.adjacent(1).await;
        adj.sort();
        assert_eq!(adj, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn memtable_write_wins_over_older_run() {
        let t = tree(1, 4);
        t.put((1, 2)).await.unwrap(); // flushes to a run
        t.delete((1, 2)).await.unwrap(); // lives in memtable, must shadow the run
        assert!(t.adjacent(1).await.is_empty());
    }
}
