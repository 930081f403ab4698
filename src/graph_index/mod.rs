//! Graph Adjacency Index: bidirectional source↔target
//! adjacency backed by four LSM-trees. Verb content itself (vector +
//! metadata) lives in the content-addressed object store; this index
//! only tracks which ids are connected and by which verb.

pub mod lsm;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use roaring::RoaringBitmap;
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::config::GraphIndexConfig;
use crate::error::{Result, StratumError};
use crate::model::Verb;

use lsm::LsmTree;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A record of a traversed edge, as `bfs` reports it.
#[derive(Clone, Debug)]
pub struct TraversedEdge {
    pub verb_id: Uuid,
    pub source: u32,
    pub target: u32,
    pub verb_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct BfsResult {
    pub reached: RoaringBitmap,
    pub edges: Vec<TraversedEdge>,
    /// Hop distance from the start node, used by the Query Planner's
    /// graph-proximity sub-score (`1 / (1 + dist)`).
    pub depths: HashMap<u32, u32>,
}

pub struct GraphIndex {
    src_to_tgt: LsmTree,
    tgt_to_src: LsmTree,
    src_to_verbs: LsmTree,
    tgt_to_verbs: LsmTree,
    /// `(int_id pair) -> verb id`, since the LSM trees only carry
    /// integer endpoints but callers need the verb's own identity and
    /// metadata too.
    verb_by_endpoints: Mutex<HashMap<(u32, u32), Vec<Uuid>>>,
    verb_records: Mutex<HashMap<Uuid, VerbRecord>>,
    /// `verb_int -> verb id`. `src_to_verbs`/`tgt_to_verbs` only carry
    /// the verb's own integer id (a separate id space from entity
    /// integer ids, assigned independently by the caller), so resolving
    /// an adjacency hit back to a `Uuid` needs this rather than a scan
    /// of `verb_records` keyed by entity ids.
    verb_by_int: Mutex<HashMap<u32, Uuid>>,
    type_counts: Mutex<HashMap<String, u64>>,
}

#[derive(Clone)]
struct VerbRecord {
    verb_type: String,
    source: u32,
    target: u32,
    verb_int: u32,
}

impl GraphIndex {
    pub fn new(store: Arc<dyn BlobStore>, config: &GraphIndexConfig) -> Self {
        Self {
            src_to_tgt: LsmTree::new("src_to_tgt", store.clone(), config.memtable_flush_threshold, config.lsm_size_ratio),
            tgt_to_src: LsmTree::new("tgt_to_src", store.clone(), config.memtable_flush_threshold, config.lsm_size_ratio),
            src_to_verbs: LsmTree::new("src_to_verbs", store.clone(), config.memtable_flush_threshold, config.lsm_size_ratio),
            tgt_to_verbs: LsmTree::new("tgt_to_verbs", store, config.memtable_flush_threshold, config.lsm_size_ratio),
            verb_by_endpoints: Mutex::new(HashMap::new()),
            verb_records: Mutex::new(HashMap::new()),
            verb_by_int: Mutex::new(HashMap::new()),
            type_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Appends to the four LSM-trees in memtable order, then updates
    /// in-memory counters. The verb's own
    /// content (vector + metadata) is written through COW by the caller
    /// before this is invoked — this index only tracks adjacency.
    pub async fn add_verb(&self, verb: &Verb, source_int: u32, target_int: u32, verb_int: u32) -> Result<()> {
        verb.validate_weight()?;

        self.src_to_tgt.put((source_int, target_int)).await?;
        self.tgt_to_src.put((target_int, source_int)).await?;
        self.src_to_verbs.put((source_int, verb_int)).await?;
        self.tgt_to_verbs.put((target_int, verb_int)).await?;

        self.verb_by_endpoints
            .lock()
            .unwrap()
            .entry((source_int, target_int))
            .or_default()
            .push(verb.id);
        self.verb_records.lock().unwrap().insert(
            verb.id,
            VerbRecord {
                verb_type: verb.verb_type.clone(),
                source: source_int,
                target: target_int,
                verb_int,
            },
        );
        self.verb_by_int.lock().unwrap().insert(verb_int, verb.id);
        *self.type_counts.lock().unwrap().entry(verb.verb_type.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Writes tombstones into the four trees and updates in-memory
    /// counters. The caller is
    /// responsible for dropping the verb's content from the working
    /// tree; the underlying COW blob is never hard-deleted.
    pub async fn delete_verb(&self, verb_id: &Uuid, verb_int: u32) -> Result<()> {
        let record = self.verb_records.lock().unwrap().remove(verb_id);
        let Some(record) = record else {
            return Err(StratumError::not_found("verb", verb_id.to_string()));
        };
        self.src_to_tgt.delete((record.source, record.target)).await?;
        self.tgt_to_src.delete((record.target, record.source)).await?;
        self.src_to_verbs.delete((record.source, verb_int)).await?;
        self.tgt_to_verbs.delete((record.target, verb_int)).await?;

        if let Some(ids) = self.verb_by_endpoints.lock().unwrap().get_mut(&(record.source, record.target)) {
            ids.retain(|id| id != verb_id);
        }
        self.verb_by_int.lock().unwrap().remove(&verb_int);
        if let Some(count) = self.type_counts.lock().unwrap().get_mut(&record.verb_type) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    /// `deleteEntity(e)` enumerates incident verbs and deletes each
    /// before the caller removes `e` itself. `src_to_verbs`/`tgt_to_verbs`
    /// store verb integer ids, which come from their own id space
    /// (assigned independently of entity integer ids), so they are
    /// resolved back to a `Uuid` through `verb_by_int` rather than by
    /// matching against `VerbRecord.source`/`.target`.
    pub async fn incident_verbs(&self, entity_int: u32) -> Vec<Uuid> {
        let mut verb_ints = HashSet::new();
        for verb_int in self.src_to_verbs.adjacent(entity_int).await {
            verb_ints.insert(verb_int);
        }
        for verb_int in self.tgt_to_verbs.adjacent(entity_int).await {
            verb_ints.insert(verb_int);
        }
        let verb_by_int = self.verb_by_int.lock().unwrap();
        verb_ints.into_iter().filter_map(|vi| verb_by_int.get(&vi).copied()).collect()
    }

    /// Standard frontier expansion, one hop per LSM lookup.
    pub async fn bfs(&self, start: u32, depth: usize, direction: Direction, type_filter: Option<&str>) -> BfsResult {
        let mut reached = RoaringBitmap::new();
        reached.insert(start);
        let mut depths = HashMap::new();
        depths.insert(start, 0u32);
        let mut frontier = vec![start];
        let mut edges = Vec::new();

        for hop in 0..depth {
            let mut next_frontier = Vec::new();
            for &node in &frontier {
                let hops = self.expand_one_hop(node, direction).await;
                for (target, verb_id, verb_type) in hops {
                    if let Some(filter) = type_filter {
                        if verb_type != filter {
                            continue;
                        }
                    }
                    edges.push(TraversedEdge {
                        verb_id,
                        source: node,
                        target,
                        verb_type,
                    });
                    if reached.insert(target) {
                        depths.insert(target, hop as u32 + 1);
                        next_frontier.push(target);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        BfsResult { reached, edges, depths }
    }

    async fn expand_one_hop(&self, node: u32, direction: Direction) -> Vec<(u32, Uuid, String)> {
        let mut out = Vec::new();
        let records = self.verb_records.lock().unwrap().clone();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for target in self.src_to_tgt.adjacent(node).await {
                if let Some((id, record)) = records.iter().find(|(_, r)| r.source == node && r.target == target) {
                    out.push((target, *id, record.verb_type.clone()));
                }
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for source in self.tgt_to_src.adjacent(node).await {
                if let Some((id, record)) = records.iter().find(|(_, r)| r.target == node && r.source == source) {
                    out.push((source, *id, record.verb_type.clone()));
                }
            }
        }
        out
    }

    /// On compaction: every `src→tgt` edge `(s,t)` must have a matching
    /// `tgt→src` edge `(t,s)`.
    /// A detected asymmetry is logged and repaired by writing the
    /// missing direction.
    pub async fn check_and_repair_symmetry(&self, known_sources: &[u32]) -> Result<usize> {
        let mut repaired = 0;
        for &source in known_sources {
            for target in self.src_to_tgt.adjacent(source).await {
                if !self.tgt_to_src.contains((target, source)).await {
                    tracing::warn!(source, target, "graph adjacency asymmetry detected, repairing");
                    self.tgt_to_src.put((target, source)).await?;
                    repaired += 1;
                }
            }
        }
        Ok(repaired)
    }

    pub async fn force_flush_all(&self) -> Result<()> {
        self.src_to_tgt.force_flush().await?;
        self.tgt_to_src.force_flush().await?;
        self.src_to_verbs.force_flush().await?;
        self.tgt_to_verbs.force_flush().await?;
        Ok(())
    }

    pub fn verb_count_by_type(&self, verb_type: &str) -> u64 {
        *self.type_counts.lock().unwrap().get(verb_type).unwrap_or(&0)
    }

    pub async fn out_degree(&self, node: u32) -> usize {
        self.src_to_tgt.adjacent(node).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryStore;
    use std::collections::HashMap as Map;

    fn verb(source_id: Uuid, target_id: Uuid, verb_type: &str) -> Verb {
        Verb {
            id: Uuid::new_v4(),
            verb_type: verb_type.to_string(),
            source_id,
            target_id,
            weight: 0.5,
            vector: vec![0.1, 0.2],
            metadata: Map::new(),
        }
    }

    fn index() -> GraphIndex {
        GraphIndex::new(Arc::new(MemoryStore::new()), &GraphIndexConfig::default())
    }

    #[tokio::test]
    async fn add_verb_creates_bidirectional_adjacency() {
        let idx = index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let v = verb(a, b, "likes");
        idx.add_verb(&v, 1, 2, 100).await.unwrap();

        assert_eq!(idx.src_to_tgt.adjacent(1).await, vec![2]);
        assert_eq!(idx.tgt_to_src.adjacent(2).await, vec![1]);
    }

    #[tokio::test]
    async fn delete_verb_removes_adjacency() {
        let idx = index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let v = verb(a, b, "likes");
        idx.add_verb(&v, 1, 2, 100).await.unwrap();
        idx.delete_verb(&v.id, 100).await.unwrap();
        assert!(idx.src_to_tgt.adjacent(1).await.is_empty());
    }

    #[tokio::test]
    async fn bfs_reaches_two_hop_neighbor() {
        let idx = index();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        idx.add_verb(&verb(a, b, "knows"), 1, 2, 100).await.unwrap();
        idx.add_verb(&verb(b, c, "knows"), 2, 3, 101).await.unwrap();

        let result = idx.bfs(1, 2, Direction::Outgoing, None).await;
        assert!(result.reached.contains(3));
        assert_eq!(result.edges.len(), 2);
    }

    #[tokio::test]
    async fn bfs_respects_type_filter() {
        let idx = index();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        idx.add_verb(&verb(a, b, "knows"), 1, 2, 100).await.unwrap();
        idx.add_verb(&verb(a, c, "blocks"), 1, 3, 101).await.unwrap();

        let result = idx.bfs(1, 1, Direction::Outgoing, Some("knows")).await;
        assert!(result.reached.contains(2));
        assert!(!result.reached.contains(3));
    }

    #[tokio::test]
    async fn incident_verbs_finds_both_directions() {
        let idx = index();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let v1 = verb(a, b, "knows");
        let v2 = verb(c, a, "knows");
        idx.add_verb(&v1, 1, 2, 100).await.unwrap();
        idx.add_verb(&v2, 3, 1, 101).await.unwrap();

        let incident = idx.incident_verbs(1).await;
        assert_eq!(incident.len(), 2);
    }

    #[tokio::test]
    async fn incident_verbs_does_not_pick_up_unrelated_edges_sharing_an_int_id() {
        // A=1, B=2, C=3; edges A->B, A->C, B->C. Verb int ids are a
        // separate space from entity int ids and happen to overlap here
        // (0, 1, 2) to catch any code that conflates the two.
        let idx = index();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let v_ab = verb(a, b, "knows");
        let v_ac = verb(a, c, "knows");
        let v_bc = verb(b, c, "knows");
        idx.add_verb(&v_ab, 1, 2, 0).await.unwrap();
        idx.add_verb(&v_ac, 1, 3, 1).await.unwrap();
        idx.add_verb(&v_bc, 2, 3, 2).await.unwrap();

        let mut incident = idx.incident_verbs(1).await;
        incident.sort();
        let mut expected = vec![v_ab.id, v_ac.id];
        expected.sort();
        assert_eq!(incident, expected, "A's incident verbs must be exactly v_ab and v_bc, never v_bc");

        for id in &incident {
            idx.delete_verb(id, if *id == v_ab.id { 0 } else { 1 }).await.unwrap();
        }

        assert_eq!(idx.src_to_tgt.adjacent(2).await, vec![3], "B->C must survive A's cascading delete");
    }

    #[tokio::test]
    async fn symmetry_repair_fixes_one_sided_edge() {
        let idx = index();
        idx.src_to_tgt.put((1, 2)).await.unwrap();
        let repaired = idx.check_and_repair_symmetry(&[1]).await.unwrap();
        assert_eq!(repaired, 1);
        assert!(idx.tgt_to_src.contains((2, 1)).await);
    }
}
