//! HNSW Vector Index: a hierarchical navigable
//! small-world graph of entity vectors with persisted per-node
//! connections and adaptive in-memory/on-demand loading.
//!
//! Grounded on `vector_core::hnsw::HnswBuilder`: the same
//! randomized-level assignment, greedy-descent-then-beam-search shape,
//! and a concurrent `papaya::HashMap` per layer for lock-free reads
//! survive the rewrite. What changes is persistence — the original
//! backs every layer by an LMDB transaction; this index is simpler
//! (one global entry point per sub-graph rather than FreshDiskANN-style
//! incremental patch sets) and persists through the Blob Store Adapter
//! and Unified Cache instead.

pub mod distance;

use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};

use min_max_heap::MinMaxHeap;
use papaya::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob_store::{BlobStore, GetResult};
use crate::cache::{CachedItem, ItemKind, UnifiedCache};
use crate::config::VectorIndexConfig;
use crate::error::{Result, StratumError};
use crate::model::Vector;

use distance::{DistanceMetric, OrderedDistance};

/// Resident node state: level, per-level neighbor lists, and an
/// optionally-resident vector.
#[derive(Clone)]
struct NodeState {
    level: usize,
    connections: Vec<Vec<u32>>,
    vector: Option<Arc<Vector>>,
    tombstoned: bool,
}

/// On-disk form of a node: `{ vector, connections by level }`, matching
/// the entity vector blob shape.
#[derive(Clone, Serialize, Deserialize)]
struct PersistedNode {
    vector: Vector,
    connections: Vec<Vec<u32>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SystemState {
    entry_point: Option<u32>,
    max_level: usize,
}

/// One independent HNSW sub-graph, either the whole index or one noun
/// type's partition.
struct HnswGraph {
    partition: String,
    nodes: HashMap<u32, NodeState>,
    entry_point: Mutex<Option<u32>>,
    max_level: Mutex<usize>,
    write_lock: tokio::sync::Mutex<()>,
}

impl HnswGraph {
    fn new(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
            nodes: HashMap::new(),
            entry_point: Mutex::new(None),
            max_level: Mutex::new(0),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn system_state(&self) -> SystemState {
        SystemState {
            entry_point: *self.entry_point.lock().unwrap(),
            max_level: *self.max_level.lock().unwrap(),
        }
    }
}

pub struct VectorIndex {
    store: Arc<dyn BlobStore>,
    cache: Arc<UnifiedCache>,
    config: VectorIndexConfig,
    dimension: usize,
    metric: DistanceMetric,
    graphs: Mutex<StdHashMap<String, Arc<HnswGraph>>>,
}

const UNPARTITIONED: &str = "__all__";

/// Keys the `_system/hnsw/nodes` mirror by a bucket of the integer id
/// rather than the entity's UUID shard (DESIGN.md decision 1): the
/// index only ever sees `int_id`s, and recovering a UUID shard from one
/// would mean threading the Entity-ID Mapper through every lookup.
fn node_key(id: u32) -> String {
    format!("_system/hnsw/nodes/{:02x}/{id}", id % 256)
}

fn system_key(partition: &str) -> String {
    format!("_system/hnsw/{partition}/system.json")
}

impl VectorIndex {
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache: Arc<UnifiedCache>,
        config: VectorIndexConfig,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            dimension,
            metric,
            graphs: Mutex::new(StdHashMap::new()),
        }
    }

    fn partition_key(&self, noun_type: &str) -> String {
        if self.config.partition_by_type {
            noun_type.to_string()
        } else {
            UNPARTITIONED.to_string()
        }
    }

    fn graph_for(&self, noun_type: &str) -> Arc<HnswGraph> {
        let partition = self.partition_key(noun_type);
        let mut graphs = self.graphs.lock().unwrap();
        graphs
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(HnswGraph::new(&partition)))
            .clone()
    }

    fn m_max(&self, level: usize) -> usize {
        if level == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    /// `floor(-ln(U(0,1)) * ml)` with `ml = 1 / ln(M)`, the usual HNSW
    /// level-sampling distribution.
    fn random_level<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let ml = 1.0 / (self.config.m as f64).ln();
        let u: f64 = rng.random_range(f64::EPSILON..1.0);
        (-u.ln() * ml).floor() as usize
    }

    async fn fetch_vector(&self, graph: &HnswGraph, id: u32) -> Result<Arc<Vector>> {
        if let Some(resident) = graph.nodes.pin().get(&id).and_then(|n| n.vector.clone()) {
            return Ok(resident);
        }
        let cache_key = format!("vec::{}::{id}", graph.partition);
        if let Some(item) = self.cache.get(&cache_key) {
            let vector: Vector = bincode::deserialize(&item.bytes)?;
            return Ok(Arc::new(vector));
        }
        let key = node_key(id);
        let bytes = match self.store.get(&key).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => {
                return Err(StratumError::corruption("vector_index", format!("node {id} missing")));
            }
        };
        let node: PersistedNode = bincode::deserialize(&bytes)?;
        let vector_bytes = bincode::serialize(&node.vector)?;
        self.cache.put(
            cache_key,
            CachedItem {
                bytes: Arc::new(vector_bytes),
                kind: ItemKind::Vector,
            },
            node.vector.len() * 4,
        );
        Ok(Arc::new(node.vector))
    }

    /// Inserts a new entity's vector into its type's sub-graph. `id` is retained for future per-entity
    /// diagnostics even though the sub-graph itself is keyed by
    /// `int_id`.
    pub async fn insert(&self, noun_type: &str, _id: Uuid, int_id: u32, vector: Vector) -> Result<()> {
        crate::model::validate_dimension(&vector, self.dimension)?;
        let graph = self.graph_for(noun_type);
        let _guard = graph.write_lock.lock().await;

        let mut rng = rand::rng();
        let level = self.random_level(&mut rng);

        let entry = *graph.entry_point.lock().unwrap();
        let max_level = *graph.max_level.lock().unwrap();

        let connections = if entry.is_none() {
            vec![Vec::new(); level + 1]
        } else {
            self.connect_new_node(&graph, int_id, &vector, level, entry.unwrap(), max_level)
                .await?
        };

        graph.nodes.pin().insert(
            int_id,
            NodeState {
                level,
                connections,
                vector: Some(Arc::new(vector.clone())),
                tombstoned: false,
            },
        );

        if entry.is_none() || level > max_level {
            *graph.entry_point.lock().unwrap() = Some(int_id);
            *graph.max_level.lock().unwrap() = level;
        }

        self.persist_node(int_id, &vector, &graph).await?;
        self.persist_system(&graph).await?;
        Ok(())
    }

    async fn connect_new_node(
        &self,
        graph: &HnswGraph,
        query_id: u32,
        query_vector: &Vector,
        level: usize,
        entry: u32,
        max_level: usize,
    ) -> Result<Vec<Vec<u32>>> {
        let mut connections = vec![Vec::new(); level + 1];
        let mut eps = vec![entry];

        for lvl in (level + 1..=max_level).rev() {
            let neighbours = self.walk_layer(graph, query_vector, &eps, lvl, 1).await?;
            if let Some((_, closest)) = neighbours.iter().min_by_key(|(d, _)| OrderedDistance(*d)) {
                eps = vec![*closest];
            }
        }

        for lvl in (0..=level.min(max_level)).rev() {
            let neighbours = self
                .walk_layer(graph, query_vector, &eps, lvl, self.config.ef_construction)
                .await?;
            let cap = self.m_max(lvl);
            let mut sorted = neighbours;
            sorted.sort_by_key(|(d, _)| OrderedDistance(*d));
            sorted.truncate(cap);

            for &(_, neighbour_id) in &sorted {
                self.add_backlink(graph, neighbour_id, query_id, lvl, cap);
            }
            connections[lvl] = sorted.iter().map(|(_, id)| *id).collect();
            eps = connections[lvl].clone();
            if eps.is_empty() {
                eps = vec![entry];
            }
        }
        Ok(connections)
    }

    fn add_backlink(&self, graph: &HnswGraph, node_id: u32, new_neighbour: u32, level: usize, cap: usize) {
        let pin = graph.nodes.pin();
        if let Some(node) = pin.get(&node_id) {
            let mut updated = node.clone();
            if updated.connections.len() <= level {
                updated.connections.resize(level + 1, Vec::new());
            }
            if !updated.connections[level].contains(&new_neighbour) {
                updated.connections[level].push(new_neighbour);
                if updated.connections[level].len() > cap {
                    // Simple recency-based trim; a distance-aware prune
                    // would need each neighbour's vector, an acceptable
                    // trade against re-fetching them all here.
                    updated.connections[level].remove(0);
                }
            }
            pin.insert(node_id, updated);
        }
    }

    /// Priority-queue expansion at a single layer: visits candidates in distance order, stopping
    /// once the worst of `ef` results cannot be beaten.
    async fn walk_layer(
        &self,
        graph: &HnswGraph,
        query: &Vector,
        entry_points: &[u32],
        level: usize,
        ef: usize,
    ) -> Result<Vec<(f32, u32)>> {
        let mut visited = std::collections::HashSet::new();
        let mut candidates: Vec<(f32, u32)> = Vec::new();
        let mut results: MinMaxHeap<(OrderedDistance, u32)> = MinMaxHeap::with_capacity(ef.max(1));

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            let Ok(vector) = self.fetch_vector(graph, ep).await else {
                tracing::warn!(node = ep, "vector missing for visited node, skipping");
                continue;
            };
            let dist = self.metric.distance(query, &vector);
            candidates.push((dist, ep));
            results.push((OrderedDistance(dist), ep));
        }
        candidates.sort_by_key(|(d, _)| OrderedDistance(*d));

        while let Some((dist, node_id)) = candidates.first().copied() {
            candidates.remove(0);
            let worst = results.peek_max().map(|(d, _)| d.0).unwrap_or(f32::INFINITY);
            if results.len() >= ef && dist > worst {
                break;
            }
            let neighbours = graph
                .nodes
                .pin()
                .get(&node_id)
                .filter(|n| !n.tombstoned)
                .map(|n| n.connections.get(level).cloned().unwrap_or_default())
                .unwrap_or_default();

            for neighbour in neighbours {
                if !visited.insert(neighbour) {
                    continue;
                }
                let Ok(vector) = self.fetch_vector(graph, neighbour).await else {
                    tracing::warn!(node = neighbour, "vector missing for visited node, skipping");
                    continue;
                };
                let d = self.metric.distance(query, &vector);
                let worst = results.peek_max().map(|(dd, _)| dd.0).unwrap_or(f32::INFINITY);
                if results.len() < ef || d < worst {
                    candidates.push((d, neighbour));
                    candidates.sort_by_key(|(dd, _)| OrderedDistance(*dd));
                    if results.len() >= ef {
                        results.push_pop_max((OrderedDistance(d), neighbour));
                    } else {
                        results.push((OrderedDistance(d), neighbour));
                    }
                }
            }
        }

        Ok(results.into_vec().into_iter().map(|(d, id)| (d.0, id)).collect())
    }

    /// k-nearest-neighbor search.
    pub async fn knn(&self, noun_type: Option<&str>, query: &Vector, k: usize, ef: usize) -> Result<Vec<(f32, u32)>> {
        crate::model::validate_dimension(query, self.dimension)?;
        let partitions: Vec<Arc<HnswGraph>> = match noun_type {
            Some(t) => vec![self.graph_for(t)],
            None => self.graphs.lock().unwrap().values().cloned().collect(),
        };

        let mut all_results = Vec::new();
        for graph in partitions {
            let entry = *graph.entry_point.lock().unwrap();
            let Some(entry) = entry else { continue };
            let max_level = *graph.max_level.lock().unwrap();
            let mut eps = vec![entry];
            for lvl in (1..=max_level).rev() {
                let neighbours = self.walk_layer(&graph, query, &eps, lvl, 1).await?;
                if let Some((_, closest)) = neighbours.iter().min_by_key(|(d, _)| OrderedDistance(*d)) {
                    eps = vec![*closest];
                }
            }
            let candidate_size = ef.max(k);
            let mut results = self.walk_layer(&graph, query, &eps, 0, candidate_size).await?;
            results.sort_by_key(|(d, _)| OrderedDistance(*d));
            all_results.extend(results);
        }

        all_results.sort_by_key(|(d, _)| OrderedDistance(*d));
        all_results.truncate(k);
        Ok(all_results)
    }

    async fn persist_node(&self, int_id: u32, vector: &Vector, graph: &HnswGraph) -> Result<()> {
        let connections = graph
            .nodes
            .pin()
            .get(&int_id)
            .map(|n| n.connections.clone())
            .unwrap_or_default();
        let node = PersistedNode {
            vector: vector.clone(),
            connections,
        };
        let bytes = bincode::serialize(&node)?;
        self.store.put(&node_key(int_id), bytes).await?;
        Ok(())
    }

    async fn persist_system(&self, graph: &HnswGraph) -> Result<()> {
        let state = graph.system_state();
        let bytes = serde_json::to_vec(&state)?;
        self.store.put(&system_key(&graph.partition), bytes).await?;
        Ok(())
    }

    /// Removes a node from its sub-graph. Neighbors that pointed at it
    /// are left untouched: `walk_layer` skips tombstoned nodes, and
    /// the stale edges are pruned the next time those neighbors are
    /// re-linked.
    pub async fn remove(&self, noun_type: &str, int_id: u32) -> Result<()> {
        let graph = self.graph_for(noun_type);
        let pin = graph.nodes.pin();
        if let Some(node) = pin.get(&int_id) {
            let mut tombstoned = node.clone();
            tombstoned.tombstoned = true;
            tombstoned.vector = None;
            pin.insert(int_id, tombstoned);
        }
        if *graph.entry_point.lock().unwrap() == Some(int_id) {
            let replacement = pin.iter().find(|(id, n)| **id != int_id && !n.tombstoned).map(|(id, _)| *id);
            *graph.entry_point.lock().unwrap() = replacement;
        }
        self.cache.invalidate(&format!("vec::{}::{int_id}", graph.partition));
        Ok(())
    }

    /// A rebuild is a load, not a recomputation: iterate the `_system/hnsw/nodes`
    /// mirror for `ids`, reconstructing `connections` directly.
    pub async fn rebuild_partition(&self, noun_type: &str, ids: &[u32]) -> Result<()> {
        let graph = self.graph_for(noun_type);
        let mut max_level = 0;
        let mut entry = None;
        for &id in ids {
            let key = node_key(id);
            let bytes = match self.store.get(&key).await? {
                GetResult::Found(bytes, _) => bytes,
                GetResult::NotFound => continue,
            };
            let node: PersistedNode = bincode::deserialize(&bytes)?;
            let level = node.connections.len().saturating_sub(1);
            if level >= max_level {
                max_level = level;
                entry = Some(id);
            }
            graph.nodes.pin().insert(
                id,
                NodeState {
                    level,
                    connections: node.connections,
                    vector: Some(Arc::new(node.vector)),
                    tombstoned: false,
                },
            );
        }
        *graph.entry_point.lock().unwrap() = entry;
        *graph.max_level.lock().unwrap() = max_level;
        self.persist_system(&graph).await?;
        tracing::info!(noun_type, nodes = ids.len(), "vector index partition rebuilt");
        Ok(())
    }

    /// Adaptive loading decision at startup: callers pass in how many vectors exist so this
    /// stays independent of how ids are enumerated.
    pub fn should_preload(&self, vector_count: usize) -> bool {
        let vector_bytes = vector_count * self.dimension * 4;
        let available = self.cache.remaining_capacity();
        (vector_bytes as f64) < 0.3 * available as f64
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Scores a fixed candidate set against `query`, used by the Query
    /// Planner's progressive-narrowing strategy once a `where` predicate
    /// has already cut the population down.
    pub async fn score_candidates(&self, noun_type: Option<&str>, ids: &[u32], query: &Vector) -> Result<Vec<(u32, f32)>> {
        crate::model::validate_dimension(query, self.dimension)?;
        let graphs: Vec<Arc<HnswGraph>> = match noun_type {
            Some(t) => vec![self.graph_for(t)],
            None => self.graphs.lock().unwrap().values().cloned().collect(),
        };
        let mut scored = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut found = false;
            for graph in &graphs {
                if let Ok(vector) = self.fetch_vector(graph, id).await {
                    scored.push((id, self.metric.distance(query, &vector)));
                    found = true;
                    break;
                }
            }
            if !found {
                tracing::warn!(id, "candidate vector missing during rescoring, skipping");
            }
        }
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryStore;

    fn index(dimension: usize) -> VectorIndex {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(UnifiedCache::new(64 * 1024 * 1024));
        VectorIndex::new(store, cache, VectorIndexConfig::default(), dimension, DistanceMetric::Cosine)
    }

    fn vec_with(dim: usize, lead: f32) -> Vector {
        let mut v = vec![0.0f32; dim];
        v[0] = lead;
        v[1] = 1.0;
        v
    }

    #[tokio::test]
    async fn insert_then_knn_finds_nearest() {
        let idx = index(4);
        for i in 0..20u32 {
            let id = Uuid::new_v4();
            idx.insert("doc", id, i, vec_with(4, i as f32)).await.unwrap();
        }
        let query = vec_with(4, 19.0);
        let results = idx.knn(Some("doc"), &query, 3, 32).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].1 == 19 || results[0].1 == 18);
    }

    #[tokio::test]
    async fn rejects_mismatched_dimension() {
        let idx = index(4);
        let err = idx.insert("doc", Uuid::new_v4(), 0, vec![1.0, 2.0]).await.unwrap_err();
        assert!(matches!(err, StratumError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn removed_node_is_excluded_from_search() {
        let idx = index(4);
        for i in 0..10u32 {
            idx.insert("doc", Uuid::new_v4(), i, vec_with(4, i as f32)).await.unwrap();
        }
        idx.remove("doc", 9).await.unwrap();
        let results = idx.knn(Some("doc"), &vec_with(4, 9.0), 1, 32).await.unwrap();
        assert_ne!(results[0].1, 9);
    }

    #[tokio::test]
    async fn type_partitions_are_isolated() {
        let idx = index(4);
        idx.insert("doc", Uuid::new_v4(), 0, vec_with(4, 1.0)).await.unwrap();
        idx.insert("image", Uuid::new_v4(), 1, vec_with(4, 1.0)).await.unwrap();
        let doc_results = idx.knn(Some("doc"), &vec_with(4, 1.0), 5, 32).await.unwrap();
        assert_eq!(doc_results.len(), 1);
        assert_eq!(doc_results[0].1, 0);
    }
}
