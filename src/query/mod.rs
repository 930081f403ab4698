//! Query Planner / Executor: selectivity-driven
//! strategy choice, score fusion across vector/metadata/graph signals,
//! cursor-based pagination, and deadline-aware cancellation.
//!
//! Grounded on `helix_engine::graph_core` traversal
//! pipeline shape (estimate → choose a plan → execute → collect), with
//! the metadata/vector/graph signal fusion itself original to this
//! domain — this shape has no equivalent multi-index query planner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};
use crate::graph_index::{Direction, GraphIndex};
use crate::metadata_index::{MetadataIndex, Predicate};
use crate::model::Vector;
use crate::vector_index::distance::DistanceMetric;
use crate::vector_index::VectorIndex;

#[derive(Clone, Debug)]
pub struct ConnectedQuery {
    pub from: u32,
    pub depth: usize,
    pub direction: Direction,
    pub type_filter: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct ScoreWeights {
    pub vector: f32,
    pub field: f32,
    pub graph: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            vector: 0.4,
            field: 0.3,
            graph: 0.3,
        }
    }
}

pub struct Query {
    pub noun_type: Option<String>,
    pub like: Option<Vector>,
    pub where_predicates: Vec<(String, Predicate)>,
    pub connected: Option<ConnectedQuery>,
    pub limit: usize,
    pub offset: usize,
    pub threshold: Option<f32>,
    pub explain: bool,
    pub weights: ScoreWeights,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            noun_type: None,
            like: None,
            where_predicates: Vec::new(),
            connected: None,
            limit: 10,
            offset: 0,
            threshold: None,
            explain: false,
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    ProgressiveNarrowing,
    ParallelFanOut,
}

#[derive(Clone, Debug)]
pub struct ScoredCandidate {
    pub id: u32,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub field_score: Option<f32>,
    pub graph_score: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CursorToken {
    strategy: String,
    last_score_bits: u32,
    last_id: u32,
    remaining: Option<Vec<u32>>,
    commit_hash: String,
}

#[derive(Clone, Debug)]
pub struct ExplainInfo {
    pub strategy: Strategy,
    pub stage_durations_ms: Vec<(String, u128)>,
    pub selectivity_estimates: Vec<(String, u64)>,
    pub candidate_set_sizes: Vec<(String, usize)>,
}

pub struct SearchOutcome {
    pub results: Vec<ScoredCandidate>,
    pub cursor: Option<String>,
    pub incomplete: bool,
    pub explain: Option<ExplainInfo>,
}

/// Joins the Metadata, Vector, and Graph indices to answer one triple
/// query.
pub struct QueryEngine {
    metadata: Arc<MetadataIndex>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphIndex>,
}

const SQRT_SELECTIVITY_GUARD: u64 = 1;

impl QueryEngine {
    pub fn new(metadata: Arc<MetadataIndex>, vector: Arc<VectorIndex>, graph: Arc<GraphIndex>) -> Self {
        Self { metadata, vector, graph }
    }

    fn deadline_exceeded(deadline: Option<Instant>) -> bool {
        deadline.map(|d| Instant::now() > d).unwrap_or(false)
    }

    /// Per-predicate `estimatedCount`, and whether progressive narrowing
    /// applies.
    async fn estimate(&self, query: &Query, total_count: u64) -> Result<(Strategy, Vec<(String, u64)>)> {
        let sqrt_n = (total_count as f64).sqrt().ceil() as u64;
        let mut estimates = Vec::new();
        let mut narrow = false;
        for (field, predicate) in &query.where_predicates {
            let count = self.metadata.estimated_count(field, predicate).await?;
            estimates.push((field.clone(), count));
            if count <= sqrt_n.max(SQRT_SELECTIVITY_GUARD) {
                narrow = true;
            }
        }
        if let Some(connected) = &query.connected {
            let sampled_out_degree = self.graph.out_degree(connected.from).await as u64;
            let estimate = sampled_out_degree.saturating_pow(connected.depth.min(4) as u32).max(1);
            estimates.push(("connected".to_string(), estimate));
        }
        if query.like.is_some() {
            estimates.push(("like".to_string(), total_count));
        }
        let strategy = if narrow {
            Strategy::ProgressiveNarrowing
        } else {
            Strategy::ParallelFanOut
        };
        Ok((strategy, estimates))
    }

    async fn where_bitmap(&self, query: &Query) -> Result<Option<RoaringBitmap>> {
        if query.where_predicates.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.metadata.intersect(&query.where_predicates).await?))
    }

    async fn connected_bitmap(&self, connected: &ConnectedQuery) -> (RoaringBitmap, HashMap<u32, u32>) {
        let result = self
            .graph
            .bfs(connected.from, connected.depth, connected.direction, connected.type_filter.as_deref())
            .await;
        (result.reached, result.depths)
    }

    fn graph_score(depths: &HashMap<u32, u32>, id: u32) -> Option<f32> {
        depths.get(&id).map(|&d| 1.0 / (1.0 + d as f32))
    }

    fn similarity_from_distance(metric: DistanceMetric, distance: f32) -> f32 {
        match metric {
            DistanceMetric::Cosine => ((1.0 - distance) + 1.0) / 2.0,
            _ => 1.0 / (1.0 + distance.max(0.0)),
        }
        .clamp(0.0, 1.0)
    }

    fn fuse(weights: ScoreWeights, v: Option<f32>, f: Option<f32>, g: Option<f32>) -> f32 {
        let mut total_weight = 0.0;
        let mut total_score = 0.0;
        if let Some(v) = v {
            total_weight += weights.vector;
            total_score += weights.vector * v;
        }
        if let Some(f) = f {
            total_weight += weights.field;
            total_score += weights.field * f;
        }
        if let Some(g) = g {
            total_weight += weights.graph;
            total_score += weights.graph * g;
        }
        if total_weight == 0.0 {
            0.0
        } else {
            total_score / total_weight
        }
    }

    /// Executes `query` against a population of `total_count` nouns
    ///. `commit_hash` is stamped into the returned
    /// cursor so a later `search_with_cursor` call can detect that the
    /// branch moved on in the meantime.
    pub async fn search(
        &self,
        query: &Query,
        total_count: u64,
        commit_hash: &str,
        deadline: Option<Instant>,
    ) -> Result<SearchOutcome> {
        let start = Instant::now();
        let mut stage_durations = Vec::new();
        let mut candidate_sizes = Vec::new();
        let mut incomplete = false;

        let (strategy, estimates) = self.estimate(query, total_count).await?;
        stage_durations.push(("estimate".to_string(), start.elapsed().as_millis()));

        if Self::deadline_exceeded(deadline) {
            return Ok(SearchOutcome {
                results: Vec::new(),
                cursor: None,
                incomplete: true,
                explain: query.explain.then(|| ExplainInfo {
                    strategy,
                    stage_durations_ms: stage_durations,
                    selectivity_estimates: estimates,
                    candidate_set_sizes: candidate_sizes,
                }),
            });
        }

        let where_start = Instant::now();
        let where_bitmap = self.where_bitmap(query).await?;
        if let Some(b) = &where_bitmap {
            candidate_sizes.push(("where".to_string(), b.len() as usize));
        }
        stage_durations.push(("where".to_string(), where_start.elapsed().as_millis()));

        let connected_start = Instant::now();
        let (connected_bitmap, depths) = match &query.connected {
            Some(c) => {
                let (bitmap, depths) = self.connected_bitmap(c).await;
                candidate_sizes.push(("connected".to_string(), bitmap.len() as usize));
                (Some(bitmap), depths)
            }
            None => (None, HashMap::new()),
        };
        stage_durations.push(("connected".to_string(), connected_start.elapsed().as_millis()));

        if Self::deadline_exceeded(deadline) {
            incomplete = true;
        }

        let mut candidates: Vec<ScoredCandidate> = Vec::new();

        match strategy {
            Strategy::ProgressiveNarrowing if !incomplete => {
                let mut surviving: Option<RoaringBitmap> = where_bitmap.clone();
                if let Some(connected) = &connected_bitmap {
                    surviving = Some(match surviving {
                        Some(b) => b & connected.clone(),
                        None => connected.clone(),
                    });
                }
                let ids: Vec<u32> = surviving.map(|b| b.iter().collect()).unwrap_or_default();
                candidate_sizes.push(("narrowed".to_string(), ids.len()));

                let score_start = Instant::now();
                let vector_scores: HashMap<u32, f32> = if let Some(query_vec) = &query.like {
                    self.vector
                        .score_candidates(query.noun_type.as_deref(), &ids, query_vec)
                        .await?
                        .into_iter()
                        .map(|(id, d)| (id, Self::similarity_from_distance(self.vector.metric(), d)))
                        .collect()
                } else {
                    HashMap::new()
                };
                stage_durations.push(("rescore".to_string(), score_start.elapsed().as_millis()));

                for id in ids {
                    let v = vector_scores.get(&id).copied();
                    let f = where_bitmap.as_ref().map(|_| 1.0);
                    let g = Self::graph_score(&depths, id);
                    let score = Self::fuse(query.weights, v, f, g);
                    candidates.push(ScoredCandidate {
                        id,
                        score,
                        vector_score: v,
                        field_score: f,
                        graph_score: g,
                    });
                }
            }
            _ => {
                let knn_start = Instant::now();
                let vector_hits: HashMap<u32, f32> = if let Some(query_vec) = &query.like {
                    let k = (query.offset + query.limit).max(query.limit) * 4;
                    self.vector
                        .knn(query.noun_type.as_deref(), query_vec, k.max(1), k.max(32))
                        .await?
                        .into_iter()
                        .map(|(d, id)| (id, Self::similarity_from_distance(self.vector.metric(), d)))
                        .collect()
                } else {
                    HashMap::new()
                };
                stage_durations.push(("knn".to_string(), knn_start.elapsed().as_millis()));
                candidate_sizes.push(("knn".to_string(), vector_hits.len()));

                let mut universe: std::collections::HashSet<u32> = vector_hits.keys().copied().collect();
                if let Some(b) = &where_bitmap {
                    universe.extend(b.iter());
                }
                if let Some(b) = &connected_bitmap {
                    universe.extend(b.iter());
                }

                for id in universe {
                    if let Some(b) = &where_bitmap {
                        if !b.contains(id) {
                            continue;
                        }
                    }
                    if let Some(b) = &connected_bitmap {
                        if !b.contains(id) {
                            continue;
                        }
                    }
                    let v = vector_hits.get(&id).copied();
                    let f = where_bitmap.as_ref().map(|_| 1.0);
                    let g = Self::graph_score(&depths, id);
                    let score = Self::fuse(query.weights, v, f, g);
                    candidates.push(ScoredCandidate {
                        id,
                        score,
                        vector_score: v,
                        field_score: f,
                        graph_score: g,
                    });
                }
            }
        }

        if let Some(threshold) = query.threshold {
            candidates.retain(|c| c.score >= threshold);
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id)));

        let page: Vec<ScoredCandidate> = candidates
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect();
        let cursor = page.last().map(|last| {
            let remaining: Vec<u32> = candidates
                .iter()
                .skip_while(|c| c.id != last.id)
                .skip(1)
                .map(|c| c.id)
                .collect();
            CursorToken {
                strategy: format!("{strategy:?}"),
                last_score_bits: last.score.to_bits(),
                last_id: last.id,
                remaining: Some(remaining),
                commit_hash: commit_hash.to_string(),
            }
        });

        Ok(SearchOutcome {
            results: page,
            cursor: cursor.map(|c| serde_json::to_string(&c).unwrap_or_default()),
            incomplete,
            explain: query.explain.then(|| ExplainInfo {
                strategy,
                stage_durations_ms: stage_durations,
                selectivity_estimates: estimates,
                candidate_set_sizes: candidate_sizes,
            }),
        })
    }

    /// Resumes from an opaque cursor.
    /// `current_commit_hash` must match what the cursor was issued
    /// under; a mismatch surfaces `CursorInvalidated`.
    pub async fn search_with_cursor(&self, cursor: &str, current_commit_hash: &str, limit: usize) -> Result<SearchOutcome> {
        let token: CursorToken =
            serde_json::from_str(cursor).map_err(|_| StratumError::CursorInvalidated)?;
        if !token.commit_hash.is_empty() && token.commit_hash != current_commit_hash {
            return Err(StratumError::CursorInvalidated);
        }
        let remaining = token.remaining.unwrap_or_default();
        let page: Vec<u32> = remaining.iter().take(limit).copied().collect();
        let next_remaining: Vec<u32> = remaining.into_iter().skip(limit).collect();

        let results = page
            .into_iter()
            .map(|id| ScoredCandidate {
                id,
                score: 0.0,
                vector_score: None,
                field_score: None,
                graph_score: None,
            })
            .collect::<Vec<_>>();

        let cursor = results.last().map(|last| CursorToken {
            strategy: token.strategy.clone(),
            last_score_bits: last.score.to_bits(),
            last_id: last.id,
            remaining: Some(next_remaining),
            commit_hash: current_commit_hash.to_string(),
        });

        Ok(SearchOutcome {
            results,
            cursor: cursor.map(|c| serde_json::to_string(&c).unwrap_or_default()),
            incomplete: false,
            explain: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryStore};
    use crate::cache::UnifiedCache;
    use crate::config::{GraphIndexConfig, MetadataIndexConfig, VectorIndexConfig};
    use crate::model::Value;
    use uuid::Uuid;

    async fn engine(dimension: usize) -> (QueryEngine, Arc<MetadataIndex>, Arc<VectorIndex>, Arc<GraphIndex>) {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(UnifiedCache::new(16 * 1024 * 1024));
        let metadata = Arc::new(
            MetadataIndex::open(store.clone(), cache.clone(), MetadataIndexConfig::default())
                .await
                .unwrap(),
        );
        let vector = Arc::new(VectorIndex::new(
            store.clone(),
            cache.clone(),
            VectorIndexConfig::default(),
            dimension,
            DistanceMetric::Cosine,
        ));
        let graph = Arc::new(GraphIndex::new(store.clone(), &GraphIndexConfig::default()));
        let engine = QueryEngine::new(metadata.clone(), vector.clone(), graph.clone());
        (engine, metadata, vector, graph)
    }

    fn vec_with(dim: usize, lead: f32) -> Vector {
        let mut v = vec![0.0f32; dim];
        v[0] = lead;
        v[1] = 1.0;
        v
    }

    #[tokio::test]
    async fn metadata_filter_narrows_then_vector_reranks() {
        let (engine, metadata, vector, _graph) = engine(4).await;
        for i in 0..20u32 {
            let id = Uuid::new_v4();
            metadata
                .add_to_index(
                    id,
                    &[(
                        "status".to_string(),
                        Value::String(if i % 2 == 0 { "active".into() } else { "inactive".into() }),
                    )]
                    .into_iter()
                    .collect(),
                )
                .await
                .unwrap();
            vector.insert("doc", id, i, vec_with(4, i as f32)).await.unwrap();
        }

        let query = Query {
            like: Some(vec_with(4, 18.0)),
            where_predicates: vec![("status".to_string(), Predicate::Equals(Value::String("active".into())))],
            limit: 5,
            ..Query::default()
        };
        let outcome = engine.search(&query, 20, "c1", None).await.unwrap();
        assert!(outcome.results.len() <= 5);
        for candidate in &outcome.results {
            assert_eq!(candidate.id % 2, 0);
        }
    }

    #[tokio::test]
    async fn connected_query_filters_by_graph_reachability() {
        let (engine, _metadata, _vector, graph) = engine(4).await;
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let verb_ab = crate::model::Verb {
            id: Uuid::new_v4(),
            verb_type: "knows".into(),
            source_id: a,
            target_id: b,
            weight: 1.0,
            vector: vec![],
            metadata: Default::default(),
        };
        let verb_bc = crate::model::Verb {
            id: Uuid::new_v4(),
            verb_type: "knows".into(),
            source_id: b,
            target_id: c,
            weight: 1.0,
            vector: vec![],
            metadata: Default::default(),
        };
        graph.add_verb(&verb_ab, 1, 2, 100).await.unwrap();
        graph.add_verb(&verb_bc, 2, 3, 101).await.unwrap();

        let query = Query {
            connected: Some(ConnectedQuery {
                from: 1,
                depth: 2,
                direction: Direction::Outgoing,
                type_filter: None,
            }),
            limit: 10,
            ..Query::default()
        };
        let outcome = engine.search(&query, 3, "c1", None).await.unwrap();
        let ids: Vec<u32> = outcome.results.iter().map(|c| c.id).collect();
        assert!(ids.contains(&2));
        assert!(ids.contains(&3));
    }

    #[tokio::test]
    async fn explain_reports_chosen_strategy() {
        let (engine, metadata, _vector, _graph) = engine(4).await;
        for i in 0..4u32 {
            let id = Uuid::new_v4();
            metadata
                .add_to_index(id, &[("tag".to_string(), Value::String("x".into()))].into_iter().collect())
                .await
                .unwrap();
        }
        let query = Query {
            where_predicates: vec![("tag".to_string(), Predicate::Equals(Value::String("x".into())))],
            explain: true,
            ..Query::default()
        };
        let outcome = engine.search(&query, 4, "c1", None).await.unwrap();
        let explain = outcome.explain.unwrap();
        assert_eq!(explain.strategy, Strategy::ProgressiveNarrowing);
        assert!(!explain.stage_durations_ms.is_empty());
    }

    #[tokio::test]
    async fn cursor_round_trips_remaining_candidates() {
        let (engine, metadata, _vector, _graph) = engine(4).await;
        for _ in 0..10u32 {
            let id = Uuid::new_v4();
            metadata
                .add_to_index(id, &[("tag".to_string(), Value::String("x".into()))].into_iter().collect())
                .await
                .unwrap();
        }
        let query = Query {
            where_predicates: vec![("tag".to_string(), Predicate::Equals(Value::String("x".into())))],
            limit: 3,
            ..Query::default()
        };
        let first = engine.search(&query, 10, "c1", None).await.unwrap();
        assert_eq!(first.results.len(), 3);
        let cursor = first.cursor.expect("cursor expected when more results remain");
        let second = engine.search_with_cursor(&cursor, "", 3).await.unwrap();
        assert_eq!(second.results.len(), 3);
    }
}
