//! The `Database` façade:
//! wires the Blob Store Adapter, Unified Cache, COW Object Store,
//! Metadata Index, HNSW Vector Index, and Graph Adjacency Index into one
//! entity/relationship API.
//!
//! Grounded on `helix_engine/mod.rs`, which wires its own
//! storage/vector/graph cores together in the same order every write
//! follows here: persist content, update the metadata postings, insert
//! into the vector index, append to the graph adjacency trees, then
//! seal the write with a commit.
//!
//! **Storage-layout reconciliation.** A literal, bit-exact flat path
//! layout (`branches/<branch>/entities/nouns/<shard>/<id>/...`) lives
//! alongside a git-like content-addressed tree with branch refs. Both
//! are satisfied at once: every write lands at its literal mirror key
//! directly in the `BlobStore` (fast, dependency-free reads) *and*
//! through `CowStore::write_blob`, whose hash is tracked in an
//! in-memory flat path→hash map per branch. On commit, `build_tree`
//! folds that flat map into nested COW `Tree` objects (the reverse of
//! `CowStore::flatten_tree`) and seals a commit over the result.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blob_store::{BlobStore, GetResult};
use crate::cache::UnifiedCache;
use crate::config::StratumConfig;
use crate::cow::{CowStore, EntryKind, TreeEntry};
use crate::error::{Result, StratumError};
use crate::graph_index::GraphIndex;
use crate::metadata_index::id_mapper::EntityIdMapper;
use crate::metadata_index::MetadataIndex;
use crate::model::{shard_of, validate_dimension, Metadata, Noun, Vector, Verb};
use crate::query::{Query, QueryEngine, SearchOutcome};
use crate::vector_index::VectorIndex;

const DEFAULT_BRANCH: &str = "main";

/// What a noun's "metadata" blob actually holds: the envelope carries
/// the noun's type alongside its attribute map, since the
/// two-blobs-per-entity storage model doesn't otherwise have a slot for it.
#[derive(Serialize, Deserialize)]
struct NounEnvelope {
    noun_type: String,
    metadata: Metadata,
}

/// Same idea for verbs: endpoints and weight ride along in the
/// metadata blob so the vector blob stays a bare vector.
#[derive(Serialize, Deserialize)]
struct VerbEnvelope {
    verb_type: String,
    source_id: Uuid,
    target_id: Uuid,
    weight: f32,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedStats {
    noun_count: u64,
    verb_count: u64,
    bytes_on_disk: u64,
}

fn verb_id_mapper_key() -> String {
    "_system/graph_index/__verb_id_mapper__".to_string()
}

fn statistics_key() -> String {
    "_system/statistics".to_string()
}

fn noun_path(shard: &str, id: &Uuid, part: &str) -> String {
    format!("nouns/{shard}/{id}/{part}")
}

fn verb_path(shard: &str, id: &Uuid, part: &str) -> String {
    format!("verbs/{shard}/{id}/{part}")
}

/// A page of `getNouns`/`getVerbs` results; `next_cursor` is `None` once the scan is exhausted.
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// `statistics()`'s return shape.
#[derive(Clone, Debug)]
pub struct Statistics {
    pub noun_count: u64,
    pub verb_count: u64,
    pub bytes_on_disk: u64,
    pub index_bytes: u64,
    pub cache_pressure: f64,
}

/// A read-only view of one historical commit. Index state (metadata
/// postings, HNSW graphs, adjacency trees) is not reconstructed for the
/// snapshot — only raw entity content is, via direct `get`/`has` lookups
/// against the commit's flattened tree.
pub struct AsOfHandle {
    cow: Arc<CowStore>,
    snapshot: BTreeMap<String, String>,
}

impl AsOfHandle {
    pub async fn get(&self, id: &Uuid) -> Result<Noun> {
        let shard = shard_of(id);
        let vector_hash = self
            .snapshot
            .get(&noun_path(&shard, id, "vector"))
            .ok_or_else(|| StratumError::not_found("noun", id.to_string()))?;
        let metadata_hash = self
            .snapshot
            .get(&noun_path(&shard, id, "metadata"))
            .ok_or_else(|| StratumError::not_found("noun", id.to_string()))?;
        let vector_bytes = self.cow.read_blob(vector_hash).await?;
        let metadata_bytes = self.cow.read_blob(metadata_hash).await?;
        let vector: Vector = bincode::deserialize(&vector_bytes)?;
        let envelope: NounEnvelope = serde_json::from_slice(&metadata_bytes)?;
        Ok(Noun {
            id: *id,
            noun_type: envelope.noun_type,
            vector,
            metadata: envelope.metadata,
        })
    }

    pub fn has(&self, id: &Uuid) -> bool {
        let shard = shard_of(id);
        self.snapshot.contains_key(&noun_path(&shard, id, "vector"))
            && self.snapshot.contains_key(&noun_path(&shard, id, "metadata"))
    }
}

/// Recursively groups a flat `path -> blob hash` map by path segment and
/// writes nested `Tree` objects, the inverse of `CowStore::flatten_tree`.
/// Boxed for the same reason: an `async fn` cannot call itself directly.
fn build_tree<'a>(
    cow: &'a CowStore,
    entries: &'a BTreeMap<String, String>,
) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
    Box::pin(async move {
        let mut groups: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut tree_entries = Vec::new();
        for (path, hash) in entries {
            match path.split_once('/') {
                Some((first, rest)) => {
                    groups.entry(first.to_string()).or_default().insert(rest.to_string(), hash.clone());
                }
                None => tree_entries.push(TreeEntry {
                    name: path.clone(),
                    kind: EntryKind::Blob,
                    hash: hash.clone(),
                }),
            }
        }
        for (name, sub_entries) in groups {
            let sub_hash = build_tree(cow, &sub_entries).await?;
            tree_entries.push(TreeEntry {
                name,
                kind: EntryKind::Tree,
                hash: sub_hash,
            });
        }
        cow.write_tree(tree_entries).await
    })
}

pub struct Database {
    store: Arc<dyn BlobStore>,
    cache: Arc<UnifiedCache>,
    cow: Arc<CowStore>,
    metadata: Arc<MetadataIndex>,
    vector: Arc<VectorIndex>,
    graph: Arc<GraphIndex>,
    query: QueryEngine,
    config: StratumConfig,
    verb_ids: Mutex<EntityIdMapper>,
    /// Per-branch flat `path -> blob hash` working tree, lazily seeded
    /// from the branch's current commit on first touch.
    trees: Mutex<HashMap<String, BTreeMap<String, String>>>,
    current_branch: Mutex<String>,
    noun_count: Mutex<u64>,
    verb_count: Mutex<u64>,
    bytes_on_disk: Mutex<u64>,
}

impl Database {
    pub async fn open(store: Arc<dyn BlobStore>, config: StratumConfig) -> Result<Self> {
        let cache = Arc::new(UnifiedCache::new(config.cache.capacity_bytes));
        let cow = Arc::new(CowStore::new(store.clone()));
        let metadata = Arc::new(MetadataIndex::open(store.clone(), cache.clone(), config.metadata.clone()).await?);
        let vector = Arc::new(VectorIndex::new(
            store.clone(),
            cache.clone(),
            config.vector.clone(),
            config.dimension,
            config.vector.distance,
        ));
        let graph = Arc::new(GraphIndex::new(store.clone(), &config.graph));
        let query = QueryEngine::new(metadata.clone(), vector.clone(), graph.clone());

        let verb_ids = match store.get(&verb_id_mapper_key()).await? {
            GetResult::Found(bytes, _) => EntityIdMapper::from_bytes(&bytes)?,
            GetResult::NotFound => EntityIdMapper::new(),
        };
        let stats = match store.get(&statistics_key()).await? {
            GetResult::Found(bytes, _) => serde_json::from_slice::<PersistedStats>(&bytes)?,
            GetResult::NotFound => PersistedStats::default(),
        };

        let db = Self {
            store,
            cache,
            cow,
            metadata,
            vector,
            graph,
            query,
            config,
            verb_ids: Mutex::new(verb_ids),
            trees: Mutex::new(HashMap::new()),
            current_branch: Mutex::new(DEFAULT_BRANCH.to_string()),
            noun_count: Mutex::new(stats.noun_count),
            verb_count: Mutex::new(stats.verb_count),
            bytes_on_disk: Mutex::new(stats.bytes_on_disk),
        };
        db.ensure_branch_loaded(DEFAULT_BRANCH).await?;
        Ok(db)
    }

    fn current_branch(&self) -> String {
        self.current_branch.lock().unwrap().clone()
    }

    /// Switches which branch subsequent operations read and write,
    /// without touching storage.
    pub fn checkout(&self, branch: &str) {
        *self.current_branch.lock().unwrap() = branch.to_string();
    }

    async fn ensure_branch_loaded(&self, branch: &str) -> Result<()> {
        {
            let trees = self.trees.lock().unwrap();
            if trees.contains_key(branch) {
                return Ok(());
            }
        }
        let flat = match self.cow.read_branch_at(branch, None).await? {
            Some(tree_hash) => self.cow.flatten_tree(&tree_hash, "").await?,
            None => BTreeMap::new(),
        };
        self.trees.lock().unwrap().insert(branch.to_string(), flat);
        Ok(())
    }

    fn mirror_key(branch: &str, relative_path: &str) -> String {
        format!("branches/{branch}/entities/{relative_path}")
    }

    /// Writes a literal mirror key for bit-exact external reads, and
    /// tracks the content hash of the same bytes in the branch's flat
    /// tree so a later commit can fold it into the COW object graph.
    async fn write_and_mirror(&self, branch: &str, relative_path: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_branch_loaded(branch).await?;
        let previous_len = match self.store.get(&Self::mirror_key(branch, relative_path)).await? {
            GetResult::Found(old, _) => old.len(),
            GetResult::NotFound => 0,
        };
        self.store.put(&Self::mirror_key(branch, relative_path), bytes.clone()).await?;
        let new_len = bytes.len();
        let hash = self.cow.write_blob(bytes).await?;
        self.trees
            .lock()
            .unwrap()
            .get_mut(branch)
            .expect("ensure_branch_loaded just populated this entry")
            .insert(relative_path.to_string(), hash);
        let mut on_disk = self.bytes_on_disk.lock().unwrap();
        *on_disk = on_disk.saturating_sub(previous_len as u64) + new_len as u64;
        Ok(())
    }

    /// Drops the mirror key and the flat-tree entry. The underlying
    /// content-addressed blob is never hard-deleted.
    async fn remove_and_unmirror(&self, branch: &str, relative_path: &str) -> Result<()> {
        self.ensure_branch_loaded(branch).await?;
        let key = Self::mirror_key(branch, relative_path);
        if let GetResult::Found(bytes, _) = self.store.get(&key).await? {
            let mut on_disk = self.bytes_on_disk.lock().unwrap();
            *on_disk = on_disk.saturating_sub(bytes.len() as u64);
        }
        self.store.delete(&key).await?;
        self.trees.lock().unwrap().get_mut(branch).map(|t| t.remove(relative_path));
        Ok(())
    }

    async fn persist_verb_ids(&self) -> Result<()> {
        let bytes = self.verb_ids.lock().unwrap().to_bytes()?;
        self.store.put(&verb_id_mapper_key(), bytes).await?;
        Ok(())
    }

    async fn persist_statistics(&self) -> Result<()> {
        let stats = PersistedStats {
            noun_count: *self.noun_count.lock().unwrap(),
            verb_count: *self.verb_count.lock().unwrap(),
            bytes_on_disk: *self.bytes_on_disk.lock().unwrap(),
        };
        let bytes = serde_json::to_vec(&stats)?;
        self.store.put(&statistics_key(), bytes).await?;
        Ok(())
    }

    /// Flushes the graph LSM-trees, updates `_system/statistics`, folds
    /// the branch's flat tree into nested COW objects, and seals a
    /// commit.
    async fn commit(&self, branch: &str, message: &str) -> Result<String> {
        self.graph.force_flush_all().await?;
        self.persist_statistics().await?;
        let flat = self.trees.lock().unwrap().get(branch).cloned().unwrap_or_default();
        let tree_hash = build_tree(&self.cow, &flat).await?;
        self.cow.create_commit(branch, &tree_hash, "stratum", message).await
    }

    pub async fn has(&self, id: &Uuid) -> Result<bool> {
        let branch = self.current_branch();
        let shard = shard_of(id);
        let has_vector = self.store.exists(&Self::mirror_key(&branch, &noun_path(&shard, id, "vector"))).await?;
        let has_metadata = self.store.exists(&Self::mirror_key(&branch, &noun_path(&shard, id, "metadata"))).await?;
        Ok(has_vector && has_metadata)
    }

    pub async fn get(&self, id: &Uuid) -> Result<Noun> {
        let branch = self.current_branch();
        let shard = shard_of(id);
        let vector_bytes = match self.store.get(&Self::mirror_key(&branch, &noun_path(&shard, id, "vector"))).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => return Err(StratumError::not_found("noun", id.to_string())),
        };
        let metadata_bytes = match self.store.get(&Self::mirror_key(&branch, &noun_path(&shard, id, "metadata"))).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => return Err(StratumError::not_found("noun", id.to_string())),
        };
        let vector: Vector = bincode::deserialize(&vector_bytes)?;
        let envelope: NounEnvelope = serde_json::from_slice(&metadata_bytes)?;
        Ok(Noun {
            id: *id,
            noun_type: envelope.noun_type,
            vector,
            metadata: envelope.metadata,
        })
    }

    async fn get_verb(&self, id: &Uuid) -> Result<Verb> {
        let branch = self.current_branch();
        let shard = shard_of(id);
        let vector_bytes = match self.store.get(&Self::mirror_key(&branch, &verb_path(&shard, id, "vector"))).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => return Err(StratumError::not_found("verb", id.to_string())),
        };
        let metadata_bytes = match self.store.get(&Self::mirror_key(&branch, &verb_path(&shard, id, "metadata"))).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => return Err(StratumError::not_found("verb", id.to_string())),
        };
        let vector: Vector = bincode::deserialize(&vector_bytes)?;
        let envelope: VerbEnvelope = serde_json::from_slice(&metadata_bytes)?;
        Ok(Verb {
            id: *id,
            verb_type: envelope.verb_type,
            source_id: envelope.source_id,
            target_id: envelope.target_id,
            weight: envelope.weight,
            vector,
            metadata: envelope.metadata,
        })
    }

    /// `add({vector, metadata, type}) -> id`.
    pub async fn add(&self, noun_type: &str, vector: Vector, metadata: Metadata, id: Option<Uuid>) -> Result<Uuid> {
        validate_dimension(&vector, self.config.dimension)?;
        let id = id.unwrap_or_else(Uuid::new_v4);
        if self.has(&id).await? {
            return Err(StratumError::AlreadyExists { key: id.to_string() });
        }
        let branch = self.current_branch();
        let shard = shard_of(&id);

        let vector_bytes = bincode::serialize(&vector)?;
        let envelope = NounEnvelope {
            noun_type: noun_type.to_string(),
            metadata: metadata.clone(),
        };
        let metadata_bytes = serde_json::to_vec(&envelope)?;

        self.write_and_mirror(&branch, &noun_path(&shard, &id, "vector"), vector_bytes).await?;
        self.write_and_mirror(&branch, &noun_path(&shard, &id, "metadata"), metadata_bytes).await?;

        self.metadata.add_to_index(id, &metadata).await?;
        let int_id = self
            .metadata
            .int_id_of(&id)
            .expect("add_to_index just assigned an int id for this uuid");
        self.vector.insert(noun_type, id, int_id, vector).await?;

        *self.noun_count.lock().unwrap() += 1;
        self.commit(&branch, &format!("add noun {id}")).await?;
        Ok(id)
    }

    /// `update(id, metadataDelta, {merge|replace}) -> bool`.
    pub async fn update(&self, id: &Uuid, delta: Metadata, merge: bool) -> Result<bool> {
        let Ok(current) = self.get(id).await else {
            return Ok(false);
        };
        let branch = self.current_branch();

        self.metadata.remove_from_index(id, &current.metadata).await?;
        let new_metadata = if merge {
            let mut merged = current.metadata.clone();
            merged.extend(delta);
            merged
        } else {
            delta
        };
        self.metadata.add_to_index(*id, &new_metadata).await?;

        let shard = shard_of(id);
        let envelope = NounEnvelope {
            noun_type: current.noun_type,
            metadata: new_metadata,
        };
        let metadata_bytes = serde_json::to_vec(&envelope)?;
        self.write_and_mirror(&branch, &noun_path(&shard, id, "metadata"), metadata_bytes).await?;
        self.commit(&branch, &format!("update noun {id}")).await?;
        Ok(true)
    }

    /// `delete(id, {cascade}) -> bool`.
    pub async fn delete(&self, id: &Uuid, cascade: bool) -> Result<bool> {
        let Ok(noun) = self.get(id).await else {
            return Ok(false);
        };
        let Some(int_id) = self.metadata.int_id_of(id) else {
            return Ok(false);
        };
        let branch = self.current_branch();

        if cascade {
            for verb_id in self.graph.incident_verbs(int_id).await {
                self.delete_verb(&verb_id).await?;
            }
        }

        self.metadata.remove_from_index(id, &noun.metadata).await?;
        self.vector.remove(&noun.noun_type, int_id).await?;

        let shard = shard_of(id);
        self.remove_and_unmirror(&branch, &noun_path(&shard, id, "vector")).await?;
        self.remove_and_unmirror(&branch, &noun_path(&shard, id, "metadata")).await?;

        let mut count = self.noun_count.lock().unwrap();
        *count = count.saturating_sub(1);
        drop(count);
        self.commit(&branch, &format!("delete noun {id}")).await?;
        Ok(true)
    }

    /// `relate(sourceId, targetId, type, metadata?, weight?) -> id`.
    /// `vector` defaults to a zero vector of the database's configured
    /// dimension when the caller doesn't supply one for the edge.
    pub async fn relate(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        verb_type: &str,
        metadata: Metadata,
        weight: Option<f32>,
        vector: Option<Vector>,
        id: Option<Uuid>,
    ) -> Result<Uuid> {
        let source_int = self
            .metadata
            .int_id_of(&source_id)
            .ok_or_else(|| StratumError::not_found("noun", source_id.to_string()))?;
        let target_int = self
            .metadata
            .int_id_of(&target_id)
            .ok_or_else(|| StratumError::not_found("noun", target_id.to_string()))?;

        let id = id.unwrap_or_else(Uuid::new_v4);
        let branch = self.current_branch();
        let vector = vector.unwrap_or_else(|| vec![0.0; self.config.dimension]);
        validate_dimension(&vector, self.config.dimension)?;
        let weight = weight.unwrap_or(1.0);

        let verb = Verb {
            id,
            verb_type: verb_type.to_string(),
            source_id,
            target_id,
            weight,
            vector: vector.clone(),
            metadata: metadata.clone(),
        };
        verb.validate_weight()?;

        let verb_int = self.verb_ids.lock().unwrap().get_or_assign(id);

        let shard = shard_of(&id);
        let vector_bytes = bincode::serialize(&vector)?;
        let envelope = VerbEnvelope {
            verb_type: verb_type.to_string(),
            source_id,
            target_id,
            weight,
            metadata,
        };
        let metadata_bytes = serde_json::to_vec(&envelope)?;
        self.write_and_mirror(&branch, &verb_path(&shard, &id, "vector"), vector_bytes).await?;
        self.write_and_mirror(&branch, &verb_path(&shard, &id, "metadata"), metadata_bytes).await?;

        self.graph.add_verb(&verb, source_int, target_int, verb_int).await?;
        self.persist_verb_ids().await?;
        *self.verb_count.lock().unwrap() += 1;
        self.commit(&branch, &format!("relate {source_id} -> {target_id}")).await?;
        Ok(id)
    }

    /// `deleteVerb(id) -> bool`.
    pub async fn delete_verb(&self, id: &Uuid) -> Result<bool> {
        let Some(verb_int) = self.verb_ids.lock().unwrap().int_of(id) else {
            return Ok(false);
        };
        if self.graph.delete_verb(id, verb_int).await.is_err() {
            return Ok(false);
        }
        self.verb_ids.lock().unwrap().retire(id);
        self.persist_verb_ids().await?;

        let branch = self.current_branch();
        let shard = shard_of(id);
        self.remove_and_unmirror(&branch, &verb_path(&shard, id, "vector")).await?;
        self.remove_and_unmirror(&branch, &verb_path(&shard, id, "metadata")).await?;

        let mut count = self.verb_count.lock().unwrap();
        *count = count.saturating_sub(1);
        drop(count);
        self.commit(&branch, &format!("delete verb {id}")).await?;
        Ok(true)
    }

    /// `search({like?, where?, connected?, limit, offset, threshold,
    /// explain}) -> { results, cursor?, explain? }`.
    pub async fn search(&self, query: &Query, deadline: Option<Instant>) -> Result<SearchOutcome> {
        let branch = self.current_branch();
        let total = *self.noun_count.lock().unwrap();
        let commit_hash = self.cow.current_commit(&branch).await?.unwrap_or_default();
        self.query.search(query, total, &commit_hash, deadline).await
    }

    /// `searchWithCursor(cursor) -> { results, cursor? }`.
    pub async fn search_with_cursor(&self, cursor: &str, limit: usize) -> Result<SearchOutcome> {
        let branch = self.current_branch();
        let commit_hash = self.cow.current_commit(&branch).await?.unwrap_or_default();
        self.query.search_with_cursor(cursor, &commit_hash, limit).await
    }

    /// Maps a search result's internal integer id back to the noun's
    /// `Uuid`, for callers that only have the `Query` engine's raw ids.
    pub fn resolve_noun_id(&self, int_id: u32) -> Option<Uuid> {
        self.metadata.uuid_of(int_id)
    }

    fn paths_under(&self, branch: &str, prefix: &str, suffix: &str) -> Vec<Uuid> {
        let trees = self.trees.lock().unwrap();
        let Some(flat) = trees.get(branch) else {
            return Vec::new();
        };
        let mut ids: Vec<Uuid> = flat
            .keys()
            .filter_map(|path| {
                let rest = path.strip_prefix(prefix)?;
                let rest = rest.strip_suffix(suffix)?;
                let (_shard, id_str) = rest.split_once('/')?;
                Uuid::parse_str(id_str).ok()
            })
            .collect();
        ids.sort();
        ids
    }

    /// `getNouns({pagination, filter}) -> paginated set`. `cursor` is a
    /// decimal offset into the sorted id scan; `None` once exhausted.
    pub async fn get_nouns(&self, noun_type: Option<&str>, cursor: Option<&str>, limit: usize) -> Result<Page<Noun>> {
        let branch = self.current_branch();
        self.ensure_branch_loaded(&branch).await?;
        let ids = self.paths_under(&branch, "nouns/", "/metadata");
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut items = Vec::new();
        let mut idx = start;
        while items.len() < limit && idx < ids.len() {
            let noun = self.get(&ids[idx]).await?;
            idx += 1;
            if noun_type.is_some_and(|t| t != noun.noun_type) {
                continue;
            }
            items.push(noun);
        }
        let next_cursor = if idx < ids.len() { Some(idx.to_string()) } else { None };
        Ok(Page { items, next_cursor })
    }

    /// `getVerbs({pagination, filter}) -> paginated set`.
    pub async fn get_verbs(&self, verb_type: Option<&str>, cursor: Option<&str>, limit: usize) -> Result<Page<Verb>> {
        let branch = self.current_branch();
        self.ensure_branch_loaded(&branch).await?;
        let ids = self.paths_under(&branch, "verbs/", "/metadata");
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let mut items = Vec::new();
        let mut idx = start;
        while items.len() < limit && idx < ids.len() {
            let verb = self.get_verb(&ids[idx]).await?;
            idx += 1;
            if verb_type.is_some_and(|t| t != verb.verb_type) {
                continue;
            }
            items.push(verb);
        }
        let next_cursor = if idx < ids.len() { Some(idx.to_string()) } else { None };
        Ok(Page { items, next_cursor })
    }

    /// `statistics() -> { nounCount, verbCount, bytesOnDisk, indexBytes, ... }`.
    pub fn statistics(&self) -> Statistics {
        let index_bytes = (self.cache.capacity() as f64 * self.cache.pressure()).round() as u64;
        Statistics {
            noun_count: *self.noun_count.lock().unwrap(),
            verb_count: *self.verb_count.lock().unwrap(),
            bytes_on_disk: *self.bytes_on_disk.lock().unwrap(),
            index_bytes,
            cache_pressure: self.cache.pressure(),
        }
    }

    /// `createBranch(name, fromBranch?) -> ()`. An atomic ref copy: no
    /// entity data moves.
    pub async fn create_branch(&self, name: &str, from_branch: Option<&str>) -> Result<()> {
        let source = from_branch.map(str::to_string).unwrap_or_else(|| self.current_branch());
        self.cow.branch_from(&source, name).await?;
        self.ensure_branch_loaded(&source).await?;
        let flat = self.trees.lock().unwrap().get(&source).cloned().unwrap_or_default();
        self.trees.lock().unwrap().insert(name.to_string(), flat);
        Ok(())
    }

    /// `asOf(branch, timestampMs) -> read-only handle`.
    pub async fn as_of(&self, branch: &str, timestamp_ms: Option<i64>) -> Result<AsOfHandle> {
        let tree_hash = self
            .cow
            .read_branch_at(branch, timestamp_ms)
            .await?
            .ok_or_else(|| StratumError::not_found("branch", branch.to_string()))?;
        let snapshot = self.cow.flatten_tree(&tree_hash, "").await?;
        Ok(AsOfHandle {
            cow: self.cow.clone(),
            snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryStore;
    use crate::model::Value;
    use crate::query::ScoreWeights;

    async fn db(dimension: usize) -> Database {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        Database::open(store, StratumConfig::new(dimension)).await.unwrap()
    }

    fn vec_with(dim: usize, lead: f32) -> Vector {
        let mut v = vec![0.0f32; dim];
        v[0] = lead;
        v[1] = 1.0;
        v
    }

    #[tokio::test]
    async fn add_then_get_round_trips_entity() {
        let database = db(4).await;
        let id = database
            .add("Concept", vec_with(4, 1.0), Metadata::new(), None)
            .await
            .unwrap();
        assert!(database.has(&id).await.unwrap());
        let noun = database.get(&id).await.unwrap();
        assert_eq!(noun.noun_type, "Concept");
        assert_eq!(noun.vector, vec_with(4, 1.0));
    }

    #[tokio::test]
    async fn update_merges_metadata_by_default() {
        let database = db(4).await;
        let mut metadata = Metadata::new();
        metadata.insert("status".to_string(), Value::String("active".into()));
        let id = database.add("Character", vec_with(4, 1.0), metadata, None).await.unwrap();

        let mut delta = Metadata::new();
        delta.insert("tier".to_string(), Value::String("gold".into()));
        assert!(database.update(&id, delta, true).await.unwrap());

        let noun = database.get(&id).await.unwrap();
        assert_eq!(noun.metadata.get("status"), Some(&Value::String("active".into())));
        assert_eq!(noun.metadata.get("tier"), Some(&Value::String("gold".into())));
    }

    #[tokio::test]
    async fn delete_removes_entity_and_cascades_verbs() {
        let database = db(4).await;
        let a = database.add("Concept", vec_with(4, 1.0), Metadata::new(), None).await.unwrap();
        let b = database.add("Concept", vec_with(4, 2.0), Metadata::new(), None).await.unwrap();
        database.relate(a, b, "knows", Metadata::new(), None, None, None).await.unwrap();

        assert!(database.delete(&a, true).await.unwrap());
        assert!(!database.has(&a).await.unwrap());
        let verbs = database.get_verbs(None, None, 10).await.unwrap();
        assert!(verbs.items.is_empty());
        assert!(database.has(&b).await.unwrap());
    }

    #[tokio::test]
    async fn relate_requires_both_endpoints_to_exist() {
        let database = db(4).await;
        let a = database.add("Concept", vec_with(4, 1.0), Metadata::new(), None).await.unwrap();
        let err = database
            .relate(a, Uuid::new_v4(), "knows", Metadata::new(), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::NotFound { .. }));
    }

    #[tokio::test]
    async fn search_finds_nearest_by_vector() {
        let database = db(4).await;
        let mut ids = Vec::new();
        for i in 0..20u32 {
            let id = database
                .add("Concept", vec_with(4, i as f32), Metadata::new(), None)
                .await
                .unwrap();
            ids.push(id);
        }
        let query = Query {
            noun_type: Some("Concept".to_string()),
            like: Some(vec_with(4, 19.0)),
            limit: 3,
            weights: ScoreWeights::default(),
            ..Query::default()
        };
        let outcome = database.search(&query, None).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
        let top_id = database.resolve_noun_id(outcome.results[0].id).unwrap();
        assert_eq!(top_id, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn branch_created_from_main_is_isolated_on_delete() {
        let database = db(4).await;
        let id = database.add("Concept", vec_with(4, 1.0), Metadata::new(), None).await.unwrap();
        database.create_branch("exp", None).await.unwrap();

        database.checkout("exp");
        assert!(database.delete(&id, false).await.unwrap());
        assert!(!database.has(&id).await.unwrap());

        database.checkout("main");
        assert!(database.has(&id).await.unwrap());
    }

    #[tokio::test]
    async fn as_of_returns_the_state_at_an_earlier_commit() {
        let database = db(4).await;
        let id = database.add("Concept", vec_with(4, 1.0), Metadata::new(), None).await.unwrap();
        let c1_ts = database.cow.current_commit(DEFAULT_BRANCH).await.unwrap();
        assert!(c1_ts.is_some());
        let as_of_ts = chrono::Utc::now().timestamp_millis();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut delta = Metadata::new();
        delta.insert("status".to_string(), Value::String("updated".into()));
        database.update(&id, delta, true).await.unwrap();

        let handle = database.as_of(DEFAULT_BRANCH, Some(as_of_ts)).await.unwrap();
        let snapshot_noun = handle.get(&id).await.unwrap();
        assert!(!snapshot_noun.metadata.contains_key("status"));

        let live_noun = database.get(&id).await.unwrap();
        assert_eq!(live_noun.metadata.get("status"), Some(&Value::String("updated".into())));
    }

    #[tokio::test]
    async fn statistics_reports_live_counts() {
        let database = db(4).await;
        database.add("Concept", vec_with(4, 1.0), Metadata::new(), None).await.unwrap();
        database.add("Concept", vec_with(4, 2.0), Metadata::new(), None).await.unwrap();
        let stats = database.statistics();
        assert_eq!(stats.noun_count, 2);
        assert_eq!(stats.verb_count, 0);
    }
}
