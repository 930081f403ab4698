//! Metadata Index: a chunked sparse inverted index
//! delivering O(1) exact lookups and O(log n) range queries while
//! keeping memory bounded. Grounded on the per-field descriptor/payload
//! split visible in the `bm25` module (a small resident config object
//! plus a larger on-demand postings structure), generalized here to
//! roaring-bitmap postings over bloom-filtered, zone-mapped chunks.

pub mod bloom;
pub mod chunk;
pub mod field_registry;
pub mod id_mapper;
pub mod sorted_index;
pub mod zonemap;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use roaring::RoaringBitmap;
use uuid::Uuid;

use crate::blob_store::{BlobStore, GetResult};
use crate::cache::{CachedItem, ItemKind, UnifiedCache};
use crate::config::MetadataIndexConfig;
use crate::error::{Result, StratumError};
use crate::model::{Metadata, Value, is_excluded_field};

use chunk::{ChunkDescriptor, ChunkPayload};
use field_registry::FieldRegistry;
use id_mapper::EntityIdMapper;
use sorted_index::SortedIndex;

struct FieldState {
    descriptors: Vec<ChunkDescriptor>,
    payloads: HashMap<u32, ChunkPayload>,
    sorted: SortedIndex,
    next_chunk_id: u32,
    dirty_chunks: std::collections::HashSet<u32>,
    dirty_descriptors: bool,
    dirty_sorted: bool,
}

impl FieldState {
    fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
            payloads: HashMap::new(),
            sorted: SortedIndex::new(),
            next_chunk_id: 0,
            dirty_chunks: std::collections::HashSet::new(),
            dirty_descriptors: false,
            dirty_sorted: false,
        }
    }
}

/// A predicate over one field, as the Query Planner issues it.
pub enum Predicate {
    Equals(Value),
    Range { min: Value, max: Value },
}

pub struct MetadataIndex {
    store: Arc<dyn BlobStore>,
    cache: Arc<UnifiedCache>,
    config: MetadataIndexConfig,
    field_registry: Mutex<FieldRegistry>,
    id_mapper: Mutex<EntityIdMapper>,
    fields: Mutex<HashMap<String, FieldState>>,
}

fn field_registry_key() -> String {
    "_system/metadata_indexes/__metadata_field_registry__".to_string()
}

fn sparse_index_key(field: &str) -> String {
    format!("_system/metadata_indexes/__sparse_index__{field}")
}

fn chunk_key(field: &str, chunk_id: u32) -> String {
    format!("_system/metadata_indexes/__metadata_chunk__{field}_{chunk_id}")
}

fn sorted_index_key(field: &str) -> String {
    format!("_system/metadata_indexes/__metadata_sorted_index__{field}")
}

fn id_mapper_key() -> String {
    "_system/metadata_indexes/__entity_id_mapper__".to_string()
}

impl MetadataIndex {
    pub async fn open(store: Arc<dyn BlobStore>, cache: Arc<UnifiedCache>, config: MetadataIndexConfig) -> Result<Self> {
        let field_registry = match store.get(&field_registry_key()).await? {
            GetResult::Found(bytes, _) => FieldRegistry::from_bytes(&bytes)?,
            GetResult::NotFound => FieldRegistry::new(),
        };
        let id_mapper = match store.get(&id_mapper_key()).await? {
            GetResult::Found(bytes, _) => EntityIdMapper::from_bytes(&bytes)?,
            GetResult::NotFound => EntityIdMapper::new(),
        };
        Ok(Self {
            store,
            cache,
            config,
            field_registry: Mutex::new(field_registry),
            id_mapper: Mutex::new(id_mapper),
            fields: Mutex::new(HashMap::new()),
        })
    }

    pub fn int_id_of(&self, id: &Uuid) -> Option<u32> {
        self.id_mapper.lock().unwrap().int_of(id)
    }

    pub fn uuid_of(&self, int_id: u32) -> Option<Uuid> {
        self.id_mapper.lock().unwrap().uuid_of(int_id)
    }

    /// Loads (if not already resident) the sparse index descriptor list
    /// for `field`; sparse indices are lazy-loaded on first query
    /// touching that field.
    async fn ensure_field_loaded(&self, field: &str) -> Result<()> {
        {
            let fields = self.fields.lock().unwrap();
            if fields.contains_key(field) {
                return Ok(());
            }
        }
        let state = match self.store.get(&sparse_index_key(field)).await? {
            GetResult::Found(bytes, _) => {
                let descriptors: Vec<ChunkDescriptor> = serde_json::from_slice(&bytes)?;
                let next_chunk_id = descriptors.iter().map(|d| d.chunk_id + 1).max().unwrap_or(0);
                let sorted = match self.store.get(&sorted_index_key(field)).await? {
                    GetResult::Found(bytes, _) => bincode::deserialize(&bytes)?,
                    GetResult::NotFound => SortedIndex::new(),
                };
                FieldState {
                    descriptors,
                    payloads: HashMap::new(),
                    sorted,
                    next_chunk_id,
                    dirty_chunks: std::collections::HashSet::new(),
                    dirty_descriptors: false,
                    dirty_sorted: false,
                }
            }
            GetResult::NotFound => FieldState::empty(),
        };
        self.fields.lock().unwrap().insert(field.to_string(), state);
        Ok(())
    }

    async fn load_chunk_payload(&self, field: &str, chunk_id: u32) -> Result<ChunkPayload> {
        let cache_key = format!("{field}::{chunk_id}");
        if let Some(item) = self.cache.get(&cache_key) {
            return ChunkPayload::from_bytes(&item.bytes);
        }
        let key = chunk_key(field, chunk_id);
        let bytes = match self.store.get(&key).await? {
            GetResult::Found(bytes, _) => bytes,
            GetResult::NotFound => {
                return Err(StratumError::corruption(
                    "metadata_index",
                    format!("chunk {field}/{chunk_id} missing from storage"),
                ));
            }
        };
        let payload = ChunkPayload::from_bytes(&bytes)?;
        self.cache.put(
            cache_key,
            CachedItem {
                bytes: Arc::new(bytes.clone()),
                kind: ItemKind::MetadataChunk,
            },
            bytes.len(),
        );
        Ok(payload)
    }

    /// Adds `id`'s metadata to every non-excluded field's index.
    pub async fn add_to_index(&self, id: Uuid, metadata: &Metadata) -> Result<()> {
        let int_id = self.id_mapper.lock().unwrap().get_or_assign(id);
        for (field, value) in metadata {
            if is_excluded_field(field) || value.is_null() {
                continue;
            }
            self.field_registry.lock().unwrap().observe(field, value)?;
            self.ensure_field_loaded(field).await?;
            for normalized in value.normalized_entries() {
                self.insert_value(field, &normalized, value, int_id).await?;
            }
            if matches!(
                value,
                Value::String(_) | Value::Integer(_) | Value::Float(_) | Value::Temporal(_)
            ) {
                let mut fields = self.fields.lock().unwrap();
                let state = fields.get_mut(field).unwrap();
                state.sorted.insert(value.clone(), int_id);
                state.dirty_sorted = true;
            }
        }
        self.flush_dirty(metadata.keys()).await?;
        self.persist_field_registry().await?;
        self.persist_id_mapper().await?;
        Ok(())
    }

    async fn insert_value(&self, field: &str, normalized: &str, original: &Value, int_id: u32) -> Result<()> {
        // Find an existing chunk already holding this value.
        let candidate_chunk = {
            let fields = self.fields.lock().unwrap();
            let state = fields.get(field).unwrap();
            state
                .descriptors
                .iter()
                .filter(|d| d.bloom.admits(normalized))
                .map(|d| d.chunk_id)
                .collect::<Vec<_>>()
        };
        let mut target_chunk = None;
        for chunk_id in candidate_chunk {
            let payload = self.payload_for(field, chunk_id).await?;
            if payload.postings.contains_key(normalized) {
                target_chunk = Some(chunk_id);
                break;
            }
        }
        let chunk_id = match target_chunk {
            Some(id) => id,
            None => self.open_chunk_for_write(field).await?,
        };
        let payload = self.payload_for(field, chunk_id).await?;
        let mut fields = self.fields.lock().unwrap();
        let state = fields.get_mut(field).unwrap();
        let payload_mut = state.payloads.get_mut(&chunk_id).unwrap();
        let _ = payload; // payload_for already warmed the cache entry above
        payload_mut.insert(normalized, int_id, original);
        let descriptor = state
            .descriptors
            .iter_mut()
            .find(|d| d.chunk_id == chunk_id)
            .expect("descriptor must exist for a loaded chunk");
        descriptor.zone_map.observe(original);
        descriptor.bloom.insert(normalized);
        descriptor.distinct_value_count = payload_mut.distinct_values();
        descriptor.total_id_count = payload_mut.total_ids();
        state.dirty_chunks.insert(chunk_id);
        state.dirty_descriptors = true;
        let needs_split = descriptor.distinct_value_count > self.config.chunk_target_size;
        drop(fields);
        if needs_split {
            self.split_chunk(field, chunk_id).await?;
        }
        Ok(())
    }

    /// Returns a chunk id a new value can be appended into: an existing
    /// chunk under the split threshold, or a freshly created one.
    async fn open_chunk_for_write(&self, field: &str) -> Result<u32> {
        let mut fields = self.fields.lock().unwrap();
        let state = fields.get_mut(field).unwrap();
        if let Some(open) = state
            .descriptors
            .iter()
            .find(|d| d.distinct_value_count < self.config.chunk_target_size)
        {
            return Ok(open.chunk_id);
        }
        let chunk_id = state.next_chunk_id;
        state.next_chunk_id += 1;
        state.descriptors.push(ChunkDescriptor {
            chunk_id,
            distinct_value_count: 0,
            total_id_count: 0,
            zone_map: zonemap::ZoneMap::empty(),
            bloom: bloom::BloomFilter::new(self.config.chunk_target_size, self.config.bloom_fp_rate),
            storage_key: chunk_key(field, chunk_id),
        });
        state.payloads.insert(chunk_id, ChunkPayload::new());
        state.dirty_chunks.insert(chunk_id);
        state.dirty_descriptors = true;
        Ok(chunk_id)
    }

    async fn payload_for(&self, field: &str, chunk_id: u32) -> Result<ChunkPayload> {
        {
            let fields = self.fields.lock().unwrap();
            if let Some(state) = fields.get(field) {
                if let Some(p) = state.payloads.get(&chunk_id) {
                    return Ok(p.clone());
                }
            }
        }
        let loaded = self.load_chunk_payload(field, chunk_id).await?;
        let mut fields = self.fields.lock().unwrap();
        fields.get_mut(field).unwrap().payloads.insert(chunk_id, loaded.clone());
        Ok(loaded)
    }

    /// Splits an over-full chunk in half, recomputing bloom filter and
    /// zone map for each half.
    async fn split_chunk(&self, field: &str, chunk_id: u32) -> Result<()> {
        let mut fields = self.fields.lock().unwrap();
        let state = fields.get_mut(field).unwrap();
        let payload = state.payloads.get(&chunk_id).cloned().unwrap();
        let mut keys: Vec<String> = payload.postings.keys().cloned().collect();
        keys.sort();
        let mid = keys.len() / 2;
        let (left_keys, right_keys) = keys.split_at(mid);

        let mut left = ChunkPayload::new();
        let mut right = ChunkPayload::new();
        for k in left_keys {
            left.postings.insert(k.clone(), payload.postings[k].clone());
            if let Some(v) = payload.representatives.get(k) {
                left.representatives.insert(k.clone(), v.clone());
            }
        }
        for k in right_keys {
            right.postings.insert(k.clone(), payload.postings[k].clone());
            if let Some(v) = payload.representatives.get(k) {
                right.representatives.insert(k.clone(), v.clone());
            }
        }

        let new_chunk_id = state.next_chunk_id;
        state.next_chunk_id += 1;

        let left_descriptor = chunk::rebuild_descriptor(
            chunk_id,
            &left,
            chunk_key(field, chunk_id),
            &left
                .representatives
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
            self.config.bloom_fp_rate,
        );
        let right_descriptor = chunk::rebuild_descriptor(
            new_chunk_id,
            &right,
            chunk_key(field, new_chunk_id),
            &right
                .representatives
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>(),
            self.config.bloom_fp_rate,
        );

        if let Some(d) = state.descriptors.iter_mut().find(|d| d.chunk_id == chunk_id) {
            *d = left_descriptor;
        }
        state.descriptors.push(right_descriptor);
        state.payloads.insert(chunk_id, left);
        state.payloads.insert(new_chunk_id, right);
        state.dirty_chunks.insert(chunk_id);
        state.dirty_chunks.insert(new_chunk_id);
        state.dirty_descriptors = true;
        Ok(())
    }

    /// Removes `id`'s metadata from every indexed field.
    pub async fn remove_from_index(&self, id: &Uuid, metadata: &Metadata) -> Result<()> {
        let Some(int_id) = self.id_mapper.lock().unwrap().int_of(id) else {
            return Ok(());
        };
        for (field, value) in metadata {
            if is_excluded_field(field) || value.is_null() {
                continue;
            }
            self.ensure_field_loaded(field).await?;
            for normalized in value.normalized_entries() {
                self.remove_value(field, &normalized, int_id).await?;
            }
            let mut fields = self.fields.lock().unwrap();
            let state = fields.get_mut(field).unwrap();
            state.sorted.remove(value, int_id);
            state.dirty_sorted = true;
        }
        self.flush_dirty(metadata.keys()).await?;
        Ok(())
    }

    async fn remove_value(&self, field: &str, normalized: &str, int_id: u32) -> Result<()> {
        let candidate_chunk = {
            let fields = self.fields.lock().unwrap();
            let state = fields.get(field).unwrap();
            state
                .descriptors
                .iter()
                .filter(|d| d.bloom.admits(normalized))
                .map(|d| d.chunk_id)
                .collect::<Vec<_>>()
        };
        for chunk_id in candidate_chunk {
            let _ = self.payload_for(field, chunk_id).await?;
            let mut fields = self.fields.lock().unwrap();
            let state = fields.get_mut(field).unwrap();
            let payload = state.payloads.get_mut(&chunk_id).unwrap();
            if !payload.postings.contains_key(normalized) {
                continue;
            }
            payload.remove(normalized, int_id);
            let distinct = payload.distinct_values();
            if distinct == 0 {
                state.payloads.remove(&chunk_id);
                state.descriptors.retain(|d| d.chunk_id != chunk_id);
                state.dirty_chunks.remove(&chunk_id);
            } else {
                if let Some(d) = state.descriptors.iter_mut().find(|d| d.chunk_id == chunk_id) {
                    d.distinct_value_count = distinct;
                    d.total_id_count = payload.total_ids();
                }
                state.dirty_chunks.insert(chunk_id);
            }
            state.dirty_descriptors = true;
            return Ok(());
        }
        Ok(())
    }

    async fn flush_dirty(&self, touched_fields: impl Iterator<Item = &String>) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for field in touched_fields {
            if !seen.insert(field.clone()) {
                continue;
            }
            let (dirty_chunks, dirty_descriptors, dirty_sorted, descriptors, sorted_bytes, chunk_bytes) = {
                let mut fields = self.fields.lock().unwrap();
                let Some(state) = fields.get_mut(field) else {
                    continue;
                };
                let dirty_chunks: Vec<u32> = state.dirty_chunks.drain().collect();
                let dirty_descriptors = state.dirty_descriptors;
                let dirty_sorted = state.dirty_sorted;
                state.dirty_descriptors = false;
                state.dirty_sorted = false;
                let descriptors = if dirty_descriptors {
                    Some(serde_json::to_vec(&state.descriptors)?)
                } else {
                    None
                };
                let sorted_bytes = if dirty_sorted {
                    Some(bincode::serialize(&state.sorted)?)
                } else {
                    None
                };
                let mut chunk_bytes = Vec::new();
                for chunk_id in &dirty_chunks {
                    if let Some(payload) = state.payloads.get(chunk_id) {
                        chunk_bytes.push((*chunk_id, payload.to_bytes()?));
                    }
                }
                (dirty_chunks, dirty_descriptors, dirty_sorted, descriptors, sorted_bytes, chunk_bytes)
            };
            let _ = (dirty_chunks, dirty_descriptors, dirty_sorted);
            if let Some(bytes) = descriptors {
                self.store.put(&sparse_index_key(field), bytes).await?;
            }
            if let Some(bytes) = sorted_bytes {
                self.store.put(&sorted_index_key(field), bytes).await?;
            }
            for (chunk_id, bytes) in chunk_bytes {
                self.store.put(&chunk_key(field, chunk_id), bytes.clone()).await?;
                self.cache.invalidate(&format!("{field}::{chunk_id}"));
            }
        }
        Ok(())
    }

    async fn persist_field_registry(&self) -> Result<()> {
        let bytes = self.field_registry.lock().unwrap().to_bytes()?;
        self.store.put(&field_registry_key(), bytes).await?;
        Ok(())
    }

    async fn persist_id_mapper(&self) -> Result<()> {
        let bytes = self.id_mapper.lock().unwrap().to_bytes()?;
        self.store.put(&id_mapper_key(), bytes).await?;
        Ok(())
    }

    /// Exact-match lookup.
    pub async fn get_ids(&self, field: &str, value: &Value) -> Result<RoaringBitmap> {
        self.ensure_field_loaded(field).await?;
        let Some(normalized) = value.normalize() else {
            return Ok(RoaringBitmap::new());
        };
        let candidate_chunk = {
            let fields = self.fields.lock().unwrap();
            let state = fields.get(field).unwrap();
            state
                .descriptors
                .iter()
                .filter(|d| d.bloom.admits(&normalized))
                .map(|d| d.chunk_id)
                .collect::<Vec<_>>()
        };
        let mut result = RoaringBitmap::new();
        for chunk_id in candidate_chunk {
            let payload = self.payload_for(field, chunk_id).await?;
            if let Some(bitmap) = payload.postings.get(&normalized) {
                result |= bitmap;
            }
        }
        Ok(result)
    }

    /// Range lookup.
    pub async fn get_ids_for_range(&self, field: &str, min: &Value, max: &Value) -> Result<RoaringBitmap> {
        self.ensure_field_loaded(field).await?;
        let surviving = {
            let fields = self.fields.lock().unwrap();
            let state = fields.get(field).unwrap();
            state
                .descriptors
                .iter()
                .filter(|d| !d.zone_map.disjoint_with(min, max))
                .map(|d| d.chunk_id)
                .collect::<Vec<_>>()
        };
        let mut result = RoaringBitmap::new();
        for chunk_id in surviving {
            let payload = self.payload_for(field, chunk_id).await?;
            for (normalized, bitmap) in &payload.postings {
                let Some(repr) = payload.representatives.get(normalized) else {
                    continue;
                };
                let in_range = match (repr, min.as_millis(), max.as_millis()) {
                    // Temporal values are normalized into 60s buckets, so every
                    // id sharing a bucket with `repr` must be returned as soon
                    // as the bucket's span overlaps [min, max), not just the
                    // one raw value that happened to become the representative.
                    (Value::Temporal(repr_ms), Some(min_ms), Some(max_ms)) => {
                        let bucket_start = (repr_ms / crate::model::TEMPORAL_BUCKET_MS) * crate::model::TEMPORAL_BUCKET_MS;
                        let bucket_end = bucket_start + crate::model::TEMPORAL_BUCKET_MS;
                        bucket_start < max_ms && bucket_end > min_ms
                    }
                    _ => {
                        repr.compare(min)
                            .map(|o| o != std::cmp::Ordering::Less)
                            .unwrap_or(false)
                            && repr
                                .compare(max)
                                .map(|o| o == std::cmp::Ordering::Less)
                                .unwrap_or(false)
                    }
                };
                if in_range {
                    result |= bitmap;
                }
            }
        }
        Ok(result)
    }

    /// Evaluates a conjunction of predicates by intersecting per-field
    /// bitmaps, short-circuiting on the first empty result.
    pub async fn intersect(&self, predicates: &[(String, Predicate)]) -> Result<RoaringBitmap> {
        let mut result: Option<RoaringBitmap> = None;
        for (field, predicate) in predicates {
            let bitmap = match predicate {
                Predicate::Equals(v) => self.get_ids(field, v).await?,
                Predicate::Range { min, max } => self.get_ids_for_range(field, min, max).await?,
            };
            if bitmap.is_empty() {
                return Ok(RoaringBitmap::new());
            }
            result = Some(match result {
                Some(acc) => acc & bitmap,
                None => bitmap,
            });
            if result.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
                return Ok(RoaringBitmap::new());
            }
        }
        Ok(result.unwrap_or_default())
    }

    /// Cheap selectivity estimate using only chunk descriptor counts, no
    /// payload loads.
    pub async fn estimated_count(&self, field: &str, predicate: &Predicate) -> Result<u64> {
        self.ensure_field_loaded(field).await?;
        let fields = self.fields.lock().unwrap();
        let state = fields.get(field).unwrap();
        let count = match predicate {
            Predicate::Equals(_) => {
                // Without loading payloads we cannot know the exact
                // per-value count; approximate with the chunk average.
                let total_ids: u64 = state.descriptors.iter().map(|d| d.total_id_count).sum();
                let total_values: usize = state.descriptors.iter().map(|d| d.distinct_value_count).sum();
                if total_values == 0 {
                    0
                } else {
                    total_ids / total_values as u64
                }
            }
            Predicate::Range { min, max } => state
                .descriptors
                .iter()
                .filter(|d| !d.zone_map.disjoint_with(min, max))
                .map(|d| d.total_id_count)
                .sum(),
        };
        Ok(count)
    }

    pub fn ordered_ids(&self, field: &str, descending: bool) -> Vec<u32> {
        let fields = self.fields.lock().unwrap();
        fields
            .get(field)
            .map(|s| s.sorted.ordered_ids(descending))
            .unwrap_or_default()
    }

    pub fn field_types(&self) -> Vec<field_registry::FieldEntry> {
        self.field_registry.lock().unwrap().entries()
    }

    /// Re-derives a field's chunks from scratch by replaying `entries`
    /// (id, metadata) pairs.
    /// Callers source `entries` by scanning the COW tree, since the
    /// Metadata Index itself owns no copy of entity metadata.
    pub async fn rebuild_field(&self, field: &str, entries: &[(Uuid, Metadata)]) -> Result<()> {
        self.fields.lock().unwrap().insert(field.to_string(), FieldState::empty());
        for (id, metadata) in entries {
            if let Some(value) = metadata.get(field) {
                if !value.is_null() {
                    let int_id = self.id_mapper.lock().unwrap().get_or_assign(*id);
                    for normalized in value.normalized_entries() {
                        self.insert_value(field, &normalized, value, int_id).await?;
                    }
                }
            }
        }
        self.flush_dirty(std::iter::once(&field.to_string())).await?;
        tracing::info!(field, "metadata index field rebuilt");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryStore;

    async fn index() -> MetadataIndex {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(UnifiedCache::new(1024 * 1024));
        MetadataIndex::open(store, cache, MetadataIndexConfig::default()).await.unwrap()
    }

    fn meta(pairs: &[(&str, Value)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn exact_match_finds_inserted_id() {
        let idx = index().await;
        let id = Uuid::new_v4();
        idx.add_to_index(id, &meta(&[("status", Value::String("active".into()))]))
            .await
            .unwrap();
        let int_id = idx.int_id_of(&id).unwrap();
        let bitmap = idx.get_ids("status", &Value::String("active".into())).await.unwrap();
        assert!(bitmap.contains(int_id));
        let empty = idx.get_ids("status", &Value::String("inactive".into())).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn remove_drops_id_from_postings() {
        let idx = index().await;
        let id = Uuid::new_v4();
        let m = meta(&[("status", Value::String("active".into()))]);
        idx.add_to_index(id, &m).await.unwrap();
        idx.remove_from_index(&id, &m).await.unwrap();
        let bitmap = idx.get_ids("status", &Value::String("active".into())).await.unwrap();
        assert!(bitmap.is_empty());
    }

    #[tokio::test]
    async fn chunk_splits_past_target_size() {
        let mut cfg = MetadataIndexConfig::default();
        cfg.chunk_target_size = 4;
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let cache = Arc::new(UnifiedCache::new(1024 * 1024));
        let idx = MetadataIndex::open(store, cache, cfg).await.unwrap();
        for i in 0..10 {
            let id = Uuid::new_v4();
            idx.add_to_index(id, &meta(&[("tag", Value::String(format!("t{i}")))]))
                .await
                .unwrap();
        }
        let fields = idx.fields.lock().unwrap();
        let state = fields.get("tag").unwrap();
        assert!(state.descriptors.len() > 1, "expected chunk split to have occurred");
    }

    #[tokio::test]
    async fn range_query_respects_bucketed_temporal_field() {
        let idx = index().await;
        let base = 1_700_000_000_000i64;
        let mut ids = Vec::new();
        for i in 0..10 {
            let id = Uuid::new_v4();
            ids.push(id);
            idx.add_to_index(id, &meta(&[("createdAt", Value::Temporal(base + i * 1000))]))
                .await
                .unwrap();
        }
        let bucket_min = Value::Temporal(base);
        let bucket_max = Value::Temporal(base + 60_000);
        let result = idx.get_ids_for_range("createdAt", &bucket_min, &bucket_max).await.unwrap();
        assert_eq!(result.len(), 10);
    }

    #[tokio::test]
    async fn range_query_matches_whole_bucket_regardless_of_insertion_order() {
        let idx = index().await;
        let base = 1_700_000_000_000i64;
        // Insert in decreasing timestamp order so the first (and therefore
        // the stored representative) value is the latest, not the earliest,
        // timestamp in the bucket.
        for i in (0..10).rev() {
            let id = Uuid::new_v4();
            idx.add_to_index(id, &meta(&[("createdAt", Value::Temporal(base + i * 1000))]))
                .await
                .unwrap();
        }
        let result = idx
            .get_ids_for_range("createdAt", &Value::Temporal(base), &Value::Temporal(base + 1_000))
            .await
            .unwrap();
        assert_eq!(result.len(), 10, "a query narrower than the bucket must still return every id in it");
    }

    #[tokio::test]
    async fn intersection_short_circuits_on_empty() {
        let idx = index().await;
        let id = Uuid::new_v4();
        idx.add_to_index(
            id,
            &meta(&[
                ("status", Value::String("active".into())),
                ("tier", Value::String("gold".into())),
            ]),
        )
        .await
        .unwrap();
        let predicates = vec![
            ("status".to_string(), Predicate::Equals(Value::String("active".into()))),
            ("tier".to_string(), Predicate::Equals(Value::String("silver".into()))),
        ];
        let result = idx.intersect(&predicates).await.unwrap();
        assert!(result.is_empty());
    }
}
