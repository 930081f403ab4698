//! A chunk holds postings for roughly 50 distinct field-values. The
//! descriptor (bloom filter, zone map, value/id counts) is small and
//! kept resident per field; the payload (value → roaring bitmap map) is
//! loaded on demand through the Unified Cache.

use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::model::Value;

use super::bloom::BloomFilter;
use super::zonemap::ZoneMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: u32,
    pub distinct_value_count: usize,
    pub total_id_count: u64,
    pub zone_map: ZoneMap,
    pub bloom: BloomFilter,
    pub storage_key: String,
}

/// A chunk's payload: normalized value → compressed roaring bitmap of
/// integer ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub postings: FxHashMap<String, RoaringBitmap>,
    /// One representative original `Value` per normalized key, kept
    /// alongside the postings so range scans can compare against `[min, max]` without having
    /// to reverse-parse the normalized string form.
    pub representatives: FxHashMap<String, Value>,
}

impl ChunkPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, normalized_value: &str, id: u32, original: &Value) {
        self.postings
            .entry(normalized_value.to_string())
            .or_default()
            .insert(id);
        self.representatives
            .entry(normalized_value.to_string())
            .or_insert_with(|| original.clone());
    }

    pub fn remove(&mut self, normalized_value: &str, id: u32) -> bool {
        let mut emptied = false;
        if let Some(bitmap) = self.postings.get_mut(normalized_value) {
            bitmap.remove(id);
            if bitmap.is_empty() {
                self.postings.remove(normalized_value);
                self.representatives.remove(normalized_value);
                emptied = true;
            }
        }
        emptied
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    pub fn distinct_values(&self) -> usize {
        self.postings.len()
    }

    pub fn total_ids(&self) -> u64 {
        self.postings.values().map(|b| b.len()).sum()
    }

    /// Serializes with `roaring`'s portable bitmap format inside a
    /// bincode envelope.
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        let mut serializable: Vec<(String, Vec<u8>, Value)> = Vec::with_capacity(self.postings.len());
        for (value, bitmap) in &self.postings {
            let mut buf = Vec::new();
            bitmap.serialize_into(&mut buf).map_err(|e| {
                crate::error::StratumError::corruption("metadata_index", e.to_string())
            })?;
            let repr = self.representatives.get(value).cloned().unwrap_or(Value::Null);
            serializable.push((value.clone(), buf, repr));
        }
        Ok(bincode::serialize(&serializable)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        let serializable: Vec<(String, Vec<u8>, Value)> = bincode::deserialize(bytes)?;
        let mut postings = FxHashMap::default();
        let mut representatives = FxHashMap::default();
        for (value, buf, repr) in serializable {
            let bitmap = RoaringBitmap::deserialize_from(&buf[..]).map_err(|e| {
                crate::error::StratumError::corruption("metadata_index", e.to_string())
            })?;
            postings.insert(value.clone(), bitmap);
            representatives.insert(value, repr);
        }
        Ok(Self { postings, representatives })
    }
}

pub fn rebuild_descriptor(chunk_id: u32, payload: &ChunkPayload, storage_key: String, values_for_zonemap: &[(String, Value)], fp_rate: f64) -> ChunkDescriptor {
    let mut zone_map = ZoneMap::empty();
    for (_, v) in values_for_zonemap {
        zone_map.observe(v);
    }
    let mut bloom = BloomFilter::new(payload.distinct_values().max(1), fp_rate);
    for value in payload.postings.keys() {
        bloom.insert(value);
    }
    ChunkDescriptor {
        chunk_id,
        distinct_value_count: payload.distinct_values(),
        total_id_count: payload.total_ids(),
        zone_map,
        bloom,
        storage_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_bytes() {
        let mut payload = ChunkPayload::new();
        let active = Value::String("active".into());
        let inactive = Value::String("inactive".into());
        payload.insert("active", 1, &active);
        payload.insert("active", 2, &active);
        payload.insert("inactive", 3, &inactive);
        let bytes = payload.to_bytes().unwrap();
        let back = ChunkPayload::from_bytes(&bytes).unwrap();
        assert_eq!(back.postings["active"].len(), 2);
        assert_eq!(back.postings["inactive"].len(), 1);
    }

    #[test]
    fn remove_empties_value_then_chunk() {
        let mut payload = ChunkPayload::new();
        payload.insert("x", 1, &Value::String("x".into()));
        let emptied = payload.remove("x", 1);
        assert!(emptied);
        assert!(payload.is_empty());
    }
}
