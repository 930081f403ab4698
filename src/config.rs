//! Top-level configuration, grounded on
//! `helix_engine::graph_core::config::Config`: a
//! nested `serde`-derived struct loaded from JSON, with an
//! `init_config()` template constructor.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::vector_index::distance::DistanceMetric;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorIndexConfig {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Split the HNSW graph into one sub-graph per noun type.
    pub partition_by_type: bool,
    /// Distance function applied to every vector comparison; cosine on
    /// normalized vectors by default, with dot product or Euclidean as
    /// configurable fallbacks.
    pub distance: DistanceMetric,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 128,
            ef_search: 128,
            partition_by_type: true,
            distance: DistanceMetric::Cosine,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataIndexConfig {
    /// Target number of distinct values per chunk before splitting.
    pub chunk_target_size: usize,
    /// Target bloom filter false-positive rate.
    pub bloom_fp_rate: f64,
}

impl Default for MetadataIndexConfig {
    fn default() -> Self {
        Self {
            chunk_target_size: 50,
            bloom_fp_rate: 0.01,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphIndexConfig {
    /// Size ratio between adjacent LSM levels.
    pub lsm_size_ratio: usize,
    /// Number of memtable entries before an L0 flush is triggered.
    pub memtable_flush_threshold: usize,
}

impl Default for GraphIndexConfig {
    fn default() -> Self {
        Self {
            lsm_size_ratio: 10,
            memtable_flush_threshold: 4096,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlobStoreBackend {
    LocalFs,
    Memory,
    ObjectStore,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    pub backend: BlobStoreBackend,
    pub gzip: bool,
    /// Minimum blob size before optional zstd compression kicks in; the
    /// threshold is configurable rather than fixed. See DESIGN.md
    /// decision 2.
    pub zstd_threshold_bytes: usize,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobStoreBackend::LocalFs,
            gzip: false,
            zstd_threshold_bytes: 4096,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StratumConfig {
    pub vector: VectorIndexConfig,
    pub metadata: MetadataIndexConfig,
    pub cache: CacheConfig,
    pub graph: GraphIndexConfig,
    pub blob_store: BlobStoreConfig,
    /// Fixed vector dimension for this database.
    pub dimension: usize,
}

impl StratumConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            vector: VectorIndexConfig::default(),
            metadata: MetadataIndexConfig::default(),
            cache: CacheConfig::default(),
            graph: GraphIndexConfig::default(),
            blob_store: BlobStoreConfig::default(),
            dimension,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StratumConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// A literal JSON template, mirroring `Config::init_config()` in the
    /// reference crate, for whatever bootstraps a fresh database directory.
    pub fn init_config_template(dimension: usize) -> String {
        format!(
            r#"{{
  "dimension": {dimension},
  "vector": {{ "m": 16, "ef_construction": 128, "ef_search": 128, "partition_by_type": true, "distance": "Cosine" }},
  "metadata": {{ "chunk_target_size": 50, "bloom_fp_rate": 0.01 }},
  "cache": {{ "capacity_bytes": 536870912 }},
  "graph": {{ "lsm_size_ratio": 10, "memtable_flush_threshold": 4096 }},
  "blob_store": {{ "backend": "LocalFs", "gzip": false, "zstd_threshold_bytes": 4096 }}
}}"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let cfg = StratumConfig::new(384);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StratumConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dimension, 384);
        assert_eq!(back.vector.m, 16);
    }

    #[test]
    fn init_template_parses() {
        let text = StratumConfig::init_config_template(384);
        let cfg: StratumConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg.dimension, 384);
    }
}
