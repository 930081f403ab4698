//! The multi-index storage and query core: coupled HNSW vector index,
//! chunked sparse metadata index, LSM-backed graph adjacency, and a
//! content-addressed copy-on-write object store, wired together behind
//! one `Database` façade.
//!
//! Layout follows `helix_engine`'s `graph_core`/`storage_core`/`vector_core`
//! split, each with its own `mod.rs`, generalized here to one module per
//! component rather than per storage engine.

pub mod blob_store;
pub mod cache;
pub mod config;
pub mod cow;
pub mod db;
pub mod error;
pub mod graph_index;
pub mod metadata_index;
pub mod model;
pub mod query;
pub mod vector_index;

pub use config::StratumConfig;
pub use db::{AsOfHandle, Database, Page, Statistics};
pub use error::{Result, StratumError};
pub use model::{FieldType, Metadata, Noun, Value, Vector, Verb};
pub use query::{ConnectedQuery, Query, Strategy};
