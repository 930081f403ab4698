//! The Noun/Verb/Value data model, grounded on
//! `protocol::value::Value`: a flexible scalar/array
//! enum that round-trips through both JSON and a binary form.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StratumError};

/// A scalar or homogeneous-array metadata value.
///
/// Binary values are not permitted in metadata; anything that isn't
/// plain scalar or string/numeric array data should be stored as a blob
/// reference instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Millisecond epoch timestamp. Distinguished from `Integer` so the
    /// field registry can record it as temporal and the metadata index
    /// can apply bucketing.
    Temporal(i64),
    StringArray(Vec<String>),
    NumericArray(Vec<f64>),
    Null,
}

/// Bucket width for temporal normalization, in milliseconds.
pub const TEMPORAL_BUCKET_MS: i64 = 60_000;

impl Value {
    /// Canonical string form used as the postings-list key.
    pub fn normalize(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(format!("{f:.12}")),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Temporal(ms) => Some((ms / TEMPORAL_BUCKET_MS).to_string()),
            Value::Null => None,
            Value::StringArray(_) | Value::NumericArray(_) => None,
        }
    }

    /// Millisecond form of a temporal value, or an integer used as raw
    /// milliseconds. Used to compare a query bound against a bucket's
    /// span without needing a second `Temporal`-typed bound.
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Value::Temporal(ms) => Some(*ms),
            Value::Integer(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Array values expand to one postings entry per element; this
    /// returns those normalized entries, or a single-element slice for
    /// scalars.
    pub fn normalized_entries(&self) -> Vec<String> {
        match self {
            Value::StringArray(items) => items.clone(),
            Value::NumericArray(items) => items.iter().map(|v| format!("{v:.12}")).collect(),
            _ => self.normalize().into_iter().collect(),
        }
    }

    pub fn type_tag(&self) -> FieldType {
        match self {
            Value::String(_) => FieldType::String,
            Value::Integer(_) => FieldType::Integer,
            Value::Float(_) => FieldType::Float,
            Value::Boolean(_) => FieldType::Boolean,
            Value::Temporal(_) => FieldType::Temporal,
            Value::StringArray(_) => FieldType::StringArray,
            Value::NumericArray(_) => FieldType::NumericArray,
            Value::Null => FieldType::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Orders two normalized range-comparable values; used by zone maps
    /// and sorted indices. Non-comparable combinations return `None`.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Temporal(a), Value::Temporal(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Temporal,
    StringArray,
    NumericArray,
    Null,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Temporal => "temporal",
            FieldType::StringArray => "string_array",
            FieldType::NumericArray => "numeric_array",
            FieldType::Null => "null",
        };
        write!(f, "{s}")
    }
}

/// A dense embedding vector, stored as `f32` components at a fixed
/// dimension shared by every noun and verb in a database.
pub type Vector = Vec<f32>;

pub type Metadata = HashMap<String, Value>;

/// Fields never indexed by the Metadata Index.
pub const EXCLUDED_FIELDS: &[&str] = &[
    "id",
    "uuid",
    "vector",
    "embedding",
    "content",
    "description",
    "metadata",
    "data",
];

pub fn is_excluded_field(name: &str) -> bool {
    EXCLUDED_FIELDS.contains(&name)
}

/// Field names that trigger temporal bucketing.
pub const TEMPORAL_FIELD_MARKERS: &[&str] =
    &["time", "date", "created", "updated", "modified", "accessed"];

pub fn looks_temporal(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    TEMPORAL_FIELD_MARKERS.iter().any(|m| lower.contains(m))
}

/// An entity: vector embedding plus structured metadata, identified by a
/// 128-bit UUID.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Noun {
    pub id: Uuid,
    pub noun_type: String,
    pub vector: Vector,
    pub metadata: Metadata,
}

/// A typed relationship between two entities, carrying its own vector
/// and metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verb {
    pub id: Uuid,
    pub verb_type: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub weight: f32,
    pub vector: Vector,
    pub metadata: Metadata,
}

impl Verb {
    pub fn validate_weight(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(StratumError::InvalidInput(format!(
                "verb weight {} outside [0,1]",
                self.weight
            )));
        }
        Ok(())
    }
}

/// Lowercase hex shard prefix derived from a UUID's first byte, giving
/// one of 256 possible shards.
pub fn shard_of(id: &Uuid) -> String {
    format!("{:02x}", id.as_bytes()[0])
}

pub fn validate_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(StratumError::InvalidInput(format!(
            "vector dimension mismatch: expected {expected}, got {}",
            vector.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_two_hex_digits_of_first_octet() {
        let id = Uuid::from_bytes([0xab; 16]);
        assert_eq!(shard_of(&id), "ab");
    }

    #[test]
    fn temporal_normalize_buckets_to_one_minute() {
        let t = 1_700_000_123_456i64;
        let v = Value::Temporal(t);
        let v2 = Value::Temporal(t + 500);
        assert_eq!(v.normalize(), v2.normalize());
    }

    #[test]
    fn looks_temporal_matches_markers() {
        assert!(looks_temporal("createdAt"));
        assert!(looks_temporal("last_modified"));
        assert!(!looks_temporal("status"));
    }

    #[test]
    fn excluded_fields_are_never_indexed() {
        assert!(is_excluded_field("vector"));
        assert!(!is_excluded_field("status"));
    }
}
