//! Field-Registry: a small persistent object listing
//! every known field name and its inferred type, discovered at startup
//! in O(1). Sparse indices are lazy-loaded on first query touching that
//! field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, StratumError};
use crate::model::{FieldType, Value, is_excluded_field, looks_temporal};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldRegistry {
    fields: HashMap<String, FieldType>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<FieldEntry> {
        self.fields
            .iter()
            .map(|(name, field_type)| FieldEntry {
                name: name.clone(),
                field_type: *field_type,
            })
            .collect()
    }

    pub fn type_of(&self, field: &str) -> Option<FieldType> {
        self.fields.get(field).copied()
    }

    /// Infers and records `field`'s type from `value`. A field seen with
    /// an incompatible type on a later write is an `InvalidInput` error.
    pub fn observe(&mut self, field: &str, value: &Value) -> Result<()> {
        if is_excluded_field(field) || value.is_null() {
            return Ok(());
        }
        let inferred = if looks_temporal(field) {
            FieldType::Temporal
        } else {
            value.type_tag()
        };
        match self.fields.get(field) {
            None => {
                self.fields.insert(field.to_string(), inferred);
                Ok(())
            }
            Some(existing) if *existing == inferred => Ok(()),
            // Temporal is a refinement of Integer for marker-matched
            // field names; don't treat that as a conflict.
            Some(FieldType::Integer) if inferred == FieldType::Temporal => {
                self.fields.insert(field.to_string(), FieldType::Temporal);
                Ok(())
            }
            Some(FieldType::Temporal) if inferred == FieldType::Integer => Ok(()),
            Some(existing) => Err(StratumError::InvalidInput(format!(
                "field '{field}' previously typed {existing}, got {inferred}"
            ))),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<FieldEntry> = serde_json::from_slice(bytes)?;
        let fields = entries.into_iter().map(|e| (e.name, e.field_type)).collect();
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_new_field_type() {
        let mut reg = FieldRegistry::new();
        reg.observe("status", &Value::String("active".into())).unwrap();
        assert_eq!(reg.type_of("status"), Some(FieldType::String));
    }

    #[test]
    fn temporal_marker_overrides_integer_inference() {
        let mut reg = FieldRegistry::new();
        reg.observe("createdAt", &Value::Temporal(123)).unwrap();
        assert_eq!(reg.type_of("createdAt"), Some(FieldType::Temporal));
    }

    #[test]
    fn conflicting_types_are_invalid_input() {
        let mut reg = FieldRegistry::new();
        reg.observe("age", &Value::Integer(5)).unwrap();
        let err = reg.observe("age", &Value::String("five".into())).unwrap_err();
        assert!(matches!(err, StratumError::InvalidInput(_)));
    }

    #[test]
    fn excluded_fields_are_never_recorded() {
        let mut reg = FieldRegistry::new();
        reg.observe("vector", &Value::NumericArray(vec![1.0])).unwrap();
        assert_eq!(reg.type_of("vector"), None);
    }
}
