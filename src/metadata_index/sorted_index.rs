//! Sorted index maintained per field for `orderBy` support: a sorted list of `(value, bitmap)` pairs,
//! updated by O(log n) binary-search insertion.

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::model::Value;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SortedIndex {
    entries: Vec<(Value, RoaringBitmap)>,
}

impl SortedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn position_of(&self, value: &Value) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(v, _)| v.compare(value).unwrap_or(std::cmp::Ordering::Less))
    }

    pub fn insert(&mut self, value: Value, id: u32) {
        match self.position_of(&value) {
            Ok(idx) => {
                self.entries[idx].1.insert(id);
            }
            Err(idx) => {
                let mut bitmap = RoaringBitmap::new();
                bitmap.insert(id);
                self.entries.insert(idx, (value, bitmap));
            }
        }
    }

    pub fn remove(&mut self, value: &Value, id: u32) {
        if let Ok(idx) = self.position_of(value) {
            self.entries[idx].1.remove(id);
            if self.entries[idx].1.is_empty() {
                self.entries.remove(idx);
            }
        }
    }

    /// Ids in ascending value order, flattened; `descending` reverses.
    pub fn ordered_ids(&self, descending: bool) -> Vec<u32> {
        let iter: Box<dyn Iterator<Item = &(Value, RoaringBitmap)>> = if descending {
            Box::new(self.entries.iter().rev())
        } else {
            Box::new(self.entries.iter())
        };
        iter.flat_map(|(_, bitmap)| bitmap.iter()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_ids_by_value() {
        let mut idx = SortedIndex::new();
        idx.insert(Value::Integer(30), 1);
        idx.insert(Value::Integer(10), 2);
        idx.insert(Value::Integer(20), 3);
        assert_eq!(idx.ordered_ids(false), vec![2, 3, 1]);
        assert_eq!(idx.ordered_ids(true), vec![1, 3, 2]);
    }

    #[test]
    fn remove_drops_empty_value_entry() {
        let mut idx = SortedIndex::new();
        idx.insert(Value::Integer(1), 42);
        idx.remove(&Value::Integer(1), 42);
        assert!(idx.is_empty());
    }
}
