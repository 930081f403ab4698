//! Zone map: `{min, max, count, hasNulls}` summary enabling range-query
//! chunk skipping.

use serde::{Deserialize, Serialize};

use crate::model::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZoneMap {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub count: u64,
    pub has_nulls: bool,
}

impl ZoneMap {
    pub fn empty() -> Self {
        Self {
            min: None,
            max: None,
            count: 0,
            has_nulls: false,
        }
    }

    pub fn observe(&mut self, value: &Value) {
        if value.is_null() {
            self.has_nulls = true;
            return;
        }
        self.count += 1;
        match &self.min {
            Some(min) if value.compare(min) != Some(std::cmp::Ordering::Less) => {}
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if value.compare(max) != Some(std::cmp::Ordering::Greater) => {}
            _ => self.max = Some(value.clone()),
        }
    }

    /// `true` if `[lo, hi]` cannot possibly overlap this zone, allowing
    /// the chunk to be skipped without loading its payload.
    pub fn disjoint_with(&self, lo: &Value, hi: &Value) -> bool {
        let (Some(min), Some(max)) = (&self.min, &self.max) else {
            return self.count == 0;
        };
        let below = max.compare(lo).map(|o| o == std::cmp::Ordering::Less).unwrap_or(false);
        let above = min.compare(hi).map(|o| o == std::cmp::Ordering::Greater).unwrap_or(false);
        below || above
    }
}
