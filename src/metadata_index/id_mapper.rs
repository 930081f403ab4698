//! Entity-ID Mapper: a bijective UUID↔u32
//! table, prerequisite for roaring-bitmap postings. Ids are assigned
//! monotonically and never reissued; retired ids are tombstoned rather
//! than freed, preserving bitmap semantics across branches until an
//! explicit compaction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EntityIdMapper {
    uuid_to_int: HashMap<Uuid, u32>,
    int_to_uuid: HashMap<u32, Uuid>,
    tombstones: std::collections::HashSet<u32>,
    next_id: u32,
}

impl EntityIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_assign(&mut self, id: Uuid) -> u32 {
        if let Some(&existing) = self.uuid_to_int.get(&id) {
            return existing;
        }
        let assigned = self.next_id;
        self.next_id += 1;
        self.uuid_to_int.insert(id, assigned);
        self.int_to_uuid.insert(assigned, id);
        assigned
    }

    pub fn int_of(&self, id: &Uuid) -> Option<u32> {
        self.uuid_to_int.get(id).copied()
    }

    pub fn uuid_of(&self, int_id: u32) -> Option<Uuid> {
        self.int_to_uuid.get(&int_id).copied()
    }

    /// Retires an id: the mapping is dropped but `int_id` is never
    /// reissued by `get_or_assign`.
    pub fn retire(&mut self, id: &Uuid) {
        if let Some(int_id) = self.uuid_to_int.remove(id) {
            self.int_to_uuid.remove(&int_id);
            self.tombstones.insert(int_id);
        }
    }

    pub fn is_tombstoned(&self, int_id: u32) -> bool {
        self.tombstones.contains(&int_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
