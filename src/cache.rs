//! Write-through record cache
//!
//! Mirrors the backend in insertion order. Loaded once from
//! `Backend::load_all`; afterwards it is only changed with records the
//! backend has already accepted.

use indexmap::IndexMap;
use tracing::warn;

use crate::record::{UserId, UserRecord};

#[derive(Debug, Default, Clone)]
pub struct RecordCache {
    records: IndexMap<UserId, UserRecord>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a backend snapshot; a repeated identity keeps its first record
    pub fn from_records(records: Vec<UserRecord>) -> Self {
        let mut cache = Self::new();
        for record in records {
            if cache.contains(record.user_id) {
                warn!(user_id = %record.user_id, "Duplicate record in backend, keeping the first");
                continue;
            }
            cache.records.insert(record.user_id, record);
        }
        cache
    }

    pub fn get(&self, id: UserId) -> Option<&UserRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.records.contains_key(&id)
    }

    /// Insert a new record or replace an existing one in place
    pub fn put(&mut self, record: UserRecord) {
        self.records.insert(record.user_id, record);
    }

    /// Remove a record, keeping the order of the rest
    pub fn remove(&mut self, id: UserId) -> Option<UserRecord> {
        self.records.shift_remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserRecord> {
        self.records.values()
    }

    /// Deep copy of every record in order
    pub fn snapshot(&self) -> Vec<UserRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
