//! In-memory backend for tests and throwaway stores

use async_trait::async_trait;
use std::sync::Mutex;

use super::{Backend, BackendKind};
use crate::error::StoreError;
use crate::record::{Patch, UserId, UserRecord};

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<UserRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records_mut<T>(
        &self,
        f: impl FnOnce(&mut Vec<UserRecord>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut records)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn load_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.with_records_mut(|records| Ok(records.clone()))
    }

    async fn create_record(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        self.with_records_mut(|records| {
            if records.iter().any(|r| r.user_id == record.user_id) {
                return Err(StoreError::DataAlreadyExists(record.user_id.0));
            }
            records.push(record.clone());
            Ok(record)
        })
    }

    async fn update_record(&self, id: UserId, patch: &Patch) -> Result<UserRecord, StoreError> {
        self.with_records_mut(|records| {
            let stored = records
                .iter_mut()
                .find(|r| r.user_id == id)
                .ok_or(StoreError::UserNotFound(id.0))?;
            *stored = stored.with_patch(patch)?;
            Ok(stored.clone())
        })
    }

    async fn delete_record(&self, id: UserId) -> Result<(), StoreError> {
        self.with_records_mut(|records| {
            records.retain(|r| r.user_id != id);
            Ok(())
        })
    }
}
