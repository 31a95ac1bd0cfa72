//! Document backend - user records in a sled tree
//!
//! One document per identity, MessagePack-encoded. Keys are the identity with
//! the sign bit flipped, big-endian, so iteration yields identities in
//! numeric order.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use super::{Backend, BackendKind};
use crate::error::StoreError;
use crate::record::{Patch, UserId, UserRecord};

pub struct DocumentBackend {
    db: sled::Db,
    users: sled::Tree,
}

impl DocumentBackend {
    /// Open or create the document database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let users = db.open_tree("users")?;
        info!(path = %path.as_ref().display(), records = users.len(), "Opened document database");
        Ok(Self { db, users })
    }

    /// Throwaway database removed on drop (for testing)
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        let users = db.open_tree("users")?;
        Ok(Self { db, users })
    }

    fn key(id: UserId) -> [u8; 8] {
        ((id.0 as u64) ^ (1 << 63)).to_be_bytes()
    }

    fn encode(record: &UserRecord) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec_named(record)?)
    }

    fn decode(bytes: &[u8]) -> Result<UserRecord, StoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn load_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        let mut records = Vec::with_capacity(self.users.len());
        for item in self.users.iter() {
            let (_, value) = item?;
            records.push(Self::decode(&value)?);
        }
        Ok(records)
    }

    async fn create_record(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        let bytes = Self::encode(&record)?;
        let swapped = self
            .users
            .compare_and_swap(Self::key(record.user_id), None::<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(StoreError::DataAlreadyExists(record.user_id.0));
        }
        self.flush().await?;
        debug!(user_id = %record.user_id, "Document created");
        Ok(record)
    }

    async fn update_record(&self, id: UserId, patch: &Patch) -> Result<UserRecord, StoreError> {
        let key = Self::key(id);
        let stored = match self.users.get(key)? {
            Some(bytes) => Self::decode(&bytes)?,
            None => return Err(StoreError::UserNotFound(id.0)),
        };
        let updated = stored.with_patch(patch)?;
        self.users.insert(key, Self::encode(&updated)?)?;
        self.flush().await?;
        debug!(user_id = %id, fields = patch.len(), "Document updated");
        Ok(updated)
    }

    async fn delete_record(&self, id: UserId) -> Result<(), StoreError> {
        if self.users.remove(Self::key(id))?.is_some() {
            self.flush().await?;
            debug!(user_id = %id, "Document deleted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ProfileInfo, DEFAULT_NAME};
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: i64) -> UserRecord {
        UserRecord::new(UserId(id), &ProfileInfo::named("Ada"), DEFAULT_NAME)
    }

    #[tokio::test]
    async fn test_document_crud() {
        let backend = DocumentBackend::temporary().unwrap();

        backend.create_record(record(5)).await.unwrap();
        assert!(matches!(
            backend.create_record(record(5)).await,
            Err(StoreError::DataAlreadyExists(5))
        ));

        let mut patch = Patch::new();
        patch.insert("settings".into(), json!({"theme": "dark"}));
        let updated = backend.update_record(UserId(5), &patch).await.unwrap();
        assert_eq!(updated.settings["theme"], json!("dark"));
        assert_eq!(updated.name, "Ada");

        assert!(matches!(
            backend.update_record(UserId(6), &patch).await,
            Err(StoreError::UserNotFound(6))
        ));

        backend.delete_record(UserId(5)).await.unwrap();
        assert!(backend.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_all_in_identity_order_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("users.sled");
        {
            let backend = DocumentBackend::open(&path).unwrap();
            for id in [30, -4, 7] {
                backend.create_record(record(id)).await.unwrap();
            }
        }

        let backend = DocumentBackend::open(&path).unwrap();
        let ids: Vec<i64> = backend
            .load_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.user_id.0)
            .collect();
        assert_eq!(ids, vec![-4, 7, 30]);
    }
}
