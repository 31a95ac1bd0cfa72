//! Flat-file backend - every record in one JSON array
//!
//! The file is rewritten in full on each mutation (2-space indentation,
//! trailing newline) through a temp file and a rename, so a crash mid-write
//! leaves the previous version in place. This backend stamps `createdAt` and
//! `updatedAt` itself.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Backend, BackendKind};
use crate::error::StoreError;
use crate::record::{Patch, UserId, UserRecord};

pub struct FlatFileBackend {
    path: PathBuf,
    /// Contents of the file as last written
    records: Mutex<Vec<UserRecord>>,
}

impl FlatFileBackend {
    /// Open the file, creating it with an empty array if missing
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let records = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            write_records(&path, &[]).await?;
            Vec::new()
        };

        info!(path = %path.display(), records = records.len(), "Opened users file");

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }
}

/// File contents for `records`
pub fn render(records: &[UserRecord]) -> Result<String, StoreError> {
    let mut content = serde_json::to_string_pretty(records)?;
    content.push('\n');
    Ok(content)
}

async fn write_records(path: &Path, records: &[UserRecord]) -> Result<(), StoreError> {
    let content = render(records)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait]
impl Backend for FlatFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::FlatFile
    }

    async fn load_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.records.lock().await.clone())
    }

    async fn create_record(&self, mut record: UserRecord) -> Result<UserRecord, StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.user_id == record.user_id) {
            return Err(StoreError::DataAlreadyExists(record.user_id.0));
        }

        let now = Utc::now().to_rfc3339();
        record.created_at = Some(now.clone());
        record.updated_at = Some(now);

        let mut next = records.clone();
        next.push(record.clone());
        write_records(&self.path, &next).await?;
        *records = next;

        debug!(user_id = %record.user_id, "Record appended to users file");
        Ok(record)
    }

    async fn update_record(&self, id: UserId, patch: &Patch) -> Result<UserRecord, StoreError> {
        let mut records = self.records.lock().await;
        let index = records
            .iter()
            .position(|r| r.user_id == id)
            .ok_or(StoreError::UserNotFound(id.0))?;

        let mut updated = records[index].with_patch(patch)?;
        updated.updated_at = Some(Utc::now().to_rfc3339());

        let mut next = records.clone();
        next[index] = updated.clone();
        write_records(&self.path, &next).await?;
        *records = next;

        debug!(user_id = %id, fields = patch.len(), "Record updated in users file");
        Ok(updated)
    }

    async fn delete_record(&self, id: UserId) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let Some(index) = records.iter().position(|r| r.user_id == id) else {
            return Ok(());
        };

        let mut next = records.clone();
        next.remove(index);
        write_records(&self.path, &next).await?;
        *records = next;

        debug!(user_id = %id, "Record removed from users file");
        Ok(())
    }
}
