//! Persistence backends
//!
//! Every backend speaks the same four operations. The store picks one at
//! construction time and never looks at which kind it got.
//!
//! | Kind | Medium | `update_record` |
//! |------|--------|-----------------|
//! | `document` | sled tree, MessagePack values | re-merges the patch onto the stored document |
//! | `relational` | SQLite table | touches only the patched columns |
//! | `flat-file` | one JSON array on disk | re-merges, stamps `updatedAt`, rewrites the file |
//! | `memory` | in-process vector | re-merges |

pub mod document;
pub mod flat_file;
pub mod memory;
pub mod relational;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::config::Config;
use crate::error::StoreError;
use crate::record::{Patch, UserId, UserRecord};

pub use document::DocumentBackend;
pub use flat_file::FlatFileBackend;
pub use memory::MemoryBackend;
pub use relational::RelationalBackend;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend kind, for logging
    fn kind(&self) -> BackendKind;

    /// Every stored record
    async fn load_all(&self) -> Result<Vec<UserRecord>, StoreError>;

    /// Persist a new record and return it as stored, without backend-private fields
    async fn create_record(&self, record: UserRecord) -> Result<UserRecord, StoreError>;

    /// Apply a patch of top-level fields and return the updated record
    async fn update_record(&self, id: UserId, patch: &Patch) -> Result<UserRecord, StoreError>;

    async fn delete_record(&self, id: UserId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Document,
    Relational,
    #[default]
    FlatFile,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Document => write!(f, "document"),
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::FlatFile => write!(f, "flat-file"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Open the backend named in `config` under its storage directory
pub async fn open_backend(config: &Config) -> Result<Box<dyn Backend>, StoreError> {
    if config.backend != BackendKind::Memory {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
    }

    let backend: Box<dyn Backend> = match config.backend {
        BackendKind::Document => Box::new(DocumentBackend::open(config.users_sled_path())?),
        BackendKind::Relational => {
            let backend = RelationalBackend::open(&config.users_db_path())?;
            backend.set_busy_timeout(config.backend_timeout())?;
            Box::new(backend)
        }
        BackendKind::FlatFile => Box::new(FlatFileBackend::open(config.users_json_path()).await?),
        BackendKind::Memory => Box::new(MemoryBackend::new()),
    };

    info!(backend = %backend.kind(), storage_dir = %config.storage_dir.display(), "Opened backend");
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_each_kind() {
        let temp_dir = TempDir::new().unwrap();
        for kind in [
            BackendKind::Document,
            BackendKind::Relational,
            BackendKind::FlatFile,
            BackendKind::Memory,
        ] {
            let config = Config {
                storage_dir: temp_dir.path().join(kind.to_string()),
                backend: kind,
                ..Default::default()
            };
            let backend = open_backend(&config).await.unwrap();
            assert_eq!(backend.kind(), kind);
            assert!(backend.load_all().await.unwrap().is_empty());
        }
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(serde_json::to_string(&BackendKind::FlatFile).unwrap(), "\"flat-file\"");
        let kind: BackendKind = serde_json::from_str("\"relational\"").unwrap();
        assert_eq!(kind, BackendKind::Relational);
    }
}
