//! Relational backend - user records in SQLite
//!
//! ## Table
//!
//! - `users` - one row per identity; `banned`, `settings` and `data` are JSON
//!   text. The autoincrement `id` keeps insertion order and never leaves
//!   this module.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, Row, ToSql};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::{Backend, BackendKind};
use crate::error::StoreError;
use crate::record::{Patch, UserId, UserRecord};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    gender TEXT NOT NULL DEFAULT 'unknown',
    vanity TEXT NOT NULL DEFAULT 'unknown',
    exp INTEGER NOT NULL DEFAULT 0,
    money INTEGER NOT NULL DEFAULT 0,
    banned TEXT NOT NULL DEFAULT '{}',
    settings TEXT NOT NULL DEFAULT '{}',
    data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const SELECT_COLUMNS: &str =
    "user_id, name, gender, vanity, exp, money, banned, settings, data, created_at, updated_at";

pub struct RelationalBackend {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalBackend {
    /// Open or create the users database
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_schema(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// How long a statement waits on another connection's lock before failing
    pub fn set_busy_timeout(&self, limit: Duration) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        conn.busy_timeout(limit)?;
        Ok(())
    }

    /// Run `f` on the blocking pool so a stalled statement never blocks the runtime
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Internal(format!("SQLite task failed: {}", e)))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .ok();

    conn.execute_batch(USERS_SCHEMA)?;

    if version.is_none() {
        info!("Creating users schema v{}", SCHEMA_VERSION);
        conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
    }
    Ok(())
}

fn json_column(row: &Row, column: &str) -> Result<Map<String, Value>, rusqlite::Error> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn from_row(row: &Row) -> Result<UserRecord, rusqlite::Error> {
    let exp: i64 = row.get("exp")?;
    Ok(UserRecord {
        user_id: UserId(row.get("user_id")?),
        name: row.get("name")?,
        gender: row.get("gender")?,
        vanity: row.get("vanity")?,
        exp: u64::try_from(exp).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        money: row.get("money")?,
        banned: json_column(row, "banned")?,
        settings: json_column(row, "settings")?,
        data: json_column(row, "data")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn get_user(conn: &Connection, id: UserId) -> Result<Option<UserRecord>, StoreError> {
    let sql = format!("SELECT {} FROM users WHERE user_id = ?", SELECT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.0])?;
    match rows.next()? {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

fn exp_param(exp: u64) -> Result<i64, StoreError> {
    i64::try_from(exp).map_err(|_| StoreError::InvalidData(format!("exp {} out of range", exp)))
}

/// Typed column value for one patched field
fn column_value(record: &UserRecord, key: &str) -> Result<Box<dyn ToSql>, StoreError> {
    let value: Box<dyn ToSql> = match key {
        "name" => Box::new(record.name.clone()),
        "gender" => Box::new(record.gender.clone()),
        "vanity" => Box::new(record.vanity.clone()),
        "exp" => Box::new(exp_param(record.exp)?),
        "money" => Box::new(record.money),
        "banned" => Box::new(serde_json::to_string(&record.banned)?),
        "settings" => Box::new(serde_json::to_string(&record.settings)?),
        "data" => Box::new(serde_json::to_string(&record.data)?),
        other => {
            return Err(StoreError::InvalidPath(format!("{} is not a users column", other)));
        }
    };
    Ok(value)
}

#[async_trait]
impl Backend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn load_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY id", SELECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([], |row| from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn create_record(&self, record: UserRecord) -> Result<UserRecord, StoreError> {
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                r#"
                INSERT INTO users (
                    user_id, name, gender, vanity, exp, money,
                    banned, settings, data, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    record.user_id.0,
                    record.name,
                    record.gender,
                    record.vanity,
                    exp_param(record.exp)?,
                    record.money,
                    serde_json::to_string(&record.banned)?,
                    serde_json::to_string(&record.settings)?,
                    serde_json::to_string(&record.data)?,
                    record.created_at.clone().unwrap_or_else(|| now.clone()),
                    record.updated_at.clone().unwrap_or(now),
                ],
            );
            match inserted {
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    return Err(StoreError::DataAlreadyExists(record.user_id.0));
                }
                other => {
                    other?;
                }
            }
            debug!(user_id = %record.user_id, "Row inserted");

            get_user(conn, record.user_id)?
                .ok_or_else(|| StoreError::Internal("User not found after insert".to_string()))
        })
        .await
    }

    async fn update_record(&self, id: UserId, patch: &Patch) -> Result<UserRecord, StoreError> {
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let current = get_user(conn, id)?.ok_or(StoreError::UserNotFound(id.0))?;
            let patched = current.with_patch(&patch)?;

            let mut assignments = Vec::with_capacity(patch.len() + 1);
            let mut values: Vec<Box<dyn ToSql>> = Vec::with_capacity(patch.len() + 2);
            for key in patch.keys() {
                assignments.push(format!("{} = ?", key));
                values.push(column_value(&patched, key)?);
            }
            assignments.push("updated_at = ?".to_string());
            values.push(Box::new(Utc::now().to_rfc3339()));
            values.push(Box::new(id.0));

            let sql = format!("UPDATE users SET {} WHERE user_id = ?", assignments.join(", "));
            let param_refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            conn.execute(&sql, param_refs.as_slice())?;
            debug!(user_id = %id, fields = patch.len(), "Row updated");

            get_user(conn, id)?.ok_or(StoreError::UserNotFound(id.0))
        })
        .await
    }

    async fn delete_record(&self, id: UserId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changes = conn.execute("DELETE FROM users WHERE user_id = ?", params![id.0])?;
            debug!(user_id = %id, changes, "Row deleted");
            Ok(())
        })
        .await
    }
}
