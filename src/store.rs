//! Record store facade
//!
//! `UserStore` is a cheap, cloneable handle. Every operation that reads or
//! writes records becomes a task on the serial mutation queue; the worker
//! behind the queue exclusively owns the `StoreState` (cache, backend and
//! collaborators), so tasks never race each other.
//!
//! ## Reads on unknown identities
//!
//! `get`, `select` and `get_money` create a default record first and answer
//! from it. Writes do the same, but report `UserNotFound` if that implicit
//! creation fails.

use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{open_backend, Backend, BackendKind};
use crate::cache::RecordCache;
use crate::config::Config;
use crate::error::StoreError;
use crate::merge::{delete_patch, merge, Change};
use crate::path::FieldPath;
use crate::profile::{avatar_or_default, fetch_or_default, ProfileProvider};
use crate::projection::{Projection, Query, QueryProjector};
use crate::queue::SerialQueue;
use crate::record::{Patch, ProfileInfo, UserId, UserRecord, DEFAULT_NAME};
use crate::single_flight::SingleFlight;

/// Runtime knobs taken from `Config`
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub backend_timeout: Duration,
    pub profile_timeout: Duration,
    pub default_name: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(30),
            profile_timeout: Duration::from_secs(10),
            default_name: DEFAULT_NAME.to_string(),
        }
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            backend_timeout: config.backend_timeout(),
            profile_timeout: config.profile_timeout(),
            default_name: config.default_name.clone(),
        }
    }
}

/// Await a backend call, failing with `Timeout` past `limit`
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(format!("{} exceeded {:?}", what, limit))),
    }
}

/// State owned by the queue worker
pub struct StoreState {
    cache: RecordCache,
    backend: Box<dyn Backend>,
    profile: Arc<dyn ProfileProvider>,
    options: StoreOptions,
}

impl StoreState {
    fn new(
        cache: RecordCache,
        backend: Box<dyn Backend>,
        profile: Arc<dyn ProfileProvider>,
        options: StoreOptions,
    ) -> Self {
        Self {
            cache,
            backend,
            profile,
            options,
        }
    }

    async fn profile_or_fetch(&self, id: UserId, info: Option<ProfileInfo>) -> ProfileInfo {
        match info {
            Some(info) => info,
            None => fetch_or_default(self.profile.as_ref(), id, self.options.profile_timeout).await,
        }
    }

    /// Persist a fresh record for `id`, then cache it
    async fn create_record(
        &mut self,
        id: UserId,
        seed: Option<ProfileInfo>,
    ) -> Result<UserRecord, StoreError> {
        if self.cache.contains(id) {
            return Err(StoreError::DataAlreadyExists(id.0));
        }

        let info = self.profile_or_fetch(id, seed).await;
        let record = UserRecord::new(id, &info, &self.options.default_name);
        let stored = bounded(
            self.options.backend_timeout,
            "create_record",
            self.backend.create_record(record),
        )
        .await?;

        self.cache.put(stored.clone());
        info!(user_id = %id, name = %stored.name, "User record created");
        Ok(stored)
    }

    async fn get_or_create(&mut self, id: UserId) -> Result<UserRecord, StoreError> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record.clone());
        }
        debug!(user_id = %id, "Unknown user on read, creating");
        self.create_record(id, None).await
    }

    /// Existing record for an update; a failed implicit creation is `UserNotFound`
    async fn existing_for_update(&mut self, id: UserId) -> Result<UserRecord, StoreError> {
        self.get_or_create(id).await.map_err(|e| {
            warn!(user_id = %id, error = %e, "Implicit creation before update failed");
            StoreError::UserNotFound(id.0)
        })
    }

    /// Check `patch` against a copy, hand it to the backend, then cache the result
    async fn apply_patch(
        &mut self,
        existing: UserRecord,
        patch: Patch,
    ) -> Result<UserRecord, StoreError> {
        if patch.is_empty() {
            return Ok(existing);
        }
        existing.with_patch(&patch)?;

        let id = existing.user_id;
        let stored = bounded(
            self.options.backend_timeout,
            "update_record",
            self.backend.update_record(id, &patch),
        )
        .await?;

        self.cache.put(stored.clone());
        debug!(user_id = %id, fields = patch.len(), "User record updated");
        Ok(stored)
    }

    async fn update(&mut self, id: UserId, change: Change) -> Result<UserRecord, StoreError> {
        let existing = self.existing_for_update(id).await?;
        let patch = merge(&existing, &change)?;
        self.apply_patch(existing, patch).await
    }

    async fn delete_key(&mut self, id: UserId, path: FieldPath) -> Result<bool, StoreError> {
        let existing = self.existing_for_update(id).await?;
        let (patch, removed) = delete_patch(&existing, &path, &self.options.default_name)?;
        self.apply_patch(existing, patch).await?;
        Ok(removed)
    }

    async fn adjust_money(&mut self, id: UserId, delta: i64) -> Result<i64, StoreError> {
        let existing = self.existing_for_update(id).await?;
        let balance = existing.money.checked_add(delta).ok_or_else(|| {
            StoreError::InvalidMoney(format!(
                "balance {} of user {} cannot change by {}",
                existing.money, id, delta
            ))
        })?;

        let mut patch = Patch::new();
        patch.insert("money".into(), Value::from(balance));
        let stored = self.apply_patch(existing, patch).await?;
        Ok(stored.money)
    }

    async fn refresh_info(
        &mut self,
        id: UserId,
        info: Option<ProfileInfo>,
    ) -> Result<UserRecord, StoreError> {
        let existing = self.existing_for_update(id).await?;
        let info = self.profile_or_fetch(id, info).await;
        let fresh = UserRecord::new(id, &info, &self.options.default_name);

        let mut patch = Patch::new();
        patch.insert("name".into(), Value::from(fresh.name));
        patch.insert("gender".into(), Value::from(fresh.gender));
        patch.insert("vanity".into(), Value::from(fresh.vanity));
        self.apply_patch(existing, patch).await
    }

    /// Delete from the backend first; the cache follows only on success
    async fn remove(&mut self, id: UserId) -> Result<bool, StoreError> {
        let existed = self.cache.contains(id);
        bounded(
            self.options.backend_timeout,
            "delete_record",
            self.backend.delete_record(id),
        )
        .await?;
        self.cache.remove(id);

        if existed {
            info!(user_id = %id, "User record removed");
        }
        Ok(existed)
    }
}

/// Handle to a user record store
#[derive(Clone)]
pub struct UserStore {
    queue: SerialQueue<StoreState>,
    creating: SingleFlight<UserId, UserRecord, StoreError>,
    profile: Arc<dyn ProfileProvider>,
    projector: Arc<dyn QueryProjector>,
    options: StoreOptions,
    backend_kind: BackendKind,
}

impl UserStore {
    /// Load every record from `backend` and start the worker
    pub async fn open(
        backend: Box<dyn Backend>,
        profile: Arc<dyn ProfileProvider>,
        projector: Arc<dyn QueryProjector>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let backend_kind = backend.kind();
        let records = bounded(options.backend_timeout, "load_all", backend.load_all()).await?;
        let cache = RecordCache::from_records(records);
        info!(backend = %backend_kind, records = cache.len(), "Loaded user records");

        let state = StoreState::new(cache, backend, Arc::clone(&profile), options.clone());
        let (queue, _worker) = SerialQueue::spawn(state);

        Ok(Self {
            queue,
            creating: SingleFlight::new(),
            profile,
            projector,
            options,
            backend_kind,
        })
    }

    /// Open the configured backend and start the store on top of it
    pub async fn from_config(
        config: &Config,
        profile: Arc<dyn ProfileProvider>,
        projector: Arc<dyn QueryProjector>,
    ) -> Result<Self, StoreError> {
        let backend = open_backend(config).await?;
        Self::open(backend, profile, projector, StoreOptions::from(config)).await
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Create a record for `id`
    ///
    /// Concurrent calls for one identity share a single creation; all of them
    /// see the same record or the same error.
    pub async fn create(
        &self,
        id: UserId,
        seed: Option<ProfileInfo>,
    ) -> Result<UserRecord, StoreError> {
        let queue = self.queue.clone();
        self.creating
            .run(id, move || {
                async move {
                    queue
                        .submit(move |state: &mut StoreState| {
                            async move { state.create_record(id, seed).await }.boxed()
                        })
                        .await
                }
                .boxed()
            })
            .await
    }

    /// Re-fetch (or take) profile fields and store them on the record
    pub async fn refresh_info(
        &self,
        id: UserId,
        info: Option<ProfileInfo>,
    ) -> Result<UserRecord, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| {
                async move { state.refresh_info(id, info).await }.boxed()
            })
            .await
    }

    pub async fn get(&self, id: UserId) -> Result<UserRecord, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| async move { state.get_or_create(id).await }.boxed())
            .await
    }

    /// Read one record through `projection`
    pub async fn select(&self, id: UserId, projection: &Projection) -> Result<Value, StoreError> {
        let record = self.get(id).await?;
        projection.apply(self.projector.as_ref(), record.to_value())
    }

    /// Deep copy of every record, in cache order
    pub async fn get_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.queue
            .submit(|state: &mut StoreState| async move { Ok(state.cache.snapshot()) }.boxed())
            .await
    }

    pub async fn select_all(&self, projection: &Projection) -> Result<Vec<Value>, StoreError> {
        self.get_all()
            .await?
            .into_iter()
            .map(|record| projection.apply(self.projector.as_ref(), record.to_value()))
            .collect()
    }

    pub async fn set(&self, id: UserId, change: Change) -> Result<UserRecord, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| async move { state.update(id, change).await }.boxed())
            .await
    }

    /// Remove the value at `path`; `false` when there was nothing there
    pub async fn delete_key(&self, id: UserId, path: FieldPath) -> Result<bool, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| {
                async move { state.delete_key(id, path).await }.boxed()
            })
            .await
    }

    pub async fn get_money(&self, id: UserId) -> Result<i64, StoreError> {
        Ok(self.get(id).await?.money)
    }

    /// Add to the balance and return the new one
    pub async fn add_money(&self, id: UserId, amount: i64) -> Result<i64, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| {
                async move { state.adjust_money(id, amount).await }.boxed()
            })
            .await
    }

    /// Subtract from the balance; it may go negative
    pub async fn subtract_money(&self, id: UserId, amount: i64) -> Result<i64, StoreError> {
        let delta = amount.checked_neg().ok_or_else(|| {
            StoreError::InvalidMoney(format!("cannot subtract {}", amount))
        })?;
        self.add_money(id, delta).await
    }

    /// Delete the record; `false` when it did not exist
    pub async fn remove(&self, id: UserId) -> Result<bool, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| async move { state.remove(id).await }.boxed())
            .await
    }

    pub async fn exists(&self, id: UserId) -> Result<bool, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| async move { Ok(state.cache.contains(id)) }.boxed())
            .await
    }

    /// Stored name, else the provider's, else the configured default
    pub async fn get_name(&self, id: UserId) -> Result<String, StoreError> {
        if let Some(name) = self.get_name_in_db(id).await? {
            return Ok(name);
        }

        let info = fetch_or_default(self.profile.as_ref(), id, self.options.profile_timeout).await;
        Ok(info
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.options.default_name.clone()))
    }

    /// Name from the stored record; `None` for an unknown identity
    pub async fn get_name_in_db(&self, id: UserId) -> Result<Option<String>, StoreError> {
        self.queue
            .submit(move |state: &mut StoreState| {
                async move { Ok(state.cache.get(id).map(|r| r.name.clone())) }.boxed()
            })
            .await
    }

    pub async fn get_avatar_url(&self, id: UserId) -> String {
        avatar_or_default(self.profile.as_ref(), id, self.options.profile_timeout).await
    }

    /// Run the query projector on an arbitrary value
    pub fn project(&self, value: &Value, query: &Query) -> Result<Value, StoreError> {
        self.projector.project(query, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::profile::{NoProfileProvider, DEFAULT_AVATAR_URL};
    use crate::projection::SelectionProjector;
    use serde_json::json;

    async fn store() -> UserStore {
        UserStore::open(
            Box::new(MemoryBackend::new()),
            Arc::new(NoProfileProvider),
            Arc::new(SelectionProjector),
            StoreOptions::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_creates_default_record() {
        let store = store().await;
        assert!(!store.exists(UserId(42)).await.unwrap());

        let record = store.get(UserId(42)).await.unwrap();
        assert_eq!(record.money, 0);
        assert_eq!(record.exp, 0);
        assert_eq!(record.name, "User");
        assert_eq!(record.gender, "unknown");
        assert!(store.exists(UserId(42)).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = store().await;
        let created = store
            .create(UserId(5), Some(ProfileInfo::named("Ada")))
            .await
            .unwrap();
        assert_eq!(created.name, "Ada");
        assert_eq!(
            store.create(UserId(5), None).await,
            Err(StoreError::DataAlreadyExists(5))
        );
    }

    #[tokio::test]
    async fn test_money_can_go_negative() {
        let store = store().await;
        assert_eq!(store.add_money(UserId(1), 100).await.unwrap(), 100);
        assert_eq!(store.subtract_money(UserId(1), 30).await.unwrap(), 70);
        assert_eq!(store.subtract_money(UserId(1), 100).await.unwrap(), -30);
        assert_eq!(store.get_money(UserId(1)).await.unwrap(), -30);

        store.add_money(UserId(1), i64::MAX).await.unwrap();
        assert!(matches!(
            store.add_money(UserId(1), i64::MAX).await,
            Err(StoreError::InvalidMoney(_))
        ));
        assert!(matches!(
            store.subtract_money(UserId(1), i64::MIN).await,
            Err(StoreError::InvalidMoney(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_key_nested_and_top_level() {
        let store = store().await;
        store
            .set(UserId(2), Change::path("settings.theme", json!("dark")).unwrap())
            .await
            .unwrap();
        store
            .set(UserId(2), Change::path("name", json!("Grace")).unwrap())
            .await
            .unwrap();

        let theme = FieldPath::parse("settings.theme").unwrap();
        assert!(store.delete_key(UserId(2), theme.clone()).await.unwrap());
        assert!(!store.delete_key(UserId(2), theme).await.unwrap());

        assert!(store
            .delete_key(UserId(2), FieldPath::parse("name").unwrap())
            .await
            .unwrap());
        let record = store.get(UserId(2)).await.unwrap();
        assert!(record.settings.is_empty());
        assert_eq!(record.name, "User");
    }

    #[tokio::test]
    async fn test_type_mismatch_changes_nothing() {
        let store = store().await;
        store.add_money(UserId(3), 10).await.unwrap();
        assert!(matches!(
            store.set(UserId(3), Change::path("money", json!("abc")).unwrap()).await,
            Err(StoreError::InvalidData(_))
        ));
        assert!(matches!(
            store.set(UserId(3), Change::path("userID", json!(4)).unwrap()).await,
            Err(StoreError::InvalidPath(_))
        ));
        assert_eq!(store.get_money(UserId(3)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_far_array_index_is_rejected() {
        let store = store().await;
        store
            .set(UserId(1), Change::path("data.list.0", json!("a")).unwrap())
            .await
            .unwrap();

        for path in ["data.list.1000000000000", "data.list.18446744073709551615"] {
            assert!(matches!(
                store.set(UserId(1), Change::path(path, json!(1)).unwrap()).await,
                Err(StoreError::InvalidPath(_))
            ));
        }

        let record = store
            .set(UserId(1), Change::path("data.list.1", json!("b")).unwrap())
            .await
            .unwrap();
        assert_eq!(record.data["list"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_refresh_info_replaces_profile_fields() {
        let store = store().await;
        store.add_money(UserId(9), 5).await.unwrap();
        let info = ProfileInfo {
            name: Some("Lin".into()),
            gender: Some("female".into()),
            vanity: None,
        };
        let record = store.refresh_info(UserId(9), Some(info)).await.unwrap();
        assert_eq!(record.name, "Lin");
        assert_eq!(record.gender, "female");
        assert_eq!(record.vanity, "unknown");
        assert_eq!(record.money, 5);
    }

    #[tokio::test]
    async fn test_names_and_avatar() {
        let store = store().await;
        assert_eq!(store.get_name(UserId(11)).await.unwrap(), "User");
        assert_eq!(store.get_name_in_db(UserId(11)).await.unwrap(), None);
        assert!(!store.exists(UserId(11)).await.unwrap());

        store
            .create(UserId(11), Some(ProfileInfo::named("Ada")))
            .await
            .unwrap();
        assert_eq!(store.get_name(UserId(11)).await.unwrap(), "Ada");
        assert_eq!(store.get_name_in_db(UserId(11)).await.unwrap().as_deref(), Some("Ada"));
        assert_eq!(store.get_avatar_url(UserId(11)).await, DEFAULT_AVATAR_URL);
    }

    #[tokio::test]
    async fn test_select_and_select_all() {
        let store = store().await;
        store
            .set(UserId(1), Change::path("settings.theme", json!("dark")).unwrap())
            .await
            .unwrap();
        store.add_money(UserId(2), 3).await.unwrap();

        let projection = Projection::path("settings.theme", json!("light")).unwrap();
        assert_eq!(store.select(UserId(1), &projection).await.unwrap(), json!("dark"));
        assert_eq!(
            store.select_all(&projection).await.unwrap(),
            vec![json!("dark"), json!("light")]
        );

        let query = Query::parse("{ userID money }").unwrap();
        let projection = Projection::whole().with_query(query.clone());
        assert_eq!(
            store.select_all(&projection).await.unwrap(),
            vec![json!({"userID": 1, "money": 0}), json!({"userID": 2, "money": 3})]
        );
        assert_eq!(
            store.project(&json!({"money": 1, "x": 2}), &query).unwrap(),
            json!({"userID": null, "money": 1})
        );
    }

    #[tokio::test]
    async fn test_remove_reports_existence() {
        let store = store().await;
        assert!(!store.remove(UserId(8)).await.unwrap());
        store.add_money(UserId(8), 50).await.unwrap();
        assert!(store.remove(UserId(8)).await.unwrap());
        assert_eq!(store.get_money(UserId(8)).await.unwrap(), 0);
    }
}
