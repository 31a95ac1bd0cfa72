//! Profile provider - external name/gender/vanity/avatar lookup
//!
//! Lookups are best effort. Failures and timeouts never reach store callers;
//! they resolve to defaults here.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

use crate::error::StoreError;
use crate::record::{ProfileInfo, UserId};

/// Avatar returned when the provider has none
pub const DEFAULT_AVATAR_URL: &str =
    "https://i.ibb.co/bBSpr5v/143086968-2856368904622192-1959732218791162458-n.png";

#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn fetch_info(&self, id: UserId) -> Result<ProfileInfo, StoreError>;

    async fn avatar_url(&self, id: UserId) -> Result<String, StoreError> {
        Err(StoreError::Internal(format!("no avatar source for {}", id)))
    }
}

/// Provider with no upstream; every lookup falls back to defaults
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfileProvider;

#[async_trait]
impl ProfileProvider for NoProfileProvider {
    async fn fetch_info(&self, id: UserId) -> Result<ProfileInfo, StoreError> {
        Err(StoreError::Internal(format!("no profile source for {}", id)))
    }
}

/// Fetch profile info, absorbing errors and timeouts into an empty profile
pub async fn fetch_or_default(
    provider: &dyn ProfileProvider,
    id: UserId,
    limit: Duration,
) -> ProfileInfo {
    match timeout(limit, provider.fetch_info(id)).await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            warn!(user_id = %id, error = %e, "Profile lookup failed, using defaults");
            ProfileInfo::default()
        }
        Err(_) => {
            warn!(user_id = %id, timeout_ms = limit.as_millis() as u64, "Profile lookup timed out, using defaults");
            ProfileInfo::default()
        }
    }
}

/// Avatar URL or `DEFAULT_AVATAR_URL`
pub async fn avatar_or_default(provider: &dyn ProfileProvider, id: UserId, limit: Duration) -> String {
    match timeout(limit, provider.avatar_url(id)).await {
        Ok(Ok(url)) if !url.is_empty() => url,
        _ => DEFAULT_AVATAR_URL.to_string(),
    }
}
