// Cache entry store: TTL key/value rows in the `cacheEntries` table, exposed
// to the auth framework as its secondary storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use milo_core::db::secondary_storage::{SecondaryStorage, SecondaryStorageError};
use milo_core::error::MiloError;
use milo_store::StoreClient;

/// Entry counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub expired: usize,
    pub active: usize,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    client: Arc<StoreClient>,
}

impl CacheStore {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    /// Upsert `key`. Without a TTL, with a TTL of 0, or with one too large to
    /// represent, the entry never expires.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<(), MiloError> {
        let now = Utc::now();
        let expires_at = ttl_secs
            .filter(|secs| *secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl));
        self.client.cache_entries().upsert(key, value, expires_at, now).await?;
        Ok(())
    }

    /// Value for `key`, or `None` when missing or expired. Expired rows are
    /// left for the sweep.
    pub async fn get(&self, key: &str) -> Result<Option<String>, MiloError> {
        let entry = self.client.cache_entries().get_by_key(key).await?;
        let now = Utc::now();
        Ok(entry.filter(|e| !e.is_expired(now)).map(|e| e.value))
    }

    pub async fn remove(&self, key: &str) -> Result<bool, MiloError> {
        Ok(self.client.cache_entries().remove_by_key(key).await?)
    }

    pub async fn cleanup_expired(&self) -> Result<usize, MiloError> {
        let entries = self.client.cache_entries();
        let mut removed = 0;
        for entry in entries.list_expired(Utc::now()).await? {
            if entries.remove(&entry.id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleaned up expired cache entries");
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, MiloError> {
        let entries = self.client.cache_entries();
        let mut removed = 0;
        for entry in entries.list_all().await? {
            if entries.remove(&entry.id).await? {
                removed += 1;
            }
        }
        debug!(removed, "cleared cache");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, MiloError> {
        let now = Utc::now();
        let all = self.client.cache_entries().list_all().await?;
        let expired = all.iter().filter(|e| e.is_expired(now)).count();
        Ok(CacheStats {
            total: all.len(),
            expired,
            active: all.len() - expired,
        })
    }
}

fn storage_error(e: MiloError) -> SecondaryStorageError {
    SecondaryStorageError::OperationFailed(e.to_string())
}

#[async_trait]
impl SecondaryStorage for CacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SecondaryStorageError> {
        CacheStore::get(self, key).await.map_err(storage_error)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<u64>,
    ) -> Result<(), SecondaryStorageError> {
        CacheStore::set(self, key, value, ttl)
            .await
            .map_err(storage_error)
    }

    async fn delete(&self, key: &str) -> Result<(), SecondaryStorageError> {
        CacheStore::remove(self, key).await.map(|_| ()).map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CacheStore {
        CacheStore::new(Arc::new(StoreClient::memory()))
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let cache = store();
        cache.set("k", "v1", None).await.unwrap();
        cache.set("k", "v2", Some(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(cache.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_expired_reads_as_missing_until_swept() {
        let client = Arc::new(StoreClient::memory());
        let cache = CacheStore::new(client.clone());
        let now = Utc::now();
        client
            .cache_entries()
            .upsert("gone", "v", Some(now - Duration::seconds(1)), now)
            .await
            .unwrap();
        cache.set("kept", "v", None).await.unwrap();

        assert_eq!(cache.get("gone").await.unwrap(), None);
        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.total, stats.expired, stats.active), (2, 1, 1));

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let client = Arc::new(StoreClient::memory());
        let cache = CacheStore::new(client.clone());
        cache.set("k", "v", Some(0)).await.unwrap();

        let entry = client.cache_entries().get_by_key("k").await.unwrap().unwrap();
        assert_eq!(entry.expires_at, None);
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let client = Arc::new(StoreClient::memory());
        let cache = CacheStore::new(client.clone());
        for ttl in [u64::MAX, i64::MAX as u64, (i64::MAX / 1000) as u64] {
            cache.set("k", "v", Some(ttl)).await.unwrap();
            let entry = client.cache_entries().get_by_key("k").await.unwrap().unwrap();
            assert_eq!(entry.expires_at, None);
        }
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_secondary_storage_delete() {
        let cache = store();
        let storage: &dyn SecondaryStorage = &cache;
        storage.set("k", "v", None).await.unwrap();
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.delete("k").await.unwrap();
        assert_eq!(cache.clear_all().await.unwrap(), 0);
    }
}
