// Cache entries.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use milo_core::db::models::CacheEntry;

use super::{fields, Handle};
use crate::document::{DocumentStore, IndexQuery};
use crate::error::StoreResult;
use crate::schema::{Table, BY_CREATION_TIME};

#[derive(Debug, Clone, Copy)]
pub struct CacheEntries<'a>(Handle<'a>);

impl<'a> CacheEntries<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::CacheEntries))
    }

    /// Raw lookup; expiry is the caller's concern.
    pub async fn get_by_key(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        self.0.first(IndexQuery::new("by_key").eq("key", key)).await
    }

    /// Insert or overwrite the entry for `key`. A `None` expiry clears any
    /// previous one.
    pub async fn upsert(
        &self,
        key: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<CacheEntry> {
        let entry = CacheEntry {
            id: String::new(),
            creation_time: 0,
            key: key.to_string(),
            value: value.to_string(),
            expires_at,
            created_at: now,
            updated_at: now,
        };
        let outcome = self.0.insert_if_absent("by_key", &entry).await?;
        if outcome.created {
            return Ok(outcome.record);
        }
        let expires = expires_at.map_or(Value::Null, |at| json!(at.timestamp_millis()));
        self.0
            .patch(
                &outcome.record.id,
                fields([
                    ("value", json!(value)),
                    ("expiresAt", expires),
                    ("updatedAt", json!(now.timestamp_millis())),
                ]),
            )
            .await
    }

    pub async fn remove_by_key(&self, key: &str) -> StoreResult<bool> {
        self.0
            .delete_matching(IndexQuery::new("by_key").eq("key", key))
            .await
            .map(|n| n > 0)
    }

    /// Entries with an expiry before `now`. Entries without expiry are never listed.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<CacheEntry>> {
        self.0
            .all(
                IndexQuery::new("by_expires_at")
                    .gte("expiresAt", 0)
                    .lt("expiresAt", now.timestamp_millis()),
            )
            .await
    }

    pub async fn list_all(&self) -> StoreResult<Vec<CacheEntry>> {
        self.0.all(IndexQuery::new(BY_CREATION_TIME)).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.0.delete(id).await
    }
}
