// In-memory document store: per-table document vectors behind one RwLock.
//
// Used for development and tests. `insert_if_absent` holds the write lock
// across the key check and the insert, so it is atomic with respect to every
// other call on the same store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use milo_core::utils::generate_id;

use crate::document::{
    apply_patch, compare_by_index, field_value, key_query, stamp, Document, DocumentStore,
    IndexQuery, InsertOutcome, Order,
};
use crate::error::{StoreError, StoreResult};
use crate::schema::{Table, ID};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<Table, Vec<Document>>,
    last_creation_time: i64,
}

impl Inner {
    /// Creation times are strictly increasing within one store.
    fn next_creation_time(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_creation_time = now.max(self.last_creation_time + 1);
        self.last_creation_time
    }

    fn insert(&mut self, table: Table, doc: Document) -> String {
        let id = generate_id();
        let creation_time = self.next_creation_time();
        self.tables
            .entry(table)
            .or_default()
            .push(stamp(doc, &id, creation_time));
        id
    }

    fn position(&self, table: Table, id: &str) -> Option<usize> {
        self.tables
            .get(&table)?
            .iter()
            .position(|doc| field_value(doc, ID).as_str() == Some(id))
    }
}

/// In-memory document store.
///
/// Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a table.
    pub async fn table_len(&self, table: Table) -> usize {
        self.inner
            .read()
            .await
            .tables
            .get(&table)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Drop every document in every table.
    pub async fn clear(&self) {
        self.inner.write().await.tables.clear();
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, table: Table, doc: Document) -> StoreResult<String> {
        Ok(self.inner.write().await.insert(table, doc))
    }

    async fn insert_if_absent(
        &self,
        table: Table,
        index: &str,
        doc: Document,
    ) -> StoreResult<InsertOutcome> {
        let key = key_query(table, index, &doc)?;
        let mut inner = self.inner.write().await;
        let existing = inner
            .tables
            .get(&table)
            .and_then(|docs| docs.iter().find(|d| key.matches(d)))
            .cloned();
        match existing {
            Some(found) => Ok(InsertOutcome::Existing(found)),
            None => Ok(InsertOutcome::Inserted(inner.insert(table, doc))),
        }
    }

    async fn get(&self, table: Table, id: &str) -> StoreResult<Option<Document>> {
        let inner = self.inner.read().await;
        Ok(inner
            .position(table, id)
            .and_then(|pos| inner.tables.get(&table)?.get(pos).cloned()))
    }

    async fn patch(&self, table: Table, id: &str, fields: Document) -> StoreResult<Document> {
        let mut inner = self.inner.write().await;
        let not_found = || StoreError::DocumentNotFound {
            table: table.name(),
            id: id.to_string(),
        };
        let pos = inner.position(table, id).ok_or_else(not_found)?;
        let doc = inner
            .tables
            .get_mut(&table)
            .and_then(|docs| docs.get_mut(pos))
            .ok_or_else(not_found)?;
        apply_patch(doc, fields);
        Ok(doc.clone())
    }

    async fn delete(&self, table: Table, id: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.position(table, id) {
            Some(pos) => {
                if let Some(docs) = inner.tables.get_mut(&table) {
                    docs.remove(pos);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, table: Table, query: &IndexQuery) -> StoreResult<Vec<Document>> {
        let index = query.resolve(table)?;
        let inner = self.inner.read().await;
        let mut results: Vec<Document> = inner
            .tables
            .get(&table)
            .map(|docs| docs.iter().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();

        results.sort_by(|a, b| compare_by_index(index, a, b));
        if query.order == Order::Desc {
            results.reverse();
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_creation_time() {
        let store = MemoryStore::new();
        let id = store
            .insert(Table::Users, doc(json!({"email": "a@x.io", "_id": "ignored"})))
            .await
            .unwrap();
        let stored = store.get(Table::Users, &id).await.unwrap().unwrap();
        assert_eq!(stored["_id"], id.as_str());
        assert!(stored["_creationTime"].as_i64().unwrap() > 0);
        assert_eq!(stored["email"], "a@x.io");
    }

    #[tokio::test]
    async fn test_insert_if_absent_returns_existing() {
        let store = MemoryStore::new();
        let first = store
            .insert_if_absent(
                Table::Users,
                "by_email",
                doc(json!({"email": "a@x.io", "name": "A"})),
            )
            .await
            .unwrap();
        let InsertOutcome::Inserted(id) = first else {
            panic!("expected insert");
        };
        let second = store
            .insert_if_absent(
                Table::Users,
                "by_email",
                doc(json!({"email": "a@x.io", "name": "B"})),
            )
            .await
            .unwrap();
        match second {
            InsertOutcome::Existing(existing) => {
                assert_eq!(existing["_id"], id.as_str());
                assert_eq!(existing["name"], "A");
            }
            other => panic!("expected existing, got {other:?}"),
        }
        assert_eq!(store.table_len(Table::Users).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_insert_if_absent_yields_one_row() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_if_absent(
                        Table::Users,
                        "by_email",
                        doc(json!({"email": "race@x.io", "name": format!("n{i}")})),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), InsertOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.table_len(Table::Users).await, 1);
    }

    #[tokio::test]
    async fn test_patch_missing_document_errors() {
        let store = MemoryStore::new();
        let err = store
            .patch(Table::Sessions, "nope", doc(json!({"token": "t"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = MemoryStore::new();
        let id = store.insert(Table::CacheEntries, doc(json!({"key": "k"}))).await.unwrap();
        assert!(store.delete(Table::CacheEntries, &id).await.unwrap());
        assert!(!store.delete(Table::CacheEntries, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_orders_by_creation_time() {
        let store = MemoryStore::new();
        for status in ["active", "canceled", "active"] {
            store
                .insert(Table::Subscriptions, doc(json!({"userId": "u1", "status": status})))
                .await
                .unwrap();
        }
        store
            .insert(Table::Subscriptions, doc(json!({"userId": "u2", "status": "active"})))
            .await
            .unwrap();

        let latest = store
            .first(
                Table::Subscriptions,
                IndexQuery::new("by_user").eq("userId", "u1").order(Order::Desc),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest["status"], "active");

        let active = store
            .query(
                Table::Subscriptions,
                &IndexQuery::new("by_user").eq("userId", "u1").filter("status", "active"),
            )
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
        assert!(active[0]["_creationTime"].as_i64() < active[1]["_creationTime"].as_i64());
    }

    #[tokio::test]
    async fn test_query_rejects_unindexed_access() {
        let store = MemoryStore::new();
        let err = store
            .query(Table::Users, &IndexQuery::new("by_name").eq("name", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery { table: "users", .. }));
    }
}
