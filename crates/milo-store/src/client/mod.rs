// Typed document store client.
//
// `StoreClient` is the only way components touch the store. Each table gets a
// borrowed handle (`client.users()`, `client.sessions()`, ...) whose methods
// use the table's named indexes and decode documents into milo-core models.

mod auth;
mod billing;
mod cache;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use milo_core::options::{StoreBackend, StoreOptions};

use crate::document::{from_document, to_document, Document, DocumentStore, IndexQuery};
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryStore;
use crate::mongo::MongoStore;
use crate::schema::Table;

pub use auth::{Accounts, OnboardingStatus, SessionStats, Sessions, Users, Verifications};
pub use billing::{BillingEvents, CheckoutSessions, Products, Subscriptions, UsageEvents};
pub use cache::CacheEntries;

/// A record returned from an insert-or-return-existing call.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<T> {
    pub record: T,
    /// False when an existing record was returned instead.
    pub created: bool,
}

/// Typed client over a [`DocumentStore`] backend.
#[derive(Debug, Clone)]
pub struct StoreClient {
    store: Arc<dyn DocumentStore>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Client over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Build the backend named by the options. MongoDB indexes are ensured
    /// before the client is returned.
    pub async fn connect(options: &StoreOptions) -> StoreResult<Self> {
        match options.backend {
            StoreBackend::Memory => Ok(Self::memory()),
            StoreBackend::Mongodb => {
                let mongo = MongoStore::connect(&options.uri, &options.database).await?;
                mongo.ensure_indexes().await?;
                Ok(Self::new(Arc::new(mongo)))
            }
        }
    }

    /// The raw backend.
    pub fn backend(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    pub fn users(&self) -> Users<'_> {
        Users::new(self.backend())
    }

    pub fn sessions(&self) -> Sessions<'_> {
        Sessions::new(self.backend())
    }

    pub fn accounts(&self) -> Accounts<'_> {
        Accounts::new(self.backend())
    }

    pub fn verifications(&self) -> Verifications<'_> {
        Verifications::new(self.backend())
    }

    pub fn products(&self) -> Products<'_> {
        Products::new(self.backend())
    }

    pub fn subscriptions(&self) -> Subscriptions<'_> {
        Subscriptions::new(self.backend())
    }

    pub fn billing_events(&self) -> BillingEvents<'_> {
        BillingEvents::new(self.backend())
    }

    pub fn usage_events(&self) -> UsageEvents<'_> {
        UsageEvents::new(self.backend())
    }

    pub fn checkout_sessions(&self) -> CheckoutSessions<'_> {
        CheckoutSessions::new(self.backend())
    }

    pub fn cache_entries(&self) -> CacheEntries<'_> {
        CacheEntries::new(self.backend())
    }
}

// ─── Shared typed helpers ────────────────────────────────────────

/// A table handle: the backend plus the table it addresses.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handle<'a> {
    store: &'a dyn DocumentStore,
    table: Table,
}

impl<'a> Handle<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore, table: Table) -> Self {
        Self { store, table }
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, id: &str) -> StoreResult<Option<T>> {
        self.store
            .get(self.table, id)
            .await?
            .map(|doc| from_document(self.table, doc))
            .transpose()
    }

    pub(crate) async fn first<T: DeserializeOwned>(
        &self,
        query: IndexQuery,
    ) -> StoreResult<Option<T>> {
        self.store
            .first(self.table, query)
            .await?
            .map(|doc| from_document(self.table, doc))
            .transpose()
    }

    pub(crate) async fn all<T: DeserializeOwned>(&self, query: IndexQuery) -> StoreResult<Vec<T>> {
        self.store
            .query(self.table, &query)
            .await?
            .into_iter()
            .map(|doc| from_document(self.table, doc))
            .collect()
    }

    /// Insert a model and read it back with its assigned id.
    pub(crate) async fn insert<T>(&self, record: &T) -> StoreResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let id = self.insert_raw(record).await?;
        self.get(&id).await?.ok_or(StoreError::DocumentNotFound {
            table: self.table.name(),
            id,
        })
    }

    pub(crate) async fn insert_raw<T: Serialize>(&self, record: &T) -> StoreResult<String> {
        let doc = to_document(self.table, record)?;
        self.store.insert(self.table, doc).await
    }

    pub(crate) async fn insert_if_absent<T: Serialize + DeserializeOwned>(
        &self,
        index: &str,
        record: &T,
    ) -> StoreResult<Upserted<T>> {
        use crate::document::InsertOutcome;

        let doc = to_document(self.table, record)?;
        match self.store.insert_if_absent(self.table, index, doc).await? {
            InsertOutcome::Inserted(id) => {
                let record = self.get(&id).await?.ok_or(StoreError::DocumentNotFound {
                    table: self.table.name(),
                    id,
                })?;
                Ok(Upserted { record, created: true })
            }
            InsertOutcome::Existing(doc) => Ok(Upserted {
                record: from_document(self.table, doc)?,
                created: false,
            }),
        }
    }

    pub(crate) async fn patch<T: DeserializeOwned>(
        &self,
        id: &str,
        fields: Document,
    ) -> StoreResult<T> {
        let doc = self.store.patch(self.table, id, fields).await?;
        from_document(self.table, doc)
    }

    pub(crate) async fn delete(&self, id: &str) -> StoreResult<bool> {
        self.store.delete(self.table, id).await
    }

    /// Delete every document matched by `query`. Returns the number removed.
    pub(crate) async fn delete_matching(&self, query: IndexQuery) -> StoreResult<usize> {
        let docs = self.store.query(self.table, &query).await?;
        let mut removed = 0;
        for doc in docs {
            if let Some(id) = doc.get(crate::schema::ID).and_then(|v| v.as_str()) {
                if self.store.delete(self.table, id).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub(crate) async fn count(&self, query: IndexQuery) -> StoreResult<usize> {
        Ok(self.store.query(self.table, &query).await?.len())
    }
}

/// Build a patch document from `(field, value)` pairs.
pub(crate) fn fields<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> Document {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
