// `DocumentStore` implementation on the MongoDB driver.
//
// - Tables → Collections (same names)
// - `_id` is the nanoid string assigned on insert
// - Declared indexes are created by `ensure_indexes`, unique ones with a
//   unique constraint
// - insert_if_absent is one findOneAndUpdate upsert with $setOnInsert

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use mongodb::bson::{doc, Document as BsonDocument};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use milo_core::utils::generate_id;

use crate::bson;
use crate::document::{key_query, stamp, Document, DocumentStore, IndexQuery, InsertOutcome};
use crate::error::{StoreError, StoreResult};
use crate::schema::{Table, BY_CREATION_TIME};

/// MongoDB document store.
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Create a store from an existing database handle.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Connect to a MongoDB URI.
    pub async fn connect(uri: &str, db_name: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB connection failed: {e}")))?;
        info!(database = db_name, "connected to MongoDB");
        Ok(Self {
            db: client.database(db_name),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn collection(&self, table: Table) -> Collection<BsonDocument> {
        self.db.collection(table.name())
    }

    /// Create every declared index, plus the creation-time index.
    pub async fn ensure_indexes(&self) -> StoreResult<()> {
        for table in Table::ALL {
            let coll = self.collection(table);
            let creation = table.index(BY_CREATION_TIME).into_iter();
            for index in table.indexes().iter().chain(creation) {
                let options = IndexOptions::builder()
                    .name(index.name.to_string())
                    .unique(index.unique)
                    .build();
                let model = IndexModel::builder()
                    .keys(bson::index_keys(index))
                    .options(options)
                    .build();
                coll.create_index(model).await.map_err(|e| {
                    StoreError::Backend(format!(
                        "MongoDB create_index {}.{} failed: {e}",
                        table.name(),
                        index.name
                    ))
                })?;
            }
            debug!(table = table.name(), "indexes ensured");
        }
        Ok(())
    }

    async fn find_by_filter(
        &self,
        table: Table,
        filter: BsonDocument,
    ) -> StoreResult<Option<Document>> {
        let found = self
            .collection(table)
            .find_one(filter)
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB find_one failed: {e}")))?;
        Ok(found.map(|doc| bson::from_bson_doc(&doc)))
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    e.to_string().contains("E11000")
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert(&self, table: Table, doc: Document) -> StoreResult<String> {
        let id = generate_id();
        let doc = stamp(doc, &id, Utc::now().timestamp_millis());
        self.collection(table)
            .insert_one(bson::to_bson_doc(&doc))
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB insert failed: {e}")))?;
        Ok(id)
    }

    async fn insert_if_absent(
        &self,
        table: Table,
        index: &str,
        doc: Document,
    ) -> StoreResult<InsertOutcome> {
        let key = key_query(table, index, &doc)?;
        let filter = bson::build_filter(&key);
        let id = generate_id();
        let doc = stamp(doc, &id, Utc::now().timestamp_millis());

        let mut options = FindOneAndUpdateOptions::default();
        options.upsert = Some(true);
        options.return_document = Some(ReturnDocument::Before);

        let result = self
            .collection(table)
            .find_one_and_update(filter.clone(), doc! { "$setOnInsert": bson::to_bson_doc(&doc) })
            .with_options(options)
            .await;

        match result {
            Ok(Some(existing)) => Ok(InsertOutcome::Existing(bson::from_bson_doc(&existing))),
            Ok(None) => Ok(InsertOutcome::Inserted(id)),
            // Two upserts raced on a unique index; the loser reads the winner.
            Err(e) if is_duplicate_key(&e) => match self.find_by_filter(table, filter).await? {
                Some(existing) => Ok(InsertOutcome::Existing(existing)),
                None => Err(StoreError::Backend(format!("MongoDB upsert failed: {e}"))),
            },
            Err(e) => Err(StoreError::Backend(format!("MongoDB upsert failed: {e}"))),
        }
    }

    async fn get(&self, table: Table, id: &str) -> StoreResult<Option<Document>> {
        self.find_by_filter(table, doc! { "_id": id }).await
    }

    async fn patch(&self, table: Table, id: &str, fields: Document) -> StoreResult<Document> {
        let not_found = || StoreError::DocumentNotFound {
            table: table.name(),
            id: id.to_string(),
        };
        let Some(update) = bson::build_patch(&fields) else {
            return self.get(table, id).await?.ok_or_else(not_found);
        };

        let mut options = FindOneAndUpdateOptions::default();
        options.return_document = Some(ReturnDocument::After);

        let updated = self
            .collection(table)
            .find_one_and_update(doc! { "_id": id }, update)
            .with_options(options)
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB update failed: {e}")))?;

        updated
            .map(|doc| bson::from_bson_doc(&doc))
            .ok_or_else(not_found)
    }

    async fn delete(&self, table: Table, id: &str) -> StoreResult<bool> {
        let result = self
            .collection(table)
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB delete failed: {e}")))?;
        Ok(result.deleted_count > 0)
    }

    async fn query(&self, table: Table, query: &IndexQuery) -> StoreResult<Vec<Document>> {
        let index = query.resolve(table)?;

        let mut find_opts = FindOptions::default();
        find_opts.sort = Some(bson::build_sort(index, query.order));
        if let Some(limit) = query.limit {
            find_opts.limit = Some(limit as i64);
        }

        let mut cursor = self
            .collection(table)
            .find(bson::build_filter(query))
            .with_options(find_opts)
            .await
            .map_err(|e| StoreError::Backend(format!("MongoDB find failed: {e}")))?;

        let mut results = Vec::new();
        while let Some(doc) = cursor.next().await {
            let doc = doc.map_err(|e| StoreError::Backend(format!("Cursor error: {e}")))?;
            results.push(bson::from_bson_doc(&doc));
        }
        Ok(results)
    }
}
