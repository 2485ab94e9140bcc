//! Document store client for the milo backend.
//!
//! [`schema`] names every table and index. [`DocumentStore`] is the backend
//! trait, implemented by [`MemoryStore`] and [`MongoStore`]. [`StoreClient`]
//! wraps a backend and exposes typed per-table query and mutation calls; it is
//! built once at startup and shared as `Arc<StoreClient>`.

pub mod bson;
pub mod client;
pub mod document;
pub mod error;
pub mod memory;
pub mod mongo;
pub mod schema;

pub use client::{StoreClient, Upserted};
pub use document::{Document, DocumentStore, IndexQuery, InsertOutcome, Order};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use schema::Table;
