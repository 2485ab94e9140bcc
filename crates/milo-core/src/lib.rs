//! Shared foundation for the milo backend.
//!
//! Entity models for every store table, the auth framework's storage
//! interface ([`Adapter`]), the [`SecondaryStorage`] cache trait, the error
//! taxonomy, id generation, and environment/tracing setup.

pub mod db;
pub mod env;
pub mod error;
pub mod options;
pub mod utils;

// Re-exports for convenience
pub use db::adapter::{Adapter, FindManyQuery, WhereClause};
pub use db::models::{
    Account, BillingEvent, BillingEventType, BillingInterval, CacheEntry, Platform, Product,
    Session, Subscription, SubscriptionStatus, UsageEvent, User, Verification,
};
pub use db::secondary_storage::{SecondaryStorage, SecondaryStorageError};
pub use error::{ApiError, ErrorCode, HttpStatus, MiloError};
pub use options::{AuthOptions, StoreBackend, StoreOptions};
