pub mod adapter;
pub mod models;
pub mod secondary_storage;

pub use adapter::{Adapter, AdapterResult, FindManyQuery, Operator, WhereClause};
pub use models::{
    Account, BillingEvent, BillingEventType, BillingInterval, CacheEntry, Platform, Product,
    Session, Subscription, SubscriptionStatus, UsageEvent, User, Verification,
};
pub use secondary_storage::{SecondaryStorage, SecondaryStorageError};
