// Products, subscriptions, billing events and usage events.

use chrono::{DateTime, Utc};
use serde_json::json;

use milo_core::db::models::{
    BillingEvent, CheckoutSession, CheckoutStatus, Product, Subscription, SubscriptionStatus,
    UsageEvent,
};

use super::{Handle, Upserted};
use crate::document::{to_document, Document, DocumentStore, IndexQuery, Order};
use crate::error::StoreResult;
use crate::schema::{Table, BY_CREATION_TIME};

// ─── Products ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Products<'a>(Handle<'a>);

impl<'a> Products<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Products))
    }

    /// Look up by catalog id (e.g. `performance_plan`).
    pub async fn get_by_product_id(&self, product_id: &str) -> StoreResult<Option<Product>> {
        self.0
            .first(IndexQuery::new("by_product_id").eq("id", product_id))
            .await
    }

    pub async fn list_active(&self) -> StoreResult<Vec<Product>> {
        self.0.all(IndexQuery::new("by_active").eq("active", true)).await
    }

    pub async fn list_all(&self) -> StoreResult<Vec<Product>> {
        self.0.all(IndexQuery::new(BY_CREATION_TIME)).await
    }

    /// Insert the product, or overwrite the catalog fields of the existing
    /// row with the same catalog id. `createdAt` of an existing row is kept.
    pub async fn upsert(&self, product: &Product) -> StoreResult<Upserted<Product>> {
        let outcome = self.0.insert_if_absent("by_product_id", product).await?;
        if outcome.created {
            return Ok(outcome);
        }
        let mut patch = to_document(Table::Products, product)?;
        for system in ["_id", "_creationTime", "createdAt"] {
            patch.remove(system);
        }
        // Optional ids absent from the new record are cleared.
        for optional in ["stripeProductId", "stripePriceId"] {
            patch.entry(optional).or_insert(serde_json::Value::Null);
        }
        let record = self.0.patch(&outcome.record.doc_id, patch).await?;
        Ok(Upserted {
            record,
            created: false,
        })
    }
}

// ─── Subscriptions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Subscriptions<'a>(Handle<'a>);

impl<'a> Subscriptions<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Subscriptions))
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<Subscription>> {
        self.0.get(id).await
    }

    /// Most recently created subscription for the user, any status.
    pub async fn latest_for_user(&self, user_id: &str) -> StoreResult<Option<Subscription>> {
        self.0
            .first(
                IndexQuery::new("by_user")
                    .eq("userId", user_id)
                    .order(Order::Desc),
            )
            .await
    }

    /// Most recently created subscription with status `active`.
    pub async fn active_for_user(&self, user_id: &str) -> StoreResult<Option<Subscription>> {
        self.0
            .first(
                IndexQuery::new("by_user")
                    .eq("userId", user_id)
                    .filter("status", json!(SubscriptionStatus::Active))
                    .order(Order::Desc),
            )
            .await
    }

    /// The operative row for upserts: the active subscription if there is
    /// one, else the latest.
    pub async fn current_for_user(&self, user_id: &str) -> StoreResult<Option<Subscription>> {
        match self.active_for_user(user_id).await? {
            Some(active) => Ok(Some(active)),
            None => self.latest_for_user(user_id).await,
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<Subscription>> {
        self.0.all(IndexQuery::new("by_user").eq("userId", user_id)).await
    }

    pub async fn insert(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        self.0.insert(subscription).await
    }

    pub async fn patch(
        &self,
        id: &str,
        mut patch: Document,
        now: DateTime<Utc>,
    ) -> StoreResult<Subscription> {
        patch.insert("updatedAt".into(), json!(now.timestamp_millis()));
        self.0.patch(id, patch).await
    }
}

// ─── Billing Events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BillingEvents<'a>(Handle<'a>);

impl<'a> BillingEvents<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::BillingEvents))
    }

    /// Append an audit row unconditionally. Returns its id.
    pub async fn append(&self, event: &BillingEvent) -> StoreResult<String> {
        self.0.insert_raw(event).await
    }

    /// Append unless a row with the same (platform, externalId) exists.
    pub async fn append_once(&self, event: &BillingEvent) -> StoreResult<Upserted<BillingEvent>> {
        self.0.insert_if_absent("by_platform_external_id", event).await
    }

    /// Newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BillingEvent>> {
        self.0
            .all(
                IndexQuery::new("by_user")
                    .eq("userId", user_id)
                    .order(Order::Desc)
                    .limit(limit),
            )
            .await
    }

    pub async fn list_by_external_id(&self, external_id: &str) -> StoreResult<Vec<BillingEvent>> {
        self.0
            .all(IndexQuery::new("by_external_id").eq("externalId", external_id))
            .await
    }

    pub async fn mark_processed(&self, id: &str) -> StoreResult<BillingEvent> {
        self.0
            .patch(id, super::fields([("processed", json!(true))]))
            .await
    }
}

// ─── Usage Events ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct UsageEvents<'a>(Handle<'a>);

impl<'a> UsageEvents<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::UsageEvents))
    }

    pub async fn append(&self, event: &UsageEvent) -> StoreResult<String> {
        self.0.insert_raw(event).await
    }

    /// Events for one feature with `start <= timestamp <= end`.
    pub async fn list_for_user_feature_in_window(
        &self,
        user_id: &str,
        feature_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        self.0
            .all(
                IndexQuery::new("by_user_feature")
                    .eq("userId", user_id)
                    .eq("featureId", feature_id)
                    .gte("timestamp", start.timestamp_millis())
                    .lte("timestamp", end.timestamp_millis()),
            )
            .await
    }

    /// Events for every feature with `start <= timestamp <= end`.
    pub async fn list_for_user_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        self.0
            .all(
                IndexQuery::new("by_timestamp")
                    .gte("timestamp", start.timestamp_millis())
                    .lte("timestamp", end.timestamp_millis())
                    .filter("userId", user_id),
            )
            .await
    }
}

// ─── Checkout Sessions ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CheckoutSessions<'a>(Handle<'a>);

impl<'a> CheckoutSessions<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::CheckoutSessions))
    }

    pub async fn create(&self, session: &CheckoutSession) -> StoreResult<CheckoutSession> {
        self.0.insert(session).await
    }

    pub async fn get_by_session_id(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<CheckoutSession>> {
        self.0
            .first(IndexQuery::new("by_session_id").eq("sessionId", session_id))
            .await
    }

    /// The user's sessions on `platform` with the given status, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        platform: &str,
        status: CheckoutStatus,
    ) -> StoreResult<Vec<CheckoutSession>> {
        self.0
            .all(
                IndexQuery::new("by_user")
                    .eq("userId", user_id)
                    .filter("platform", platform)
                    .filter("status", json!(status))
                    .order(Order::Desc),
            )
            .await
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: CheckoutStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<CheckoutSession> {
        self.0
            .patch(
                id,
                super::fields([
                    ("status", json!(status)),
                    ("updatedAt", json!(now.timestamp_millis())),
                ]),
            )
            .await
    }
}
