//! Billing reconciliation: payment fulfillment, cancellation and provider
//! subscription updates.
//!
//! Every user has one operative subscription row. Fulfillment and provider
//! updates patch that row in place when it exists and insert otherwise; each
//! fulfillment or cancellation appends one audit row to `billingEvents`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use milo_core::db::models::{
    BillingEvent, BillingEventType, Platform, Subscription, SubscriptionStatus,
};
use milo_core::error::ErrorCode;
use milo_store::document::to_document;
use milo_store::{Document, StoreClient, Table};

use crate::config::BillingOptions;
use crate::error::BillingResult;
use crate::types::{
    CancellationOutcome, FulfillmentOutcome, FulfillmentRequest, SubscriptionSummary,
    SubscriptionUpsert,
};

/// Audit rows returned by `billing_history`.
pub const HISTORY_LIMIT: usize = 50;

/// Optional subscription fields cleared when a provider update omits them.
const CLEARABLE_FIELDS: &[&str] = &[
    "cancelAtPeriodEnd",
    "canceledAt",
    "trialStart",
    "trialEnd",
    "metadata",
];

#[derive(Debug, Clone)]
pub struct BillingService {
    client: Arc<StoreClient>,
    options: BillingOptions,
}

impl BillingService {
    pub fn new(client: Arc<StoreClient>, options: BillingOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn options(&self) -> &BillingOptions {
        &self.options
    }

    /// Reconcile a completed payment into the user's subscription.
    ///
    /// An unknown product is a failed outcome and writes nothing. Store
    /// failures are returned as errors.
    pub async fn fulfill_payment(
        &self,
        request: FulfillmentRequest,
    ) -> BillingResult<FulfillmentOutcome> {
        let subscriptions = self.client.subscriptions();
        let existing = subscriptions.current_for_user(&request.user_id).await?;

        let products = self.client.products();
        let Some(product) = products.get_by_product_id(&request.product_id).await? else {
            warn!(
                user_id = %request.user_id,
                product_id = %request.product_id,
                "fulfillment for unknown product"
            );
            let message = format!("Product {} not found", request.product_id);
            return Ok(FulfillmentOutcome::failed(message));
        };

        let now = Utc::now();
        let input = &request.subscription;
        let period_start = input.current_period_start.unwrap_or(now);
        let period_end = input
            .current_period_end
            .unwrap_or_else(|| now + Duration::days(self.options.default_period_days));
        let metadata = input.metadata.clone().unwrap_or_else(|| json!({}));

        let subscription_id = match existing {
            Some(current) => {
                let patch = fields([
                    ("userId", json!(request.user_id)),
                    ("productId", json!(request.product_id)),
                    ("platform", json!(Platform::Autumn)),
                    ("externalId", json!(request.external_customer_id)),
                    ("autumnCustomerId", json!(request.external_customer_id)),
                    ("status", json!(input.status)),
                    ("currentPeriodStart", json!(period_start.timestamp_millis())),
                    ("currentPeriodEnd", json!(period_end.timestamp_millis())),
                    ("cancelAtPeriodEnd", json!(input.cancel_at_period_end.unwrap_or(false))),
                    ("metadata", metadata),
                ]);
                subscriptions.patch(&current.id, patch, now).await?;
                current.id
            }
            None => {
                let subscription = Subscription {
                    id: String::new(),
                    creation_time: 0,
                    user_id: request.user_id.clone(),
                    platform: Platform::Autumn,
                    external_id: request.external_customer_id.clone(),
                    product_id: request.product_id.clone(),
                    status: input.status,
                    current_period_start: period_start,
                    current_period_end: period_end,
                    cancel_at_period_end: Some(input.cancel_at_period_end.unwrap_or(false)),
                    canceled_at: None,
                    trial_start: None,
                    trial_end: None,
                    autumn_customer_id: Some(request.external_customer_id.clone()),
                    metadata: Some(metadata),
                    created_at: now,
                    updated_at: now,
                };
                subscriptions.insert(&subscription).await?.id
            }
        };

        self.client
            .billing_events()
            .append(&BillingEvent {
                id: String::new(),
                creation_time: 0,
                user_id: request.user_id.clone(),
                kind: BillingEventType::SubscriptionCreated,
                subscription_id: Some(subscription_id.clone()),
                external_id: request.external_customer_id.clone(),
                platform: Platform::Autumn,
                data: serde_json::to_value(input)?,
                processed: true,
                created_at: now,
            })
            .await?;

        self.stamp_onboarding(&request.user_id, now).await;

        info!(
            user_id = %request.user_id,
            product_id = %request.product_id,
            subscription_id = %subscription_id,
            "payment fulfilled"
        );
        Ok(FulfillmentOutcome::fulfilled(subscription_id, request.product_id, product.interval))
    }

    /// Best-effort: mark onboarding complete for the paying user. The user is
    /// looked up by id, then by email.
    async fn stamp_onboarding(&self, user_ref: &str, now: DateTime<Utc>) {
        let users = self.client.users();
        let user = match users.get_by_id(user_ref).await {
            Ok(Some(user)) => Some(user),
            Ok(None) => users.get_by_email(user_ref).await.unwrap_or_else(|e| {
                warn!(user = user_ref, error = %e, "user lookup by email failed");
                None
            }),
            Err(e) => {
                warn!(user = user_ref, error = %e, "user lookup failed");
                None
            }
        };
        let Some(user) = user else {
            warn!(user = user_ref, "could not find user to update onboarding status");
            return;
        };
        if let Err(e) = users.activate_subscription(&user.id, now).await {
            warn!(user_id = %user.id, error = %e, "failed to stamp subscription activation");
        }
    }

    /// Cancel the user's active subscription, at period end or immediately.
    pub async fn cancel_subscription(
        &self,
        user_id: &str,
        cancel_at_period_end: Option<bool>,
    ) -> BillingResult<CancellationOutcome> {
        let subscriptions = self.client.subscriptions();
        let Some(subscription) = subscriptions.active_for_user(user_id).await? else {
            return Ok(CancellationOutcome {
                success: false,
                cancel_at_period_end: None,
                error: Some(ErrorCode::SubscriptionNotFound.to_string()),
            });
        };

        let at_period_end = cancel_at_period_end.unwrap_or(false);
        let now = Utc::now();
        let patch = if at_period_end {
            fields([("cancelAtPeriodEnd", json!(true))])
        } else {
            fields([("status", json!(SubscriptionStatus::Canceled))])
        };
        subscriptions.patch(&subscription.id, patch, now).await?;

        let external_id = if subscription.external_id.is_empty() {
            subscription.autumn_customer_id.clone().unwrap_or_default()
        } else {
            subscription.external_id.clone()
        };
        self.client
            .billing_events()
            .append(&BillingEvent {
                id: String::new(),
                creation_time: 0,
                user_id: user_id.to_string(),
                kind: BillingEventType::SubscriptionCanceled,
                subscription_id: Some(subscription.id.clone()),
                external_id,
                platform: Platform::Autumn,
                data: json!({ "cancelAtPeriodEnd": at_period_end }),
                processed: true,
                created_at: now,
            })
            .await?;

        info!(user_id, subscription_id = %subscription.id, at_period_end, "subscription canceled");
        Ok(CancellationOutcome {
            success: true,
            cancel_at_period_end: Some(at_period_end),
            error: None,
        })
    }

    /// Apply a provider's full view of a subscription to the user's
    /// operative row, or insert one. Returns the row id.
    pub async fn update_subscription(&self, update: SubscriptionUpsert) -> BillingResult<String> {
        let subscriptions = self.client.subscriptions();
        let existing = subscriptions.current_for_user(&update.user_id).await?;
        let now = Utc::now();

        let mut subscription = Subscription {
            id: String::new(),
            creation_time: 0,
            user_id: update.user_id,
            platform: update.platform,
            external_id: update.external_id,
            product_id: update.product_id,
            status: update.status,
            current_period_start: update.current_period_start,
            current_period_end: update.current_period_end,
            cancel_at_period_end: update.cancel_at_period_end,
            canceled_at: update.canceled_at,
            trial_start: update.trial_start,
            trial_end: update.trial_end,
            autumn_customer_id: None,
            metadata: update.metadata,
            created_at: now,
            updated_at: now,
        };

        match existing {
            Some(current) => {
                let mut patch = to_document(Table::Subscriptions, &subscription)?;
                for key in ["_id", "_creationTime", "createdAt", "autumnCustomerId"] {
                    patch.remove(key);
                }
                for key in CLEARABLE_FIELDS {
                    patch.entry(key.to_string()).or_insert(Value::Null);
                }
                subscriptions.patch(&current.id, patch, now).await?;
                Ok(current.id)
            }
            None => {
                subscription = subscriptions.insert(&subscription).await?;
                Ok(subscription.id)
            }
        }
    }

    /// The user's operative subscription and whether it currently grants
    /// access (status `active`, period not elapsed).
    pub async fn get_user_subscription(&self, user_id: &str) -> BillingResult<SubscriptionSummary> {
        let subscription = self.client.subscriptions().current_for_user(user_id).await?;
        let now = Utc::now();
        Ok(SubscriptionSummary {
            has_active_subscription: subscription
                .as_ref()
                .is_some_and(|s| {
                    s.status == SubscriptionStatus::Active && s.current_period_end > now
                }),
            subscription,
        })
    }

    /// Latest audit rows for the user, newest first.
    pub async fn billing_history(&self, user_id: &str) -> BillingResult<Vec<BillingEvent>> {
        Ok(self.client.billing_events().list_for_user(user_id, HISTORY_LIMIT).await?)
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Document {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use milo_core::db::models::{BillingInterval, Product, User};

    async fn service_with_product(product_id: &str) -> BillingService {
        let client = Arc::new(StoreClient::memory());
        let now = Utc::now();
        client
            .products()
            .upsert(&Product {
                doc_id: String::new(),
                creation_time: 0,
                id: product_id.into(),
                name: "Plan".into(),
                description: String::new(),
                price: 19.99,
                currency: "USD".into(),
                interval: BillingInterval::Month,
                features: vec![],
                active: true,
                stripe_product_id: None,
                stripe_price_id: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        BillingService::new(client, BillingOptions::default())
    }

    fn request(user_id: &str, product_id: &str, status: SubscriptionStatus) -> FulfillmentRequest {
        let mut subscription = crate::types::SubscriptionInput::active();
        subscription.status = status;
        FulfillmentRequest {
            user_id: user_id.into(),
            product_id: product_id.into(),
            external_customer_id: "cus_1".into(),
            subscription,
        }
    }

    #[tokio::test]
    async fn test_fulfillment_defaults_period_end() {
        let service = service_with_product("performance_plan").await;
        let before = Utc::now();
        let outcome = service
            .fulfill_payment(request("u1", "performance_plan", SubscriptionStatus::Active))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.billing_cycle, Some(BillingInterval::Month));

        let sub = service.client().subscriptions().latest_for_user("u1").await.unwrap().unwrap();
        assert!(sub.current_period_end >= before + Duration::days(30));
        assert_eq!(sub.cancel_at_period_end, Some(false));
        assert_eq!(sub.platform, Platform::Autumn);
    }

    #[tokio::test]
    async fn test_fulfillment_stamps_user_found_by_email() {
        let service = service_with_product("foundation_plan").await;
        let user = service
            .client()
            .users()
            .create_or_get(&User::new("Pat", "pat@example.com", Utc::now()))
            .await
            .unwrap()
            .record;

        service
            .fulfill_payment(request(
                "pat@example.com",
                "foundation_plan",
                SubscriptionStatus::Active,
            ))
            .await
            .unwrap();

        let user = service.client().users().get_by_id(&user.id).await.unwrap().unwrap();
        assert_eq!(user.has_completed_onboarding, Some(true));
        assert!(user.subscription_activated_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_a_value() {
        let service = service_with_product("foundation_plan").await;
        let outcome = service.cancel_subscription("nobody", Some(true)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("No active subscription found"));
        assert!(service.billing_history("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_graceful_then_immediate() {
        let service = service_with_product("foundation_plan").await;
        service
            .fulfill_payment(request("u1", "foundation_plan", SubscriptionStatus::Active))
            .await
            .unwrap();

        let graceful = service.cancel_subscription("u1", Some(true)).await.unwrap();
        assert_eq!(graceful.cancel_at_period_end, Some(true));
        let sub = service.client().subscriptions().latest_for_user("u1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.cancel_at_period_end, Some(true));

        service.cancel_subscription("u1", None).await.unwrap();
        let summary = service.get_user_subscription("u1").await.unwrap();
        assert!(!summary.has_active_subscription);
        assert_eq!(summary.subscription.unwrap().status, SubscriptionStatus::Canceled);

        let history = service.billing_history("u1").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, BillingEventType::SubscriptionCanceled);
        assert_eq!(history[0].data, json!({"cancelAtPeriodEnd": false}));
    }

    #[tokio::test]
    async fn test_provider_update_patches_active_row_over_newer_canceled_one() {
        let service = service_with_product("foundation_plan").await;
        service
            .fulfill_payment(request("u1", "foundation_plan", SubscriptionStatus::Active))
            .await
            .unwrap();
        let subscriptions = service.client().subscriptions();
        let active = subscriptions.latest_for_user("u1").await.unwrap().unwrap();

        let mut lapsed = active.clone();
        lapsed.status = SubscriptionStatus::Canceled;
        lapsed.external_id = "sub_lapsed".into();
        let lapsed = subscriptions.insert(&lapsed).await.unwrap();
        assert_ne!(lapsed.id, active.id);

        let now = Utc::now();
        let patched = service
            .update_subscription(SubscriptionUpsert {
                user_id: "u1".into(),
                platform: Platform::Stripe,
                external_id: "sub_live".into(),
                product_id: "foundation_plan".into(),
                status: SubscriptionStatus::Active,
                current_period_start: now,
                current_period_end: now + Duration::days(30),
                cancel_at_period_end: Some(false),
                canceled_at: None,
                trial_start: None,
                trial_end: None,
                metadata: None,
            })
            .await
            .unwrap();
        assert_eq!(patched, active.id);

        let lapsed = subscriptions.get_by_id(&lapsed.id).await.unwrap().unwrap();
        assert_eq!(lapsed.status, SubscriptionStatus::Canceled);
        assert_eq!(lapsed.external_id, "sub_lapsed");
        let active = subscriptions.get_by_id(&active.id).await.unwrap().unwrap();
        assert_eq!(active.external_id, "sub_live");
        assert_eq!(subscriptions.list_for_user("u1").await.unwrap().len(), 2);
    }
}
