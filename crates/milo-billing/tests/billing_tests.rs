//! Billing integration tests over the in-memory store.
//!
//! Covers: fulfillment upsert, unknown products, the feature gate boundary,
//! month windows, and webhook processing with redelivery.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use milo_billing::*;
use milo_core::db::models::{BillingEventType, SubscriptionStatus};
use milo_store::StoreClient;

async fn seeded() -> (Arc<StoreClient>, BillingService) {
    let client = Arc::new(StoreClient::memory());
    ProductCatalog::new(client.clone()).seed_default_products().await.unwrap();
    let service = BillingService::new(client.clone(), BillingOptions::default());
    (client, service)
}

fn fulfillment(user_id: &str, product_id: &str, status: SubscriptionStatus) -> FulfillmentRequest {
    let mut subscription = SubscriptionInput::active();
    subscription.status = status;
    FulfillmentRequest {
        user_id: user_id.into(),
        product_id: product_id.into(),
        external_customer_id: "cus_autumn".into(),
        subscription,
    }
}

// ── Reconciliation ──────────────────────────────────────────────

#[tokio::test]
async fn fulfilling_twice_patches_one_subscription() {
    let (client, service) = seeded().await;

    let first = service
        .fulfill_payment(fulfillment("u1", "foundation_plan", SubscriptionStatus::Trialing))
        .await
        .unwrap();
    let second = service
        .fulfill_payment(fulfillment("u1", "champion_plan", SubscriptionStatus::Active))
        .await
        .unwrap();

    assert!(first.success && second.success);
    assert_eq!(first.subscription_id, second.subscription_id);

    let subscriptions = client.subscriptions().list_for_user("u1").await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].product_id, "champion_plan");
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Active);
    assert_eq!(service.billing_history("u1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_product_fails_without_writes() {
    let client = Arc::new(StoreClient::memory());
    let service = BillingService::new(client.clone(), BillingOptions::default());

    let outcome = service
        .fulfill_payment(fulfillment("u1", "performance_plan", SubscriptionStatus::Active))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("Product performance_plan not found"));
    assert!(client.subscriptions().list_for_user("u1").await.unwrap().is_empty());
    assert!(service.billing_history("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn outcome_serializes_for_clients() {
    let (_, service) = seeded().await;
    let outcome = service
        .fulfill_payment(fulfillment("u1", "performance_plan", SubscriptionStatus::Active))
        .await
        .unwrap();
    let body = serde_json::to_value(&outcome).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["billingCycle"], "month");
    assert_eq!(body["productId"], "performance_plan");
    assert!(body.get("error").is_none());
}

// ── Feature gate ────────────────────────────────────────────────

#[tokio::test]
async fn free_plan_boundary_within_month() {
    let client = Arc::new(StoreClient::memory());
    let gate = FeatureGate::new(client, PlanLimits::default());
    let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();

    // free plan: 5 meal scans per month
    for used in 0..5 {
        let access = gate.check_feature_access_at("u1", "meal_scans", now).await.unwrap();
        assert!(access.allowed, "usage {used} should be allowed");
        assert_eq!(access.usage.used, used);
        gate.track_feature_usage_at("u1", "meal_scans", None, None, now).await.unwrap();
    }

    let access = gate.check_feature_access_at("u1", "meal_scans", now).await.unwrap();
    assert!(!access.allowed);
    assert!(!access.has_subscription);
    assert_eq!(access.plan_id, FREE_PLAN);
    assert_eq!(access.usage.limit, Limit::Finite(5));
    let last_second = Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap();
    assert_eq!(access.usage.reset_date, last_second.timestamp_millis() + 999);
}

#[tokio::test]
async fn prior_month_usage_does_not_count() {
    let client = Arc::new(StoreClient::memory());
    let gate = FeatureGate::new(client, PlanLimits::default());
    let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();

    gate.track_feature_usage_at("u1", "workout_plans", Some(3), None, now - Duration::seconds(1))
        .await
        .unwrap();

    let access = gate.check_feature_access_at("u1", "workout_plans", now).await.unwrap();
    assert!(access.allowed);
    assert_eq!(access.usage.used, 0);
}

#[tokio::test]
async fn subscribers_are_always_allowed() {
    let (client, service) = seeded().await;
    service
        .fulfill_payment(fulfillment("u1", "foundation_plan", SubscriptionStatus::Active))
        .await
        .unwrap();
    let gate = FeatureGate::new(client, PlanLimits::default());

    // advanced_form_guidance is capped at 0 on the foundation plan
    let access = gate.check_feature_access("u1", "advanced_form_guidance").await.unwrap();
    assert!(access.allowed);
    assert!(access.has_subscription);
    assert_eq!(access.plan_id, "foundation_plan");
    assert_eq!(access.usage.limit, Limit::Finite(0));

    let period = gate.billing_period_usage("u1").await.unwrap().unwrap();
    assert!(period.usage.is_empty());
}

// ── Webhooks ────────────────────────────────────────────────────

fn sign(payload: &[u8], secret: &str) -> String {
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn webhook_requires_signature_header() {
    let (_, service) = seeded().await;
    let processor = WebhookProcessor::new(service);
    let err = processor.process(b"{}", None).await.unwrap_err();
    assert!(matches!(err, BillingError::MissingSignature));
}

#[tokio::test]
async fn webhook_presence_check_without_secret() {
    let (client, service) = seeded().await;
    let processor = WebhookProcessor::new(service);
    let payload = json!({
        "id": "evt_unknown",
        "type": "charge.refunded",
        "data": {"object": {"customer": "cus_9"}},
    })
    .to_string();

    let receipt = processor.process(payload.as_bytes(), Some("anything")).await.unwrap();
    assert!(!receipt.handled);

    let audit = client.billing_events().list_by_external_id("evt_unknown").await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, BillingEventType::Unknown);
    assert_eq!(audit[0].user_id, "cus_9");
    assert!(audit[0].processed);
}

#[tokio::test]
async fn checkout_webhook_fulfills_once_across_redelivery() {
    let client = Arc::new(StoreClient::memory());
    ProductCatalog::new(client.clone()).seed_default_products().await.unwrap();
    let options = BillingOptions::default().with_webhook_secret("whsec_test");
    let processor = WebhookProcessor::new(BillingService::new(client.clone(), options));

    let payload = json!({
        "id": "evt_checkout_1",
        "type": "checkout.session.completed",
        "data": {"object": {
            "id": "cs_1",
            "customer": "cus_1",
            "metadata": {"userId": "u1", "planId": "performance_plan"},
        }},
    })
    .to_string();
    let header = sign(payload.as_bytes(), "whsec_test");

    let first = processor.process(payload.as_bytes(), Some(&header)).await.unwrap();
    let again = processor.process(payload.as_bytes(), Some(&header)).await.unwrap();
    assert!(first.handled && !first.duplicate);
    assert!(again.duplicate);

    assert_eq!(client.subscriptions().list_for_user("u1").await.unwrap().len(), 1);
    assert_eq!(
        client.billing_events().list_by_external_id("evt_checkout_1").await.unwrap().len(),
        1
    );

    let err = processor.process(payload.as_bytes(), Some("t=1,v1=00")).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test]
async fn subscription_webhooks_upsert_latest_row() {
    let (client, service) = seeded().await;
    let processor = WebhookProcessor::new(service.clone());
    let event = |id: &str, kind: &str, status: &str| {
        json!({
            "id": id,
            "type": kind,
            "data": {"object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": status,
                "current_period_start": 1_700_000_000,
                "current_period_end": 4_102_444_800i64,
                "items": {"data": [{"price": {"product": "prod_perf"}}]},
                "metadata": {"userId": "u1"},
            }},
        })
        .to_string()
    };

    let created = event("evt_1", "customer.subscription.created", "trialing");
    processor.process(created.as_bytes(), Some("sig")).await.unwrap();
    let updated = event("evt_2", "customer.subscription.updated", "active");
    processor.process(updated.as_bytes(), Some("sig")).await.unwrap();

    let summary = service.get_user_subscription("u1").await.unwrap();
    assert!(summary.has_active_subscription);
    assert_eq!(summary.subscription.as_ref().unwrap().external_id, "sub_1");

    let deleted = event("evt_3", "customer.subscription.deleted", "active");
    processor.process(deleted.as_bytes(), Some("sig")).await.unwrap();
    let rows = client.subscriptions().list_for_user("u1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
    assert_eq!(rows[0].cancel_at_period_end, Some(true));
}

#[tokio::test]
async fn subscription_webhook_with_unrepresentable_period_is_malformed() {
    let (client, service) = seeded().await;
    let processor = WebhookProcessor::new(service);
    let payload = json!({
        "id": "evt_far_future",
        "type": "customer.subscription.updated",
        "data": {"object": {
            "id": "sub_9",
            "customer": "cus_9",
            "status": "active",
            "current_period_start": 9_000_000_000_000_000_000i64,
            "current_period_end": 4_102_444_800i64,
            "metadata": {"userId": "u9"},
        }},
    })
    .to_string();

    let err = processor.process(payload.as_bytes(), Some("sig")).await.unwrap_err();
    assert!(matches!(err, BillingError::MalformedEvent(_)));
    assert!(!err.is_client_error());
    assert!(client.subscriptions().list_for_user("u9").await.unwrap().is_empty());

    // left unprocessed so a corrected redelivery is dispatched
    let audit = client.billing_events().list_by_external_id("evt_far_future").await.unwrap();
    assert_eq!(audit.len(), 1);
    assert!(!audit[0].processed);
}
