//! Billing request and result shapes.

use std::collections::BTreeMap;

use chrono::serde::ts_milliseconds_option;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use milo_core::db::models::{BillingInterval, Platform, Subscription, SubscriptionStatus};

use crate::config::Limit;

/// Provider-reported subscription state attached to a fulfillment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInput {
    pub status: SubscriptionStatus,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SubscriptionInput {
    pub fn active() -> Self {
        Self {
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            metadata: None,
        }
    }
}

/// A completed payment to reconcile into the user's subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentRequest {
    pub user_id: String,
    pub product_id: String,
    pub external_customer_id: String,
    pub subscription: SubscriptionInput,
}

/// Result of `fulfill_payment`. Callers branch on `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<BillingInterval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FulfillmentOutcome {
    pub fn fulfilled(
        subscription_id: String,
        product_id: String,
        billing_cycle: BillingInterval,
    ) -> Self {
        Self {
            success: true,
            subscription_id: Some(subscription_id),
            product_id: Some(product_id),
            billing_cycle: Some(billing_cycle),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            subscription_id: None,
            product_id: None,
            billing_cycle: None,
            error: Some(error.into()),
        }
    }
}

/// Result of `cancel_subscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full provider view of a subscription, applied to the user's latest row.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpsert {
    pub user_id: String,
    pub platform: Platform,
    pub external_id: String,
    pub product_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: Option<bool>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub has_active_subscription: bool,
    pub subscription: Option<Subscription>,
}

/// Catalog entry as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInput {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
    pub currency: String,
    pub interval: BillingInterval,
    #[serde(default)]
    pub features: Vec<String>,
    pub active: bool,
    #[serde(default)]
    pub stripe_product_id: Option<String>,
    #[serde(default)]
    pub stripe_price_id: Option<String>,
}

// ─── Feature gate ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureUsage {
    pub used: i64,
    pub limit: Limit,
    /// End of the current usage window, epoch millis.
    pub reset_date: i64,
}

/// Answer to "may this user use this feature now".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccess {
    pub allowed: bool,
    pub has_subscription: bool,
    pub usage: FeatureUsage,
    pub plan_id: String,
}

/// Usage of one feature in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotal {
    pub used: i64,
    pub reset_date: i64,
}

/// Per-feature usage inside the active subscription's billing period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingPeriodUsage {
    pub subscription: Subscription,
    pub usage: BTreeMap<String, i64>,
    pub billing_period: BillingPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: i64,
    pub end: i64,
}

// ─── Webhooks ────────────────────────────────────────────────────

/// Provider webhook envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// What the processor did with a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceipt {
    pub event_id: String,
    pub event_type: String,
    /// False for event types with no handler.
    pub handled: bool,
    /// True when this event id was already processed.
    pub duplicate: bool,
}
