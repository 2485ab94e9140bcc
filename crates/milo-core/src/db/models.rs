// Document models for every table in the store.
//
// All documents carry the store-assigned `_id` and `_creationTime`. Timestamps
// are persisted as epoch milliseconds; chrono's `ts_milliseconds` helpers do
// the conversion so the Rust side only ever sees `DateTime<Utc>`.

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default role for users without an explicit one.
pub const DEFAULT_ROLE: &str = "user";

/// Role allowed to read operational metrics.
pub const ADMIN_ROLE: &str = "admin";

// ─── Auth Tables ─────────────────────────────────────────────────

/// User identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ban_expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_completed_onboarding: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_activated_trial: Option<bool>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trial_activated_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub onboarding_completed_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub subscription_activated_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A fresh, unverified user with the default role.
    ///
    /// First and last name are derived from `name`: first word, then the rest.
    pub fn new(name: impl Into<String>, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        let name = name.into();
        let (first_name, last_name) = split_name(&name);
        Self {
            id: String::new(),
            creation_time: 0,
            name,
            first_name,
            last_name,
            email: email.into(),
            email_verified: false,
            image: None,
            role: Some(DEFAULT_ROLE.to_string()),
            banned: None,
            ban_reason: None,
            ban_expires: None,
            has_completed_onboarding: None,
            has_activated_trial: None,
            trial_activated_at: None,
            onboarding_completed_at: None,
            subscription_activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stored role, or the default when absent.
    pub fn role_or_default(&self) -> &str {
        self.role.as_deref().unwrap_or(DEFAULT_ROLE)
    }
}

/// Split a display name into (first, rest).
pub fn split_name(name: &str) -> (String, String) {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

/// A bearer-token session tied to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub user_id: String,
    pub token: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_by: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// An external identity linked to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub user_id: String,
    /// Provider-specific user identifier (e.g. the GitHub numeric id).
    pub account_id: String,
    /// Provider identifier (e.g. "google", "github", "credential").
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Short-lived identifier→value record (OAuth state, email tokens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub identifier: String,
    pub value: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Verification {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

// ─── Billing Tables ──────────────────────────────────────────────

/// Billing interval of a catalog product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// Plan catalog entry. `id` is the catalog id (e.g. `performance_plan`),
/// distinct from the document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "_id", default)]
    pub doc_id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    pub currency: String,
    pub interval: BillingInterval,
    #[serde(default)]
    pub features: Vec<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_price_id: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Billing platform a subscription or event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Stripe,
    Apple,
    Google,
    Autumn,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Apple => "apple",
            Self::Google => "google",
            Self::Autumn => "autumn",
        }
    }
}

/// Canonical subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Trialing,
    Incomplete,
    IncompleteExpired,
    Unpaid,
}

impl SubscriptionStatus {
    /// Map a provider status string onto the canonical enum.
    /// Unrecognized values are treated as active.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "canceled" => Self::Canceled,
            "past_due" => Self::PastDue,
            "trialing" => Self::Trialing,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            _ => Self::Active,
        }
    }
}

/// A user's subscription on one platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub user_id: String,
    pub platform: Platform,
    pub external_id: String,
    pub product_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "ts_milliseconds")]
    pub current_period_start: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub current_period_end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autumn_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active or trialing, with a period that has not elapsed.
    pub fn grants_access_at(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) && self.current_period_end > now
    }
}

/// Audit event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentSucceeded,
    PaymentFailed,
    InvoiceCreated,
    CheckoutSessionCompleted,
    /// Provider event with no canonical mapping. Still audited.
    Unknown,
}

/// Append-only billing audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: BillingEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub external_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub data: serde_json::Value,
    pub processed: bool,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Append-only feature consumption record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub user_id: String,
    pub feature_id: String,
    pub amount: i64,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Lifecycle of a checkout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    Pending,
    Completed,
    Expired,
    Canceled,
}

/// A checkout started on one surface and finished on another, e.g. a plan
/// picked during mobile onboarding and paid for on the web.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub session_id: String,
    pub user_id: String,
    pub product_id: String,
    pub platform: String,
    pub status: CheckoutStatus,
    #[serde(default)]
    pub checkout_url: String,
    #[serde(default)]
    pub success_url: String,
    #[serde(default)]
    pub cancel_url: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ─── Cache Table ─────────────────────────────────────────────────

/// Generic key/value row backing the secondary cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(rename = "_creationTime", default)]
    pub creation_time: i64,
    pub key: String,
    pub value: String,
    #[serde(
        default,
        with = "ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entries without an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}
