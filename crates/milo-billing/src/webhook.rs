//! Payment provider webhooks: signature verification, event dispatch and the
//! audit trail.
//!
//! Every well-formed delivery is audited in `billingEvents`, keyed by
//! (platform, event id); a redelivery of an already processed event is
//! acknowledged without running its handler again. Unrecognized event types
//! are audited and otherwise ignored.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use milo_core::db::models::{BillingEvent, BillingEventType, Platform, SubscriptionStatus};
use milo_core::utils::from_millis;

use crate::error::{BillingError, BillingResult};
use crate::reconcile::BillingService;
use crate::types::{
    FulfillmentRequest, SubscriptionInput, SubscriptionUpsert, WebhookEvent, WebhookReceipt,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify a `t=<unix secs>,v1=<hex hmac>` signature over `"{t}.{payload}"`.
///
/// Several `v1` entries may be present; any match is accepted.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> BillingResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::InvalidSignature)?;
    let issued_at: i64 = timestamp.parse().map_err(|_| BillingError::InvalidSignature)?;
    if (now.timestamp() - issued_at).abs() > tolerance_secs {
        return Err(BillingError::StaleSignature);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())))
    {
        Ok(())
    } else {
        Err(BillingError::InvalidSignature)
    }
}

/// Canonical audit type for a provider event type.
pub fn map_event_type(event_type: &str) -> BillingEventType {
    match event_type {
        "checkout.session.completed" => BillingEventType::CheckoutSessionCompleted,
        "customer.subscription.created" => BillingEventType::SubscriptionCreated,
        "customer.subscription.updated" => BillingEventType::SubscriptionUpdated,
        "customer.subscription.deleted" => BillingEventType::SubscriptionCanceled,
        "invoice.payment_succeeded" | "invoice.paid" => BillingEventType::PaymentSucceeded,
        "invoice.payment_failed" => BillingEventType::PaymentFailed,
        "invoice.created" => BillingEventType::InvoiceCreated,
        _ => BillingEventType::Unknown,
    }
}

#[derive(Debug, Clone)]
pub struct WebhookProcessor {
    billing: BillingService,
}

impl WebhookProcessor {
    pub fn new(billing: BillingService) -> Self {
        Self { billing }
    }

    /// Verify, audit and dispatch one delivery.
    pub async fn process(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookReceipt> {
        let signature = signature
            .filter(|s| !s.is_empty())
            .ok_or(BillingError::MissingSignature)?;
        let options = self.billing.options();
        if let Some(secret) = options.webhook_secret.as_deref() {
            let tolerance = options.signature_tolerance_secs;
            verify_signature(payload, signature, secret, tolerance, Utc::now())?;
        }

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedEvent(e.to_string()))?;
        let object = &event.data.object;
        let kind = map_event_type(&event.event_type);

        let audit = BillingEvent {
            id: String::new(),
            creation_time: 0,
            user_id: str_field(object, "customer").unwrap_or("unknown").to_string(),
            kind,
            subscription_id: None,
            external_id: event.id.clone(),
            platform: Platform::Stripe,
            data: object.clone(),
            processed: false,
            created_at: Utc::now(),
        };
        let events = self.billing.client().billing_events();
        let recorded = events.append_once(&audit).await?;
        if !recorded.created && recorded.record.processed {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "duplicate webhook delivery"
            );
            return Ok(WebhookReceipt {
                event_id: event.id,
                event_type: event.event_type,
                handled: kind != BillingEventType::Unknown,
                duplicate: true,
            });
        }

        let handled = self.dispatch(&event).await?;
        events.mark_processed(&recorded.record.id).await?;

        Ok(WebhookReceipt {
            event_id: event.id,
            event_type: event.event_type,
            handled,
            duplicate: false,
        })
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<bool> {
        let object = &event.data.object;
        match event.event_type.as_str() {
            "checkout.session.completed" => self.on_checkout_completed(object).await?,
            "customer.subscription.created" | "customer.subscription.updated" => {
                let update = subscription_update(object, None)?;
                self.billing.update_subscription(update).await?;
            }
            "customer.subscription.deleted" => {
                let update = subscription_update(object, Some(Utc::now()))?;
                self.billing.update_subscription(update).await?;
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                info!(invoice = str_field(object, "id").unwrap_or_default(), "payment succeeded");
            }
            "invoice.payment_failed" => {
                warn!(invoice = str_field(object, "id").unwrap_or_default(), "payment failed");
            }
            "invoice.created" => {
                debug!(invoice = str_field(object, "id").unwrap_or_default(), "invoice created");
            }
            other => {
                info!(event_type = other, "unhandled webhook event type");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A checkout carrying `metadata.userId` and `metadata.planId` is fulfilled
    /// directly; others only update their audit row.
    async fn on_checkout_completed(&self, session: &Value) -> BillingResult<()> {
        let metadata = session.get("metadata");
        let user_id = metadata.and_then(|m| str_field(m, "userId"));
        let plan_id = metadata.and_then(|m| str_field(m, "planId"));
        let (Some(user_id), Some(plan_id)) = (user_id, plan_id) else {
            let session_id = str_field(session, "id").unwrap_or_default();
            debug!(session = session_id, "checkout without plan metadata");
            return Ok(());
        };

        let customer = str_field(session, "customer")
            .or_else(|| str_field(session, "id"))
            .unwrap_or_default();
        let outcome = self
            .billing
            .fulfill_payment(FulfillmentRequest {
                user_id: user_id.to_string(),
                product_id: plan_id.to_string(),
                external_customer_id: customer.to_string(),
                subscription: SubscriptionInput::active(),
            })
            .await?;
        if !outcome.success {
            warn!(user_id, plan_id, error = ?outcome.error, "checkout fulfillment failed");
        }
        Ok(())
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// Provider timestamps are unix seconds. Absent, null and non-positive values
/// read as unset; values outside the representable range are malformed.
fn secs_field(value: &Value, field: &str) -> BillingResult<Option<DateTime<Utc>>> {
    let Some(raw) = value.get(field).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let out_of_range =
        || BillingError::MalformedEvent(format!("{field} is not a valid timestamp"));
    let secs = raw.as_i64().ok_or_else(out_of_range)?;
    if secs <= 0 {
        return Ok(None);
    }
    secs.checked_mul(1000)
        .and_then(from_millis)
        .map(Some)
        .ok_or_else(out_of_range)
}

/// Canonical upsert from a provider subscription object. `deleted_at` marks
/// a deletion event.
fn subscription_update(
    object: &Value,
    deleted_at: Option<DateTime<Utc>>,
) -> BillingResult<SubscriptionUpsert> {
    let now = Utc::now();
    let product_id = object
        .pointer("/items/data/0/price/product")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let user_id = object
        .pointer("/metadata/userId")
        .and_then(Value::as_str)
        .or_else(|| str_field(object, "customer"))
        .unwrap_or("unknown");
    let status = match deleted_at {
        Some(_) => SubscriptionStatus::Canceled,
        None => SubscriptionStatus::from_provider(str_field(object, "status").unwrap_or_default()),
    };

    Ok(SubscriptionUpsert {
        user_id: user_id.to_string(),
        platform: Platform::Stripe,
        external_id: str_field(object, "id").unwrap_or_default().to_string(),
        product_id: product_id.to_string(),
        status,
        current_period_start: secs_field(object, "current_period_start")?.unwrap_or(now),
        current_period_end: secs_field(object, "current_period_end")?.unwrap_or(now),
        cancel_at_period_end: match deleted_at {
            Some(_) => Some(true),
            None => object.get("cancel_at_period_end").and_then(Value::as_bool),
        },
        canceled_at: match deleted_at {
            Some(at) => Some(at),
            None => secs_field(object, "canceled_at")?,
        },
        trial_start: secs_field(object, "trial_start")?,
        trial_end: secs_field(object, "trial_end")?,
        metadata: object.get("metadata").filter(|m| !m.is_null()).cloned(),
    })
}
