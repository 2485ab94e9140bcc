//! Onboarding flags and the pending plan handoff.
//!
//! A plan picked during mobile onboarding is parked as a pending
//! `checkout_sessions` row on the `mobile_to_web` platform so the web
//! checkout can pick it up. It lapses after thirty minutes and is marked
//! completed once the checkout clears it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use milo_core::db::models::{CheckoutSession, CheckoutStatus};
use milo_store::client::OnboardingStatus;
use milo_store::StoreClient;

use crate::error::BillingResult;

/// Platform tag of pending plan rows.
pub const PENDING_PLAN_PLATFORM: &str = "mobile_to_web";

/// Billing cadence recorded when none is given.
pub const DEFAULT_PLAN_BILLING: &str = "monthly";

const PENDING_PLAN_TTL_MINUTES: i64 = 30;

/// A plan waiting for web checkout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPlan {
    pub plan_id: String,
    pub billing: String,
    pub session_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OnboardingService {
    client: Arc<StoreClient>,
}

impl OnboardingService {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    /// `None` when the user does not exist.
    pub async fn onboarding_status(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<OnboardingStatus>> {
        Ok(self.client.users().onboarding_status(user_id).await?)
    }

    pub async fn complete_onboarding(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<OnboardingStatus>> {
        let users = self.client.users();
        if users.get_by_id(user_id).await?.is_none() {
            return Ok(None);
        }
        let user = users.complete_onboarding(user_id, Utc::now()).await?;
        info!(user_id, "onboarding completed");
        Ok(Some(OnboardingStatus::of(&user)))
    }

    pub async fn activate_trial(&self, user_id: &str) -> BillingResult<Option<OnboardingStatus>> {
        let users = self.client.users();
        if users.get_by_id(user_id).await?.is_none() {
            return Ok(None);
        }
        let user = users.activate_trial(user_id, Utc::now()).await?;
        info!(user_id, "trial activated");
        Ok(Some(OnboardingStatus::of(&user)))
    }

    /// Park `plan_id` for the web checkout. Returns the pending session id.
    pub async fn store_pending_plan(
        &self,
        user_id: &str,
        plan_id: &str,
        billing: Option<&str>,
    ) -> BillingResult<String> {
        self.store_pending_plan_at(user_id, plan_id, billing, Utc::now()).await
    }

    pub async fn store_pending_plan_at(
        &self,
        user_id: &str,
        plan_id: &str,
        billing: Option<&str>,
        now: DateTime<Utc>,
    ) -> BillingResult<String> {
        let billing = billing.unwrap_or(DEFAULT_PLAN_BILLING);
        let session_id = format!("pending_{user_id}_{}", now.timestamp_millis());
        let session = CheckoutSession {
            id: String::new(),
            creation_time: 0,
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            product_id: plan_id.to_string(),
            platform: PENDING_PLAN_PLATFORM.to_string(),
            status: CheckoutStatus::Pending,
            checkout_url: String::new(),
            success_url: String::new(),
            cancel_url: String::new(),
            expires_at: now + Duration::minutes(PENDING_PLAN_TTL_MINUTES),
            metadata: Some(json!({
                "billing": billing,
                "fromMobile": true,
                "createdForOnboarding": true,
            })),
            created_at: now,
            updated_at: now,
        };
        self.client.checkout_sessions().create(&session).await?;
        info!(user_id, plan_id, billing, "pending plan stored");
        Ok(session_id)
    }

    /// Newest pending plan that has not lapsed.
    pub async fn get_pending_plan(&self, user_id: &str) -> BillingResult<Option<PendingPlan>> {
        self.get_pending_plan_at(user_id, Utc::now()).await
    }

    pub async fn get_pending_plan_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<PendingPlan>> {
        let pending = self
            .client
            .checkout_sessions()
            .list_for_user(user_id, PENDING_PLAN_PLATFORM, CheckoutStatus::Pending)
            .await?;
        Ok(pending
            .into_iter()
            .find(|session| !session.is_expired(now))
            .map(|session| PendingPlan {
                billing: session
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("billing"))
                    .and_then(|b| b.as_str())
                    .unwrap_or(DEFAULT_PLAN_BILLING)
                    .to_string(),
                plan_id: session.product_id,
                session_id: session.session_id,
                expires_at: session.expires_at,
            }))
    }

    /// Mark the user's pending session completed. Unknown ids and sessions
    /// owned by someone else are left alone; returns whether a row changed.
    pub async fn clear_pending_plan(&self, user_id: &str, session_id: &str) -> BillingResult<bool> {
        let checkouts = self.client.checkout_sessions();
        let Some(session) = checkouts.get_by_session_id(session_id).await? else {
            debug!(session_id, "no pending plan to clear");
            return Ok(false);
        };
        if session.user_id != user_id {
            debug!(session_id, user_id, "pending plan belongs to another user");
            return Ok(false);
        }
        checkouts
            .set_status(&session.id, CheckoutStatus::Completed, Utc::now())
            .await?;
        Ok(true)
    }
}
