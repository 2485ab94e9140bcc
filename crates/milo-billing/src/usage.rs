//! Feature gate and usage accounting.
//!
//! Usage is counted per calendar month (UTC): from the first day at 00:00:00
//! through the last day at 23:59:59.999, both inclusive. Subscribers are always
//! allowed; everyone else is held to their plan's limit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tracing::debug;

use milo_core::db::models::UsageEvent;
use milo_store::StoreClient;

use crate::config::{PlanLimits, FREE_PLAN};
use crate::error::{BillingError, BillingResult};
use crate::types::{BillingPeriod, BillingPeriodUsage, FeatureAccess, FeatureUsage, UsageTotal};

/// Inclusive bounds of the calendar month containing `now`.
pub fn month_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, next - Duration::milliseconds(1))
}

#[derive(Debug, Clone)]
pub struct FeatureGate {
    client: Arc<StoreClient>,
    limits: PlanLimits,
}

impl FeatureGate {
    pub fn new(client: Arc<StoreClient>, limits: PlanLimits) -> Self {
        Self { client, limits }
    }

    pub fn limits(&self) -> &PlanLimits {
        &self.limits
    }

    pub async fn check_feature_access(
        &self,
        user_id: &str,
        feature_id: &str,
    ) -> BillingResult<FeatureAccess> {
        self.check_feature_access_at(user_id, feature_id, Utc::now()).await
    }

    /// Access decision as of `now`.
    pub async fn check_feature_access_at(
        &self,
        user_id: &str,
        feature_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<FeatureAccess> {
        let subscription = self.client.subscriptions().current_for_user(user_id).await?;
        let has_subscription = subscription.as_ref().is_some_and(|s| s.grants_access_at(now));

        let (start, end) = month_window(now);
        let used: i64 = self
            .client
            .usage_events()
            .list_for_user_feature_in_window(user_id, feature_id, start, end)
            .await?
            .iter()
            .map(|e| e.amount)
            .sum();

        let plan_id = subscription.map_or_else(|| FREE_PLAN.to_string(), |s| s.product_id);
        let limit = self.limits.limit(&plan_id, feature_id);
        let allowed = has_subscription || limit.permits(used);

        debug!(user_id, feature_id, plan_id = %plan_id, used, allowed, "feature access check");
        Ok(FeatureAccess {
            allowed,
            has_subscription,
            usage: FeatureUsage {
                used,
                limit,
                reset_date: end.timestamp_millis(),
            },
            plan_id,
        })
    }

    /// Record consumption. Limits are enforced by the check, not here.
    /// `amount` defaults to 1; amounts below 1 are rejected.
    pub async fn track_feature_usage(
        &self,
        user_id: &str,
        feature_id: &str,
        amount: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> BillingResult<String> {
        self.track_feature_usage_at(user_id, feature_id, amount, metadata, Utc::now())
            .await
    }

    pub async fn track_feature_usage_at(
        &self,
        user_id: &str,
        feature_id: &str,
        amount: Option<i64>,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> BillingResult<String> {
        let amount = amount.unwrap_or(1);
        if amount < 1 {
            return Err(BillingError::InvalidAmount(amount));
        }
        let event = UsageEvent {
            id: String::new(),
            creation_time: 0,
            user_id: user_id.to_string(),
            feature_id: feature_id.to_string(),
            amount,
            timestamp: now,
            metadata,
        };
        Ok(self.client.usage_events().append(&event).await?)
    }

    /// Current-month usage per feature.
    pub async fn get_user_usage(
        &self,
        user_id: &str,
    ) -> BillingResult<BTreeMap<String, UsageTotal>> {
        let (start, end) = month_window(Utc::now());
        let events = self
            .client
            .usage_events()
            .list_for_user_in_window(user_id, start, end)
            .await?;

        let reset_date = end.timestamp_millis();
        let mut totals: BTreeMap<String, UsageTotal> = BTreeMap::new();
        for event in events {
            totals
                .entry(event.feature_id)
                .or_insert(UsageTotal { used: 0, reset_date })
                .used += event.amount;
        }
        Ok(totals)
    }

    /// Per-feature usage inside the active subscription's current period, or
    /// `None` without an active subscription.
    pub async fn billing_period_usage(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<BillingPeriodUsage>> {
        let Some(subscription) = self.client.subscriptions().active_for_user(user_id).await? else {
            return Ok(None);
        };
        let events = self
            .client
            .usage_events()
            .list_for_user_in_window(
                user_id,
                subscription.current_period_start,
                subscription.current_period_end,
            )
            .await?;

        let mut usage = BTreeMap::new();
        for event in events {
            *usage.entry(event.feature_id).or_insert(0) += event.amount;
        }
        Ok(Some(BillingPeriodUsage {
            billing_period: BillingPeriod {
                start: subscription.current_period_start.timestamp_millis(),
                end: subscription.current_period_end.timestamp_millis(),
            },
            subscription,
            usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limit;

    #[test]
    fn test_month_window_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 2, 14, 9, 30, 0).unwrap();
        let (start, end) = month_window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, last_instant(2024, 2, 29));

        let (_, end) = month_window(Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap());
        assert_eq!(end, last_instant(2023, 12, 31));
    }

    fn last_instant(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 23, 59, 59).unwrap() + Duration::milliseconds(999)
    }

    fn gate_with(limits: PlanLimits) -> FeatureGate {
        FeatureGate::new(Arc::new(StoreClient::memory()), limits)
    }

    #[tokio::test]
    async fn test_usage_at_window_edges() {
        let gate = gate_with(PlanLimits::default());
        let (start, end) = month_window(Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap());

        let edge = Duration::milliseconds(1);
        for at in [start - edge, start, end, end + edge] {
            gate.track_feature_usage_at("u1", "meal_scans", None, None, at).await.unwrap();
        }

        let june = gate.check_feature_access_at("u1", "meal_scans", end).await.unwrap();
        assert_eq!(june.usage.used, 2);
        assert_eq!(june.usage.reset_date, end.timestamp_millis());

        let july = gate
            .check_feature_access_at("u1", "meal_scans", end + edge)
            .await
            .unwrap();
        assert_eq!(july.usage.used, 1);
    }

    #[tokio::test]
    async fn test_unlimited_plan_allows_without_subscription() {
        let mut free = BTreeMap::new();
        free.insert("meal_scans".to_string(), Limit::Unlimited);
        let mut plans = BTreeMap::new();
        plans.insert(FREE_PLAN.to_string(), free);
        let gate = gate_with(PlanLimits::new(plans));

        gate.track_feature_usage("u1", "meal_scans", Some(1_000), None).await.unwrap();
        let access = gate.check_feature_access("u1", "meal_scans").await.unwrap();
        assert!(access.allowed);
        assert!(!access.has_subscription);
        assert!(access.usage.limit.is_unlimited());
        assert_eq!(access.usage.used, 1_000);
    }

    #[tokio::test]
    async fn test_non_positive_amount_is_rejected() {
        let gate = gate_with(PlanLimits::default());
        for amount in [0, -3] {
            let err = gate
                .track_feature_usage("u1", "meal_scans", Some(amount), None)
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidAmount(a) if a == amount));
        }
        assert!(gate.get_user_usage("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_usage_grouped_by_feature() {
        let gate = gate_with(PlanLimits::default());
        gate.track_feature_usage("u1", "meal_scans", None, None).await.unwrap();
        gate.track_feature_usage("u1", "meal_scans", Some(2), None).await.unwrap();
        gate.track_feature_usage("u1", "workout_plans", None, None).await.unwrap();
        gate.track_feature_usage("u2", "meal_scans", None, None).await.unwrap();

        let usage = gate.get_user_usage("u1").await.unwrap();
        assert_eq!(usage["meal_scans"].used, 3);
        assert_eq!(usage["workout_plans"].used, 1);
        assert_eq!(usage.len(), 2);
        assert!(gate.billing_period_usage("u1").await.unwrap().is_none());
    }
}
