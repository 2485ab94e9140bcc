//! Billing configuration and the plan → feature limit table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Plan used when a user has no subscription.
pub const FREE_PLAN: &str = "free";

/// Paid tiers, cheapest first.
pub const PLAN_TIERS: &[&str] = &["foundation_plan", "performance_plan", "champion_plan"];

/// Billing configuration (the `[billing]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingOptions {
    /// Webhook signing secret. Without one, only the signature header's
    /// presence is checked.
    pub webhook_secret: Option<String>,
    /// Maximum age of a signed webhook timestamp.
    pub signature_tolerance_secs: i64,
    /// Period length used when a provider omits `currentPeriodEnd`.
    pub default_period_days: i64,
    /// Insert the default catalog at startup when it is empty.
    pub seed_products: bool,
    pub plans: PlanLimits,
}

impl Default for BillingOptions {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            signature_tolerance_secs: 300,
            default_period_days: 30,
            seed_products: false,
            plans: PlanLimits::default(),
        }
    }
}

impl BillingOptions {
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}

/// Per-feature usage cap. Serialized as an integer, `-1` meaning unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Limit {
    Finite(i64),
    Unlimited,
}

impl Limit {
    /// Whether `used` units leave room for one more.
    pub fn permits(&self, used: i64) -> bool {
        match self {
            Self::Finite(limit) => used < *limit,
            Self::Unlimited => true,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl From<i64> for Limit {
    fn from(value: i64) -> Self {
        if value < 0 {
            Self::Unlimited
        } else {
            Self::Finite(value)
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Finite(n) => n,
            Limit::Unlimited => -1,
        }
    }
}

/// Plan id → feature id → limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanLimits(BTreeMap<String, BTreeMap<String, Limit>>);

impl PlanLimits {
    pub fn new(plans: BTreeMap<String, BTreeMap<String, Limit>>) -> Self {
        Self(plans)
    }

    /// Limit for `feature` under `plan`. Unknown plans and features get 0.
    pub fn limit(&self, plan: &str, feature: &str) -> Limit {
        self.0
            .get(plan)
            .and_then(|features| features.get(feature))
            .copied()
            .unwrap_or(Limit::Finite(0))
    }

    pub fn plans(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every feature named by any plan.
    pub fn features(&self) -> Vec<&str> {
        let mut features: Vec<&str> = self
            .0
            .values()
            .flat_map(|f| f.keys().map(String::as_str))
            .collect();
        features.sort_unstable();
        features.dedup();
        features
    }
}

impl Default for PlanLimits {
    fn default() -> Self {
        const U: i64 = -1;
        let table: [(&str, [i64; 8]); 4] = [
            (FREE_PLAN, [3, 5, 0, 0, 3, 0, 0, 1]),
            ("foundation_plan", [U, 15, U, 0, 3, 0, 0, 5]),
            ("performance_plan", [U, U, U, U, U, 0, U, U]),
            ("champion_plan", [U, U, U, U, U, U, U, U]),
        ];
        let features = [
            "workout_plans",
            "meal_scans",
            "form_guidance",
            "advanced_form_guidance",
            "progress_photos",
            "ai_coaching_sessions",
            "nutrition_coaching",
            "meal_planning",
        ];
        Self(
            table
                .into_iter()
                .map(|(plan, limits)| {
                    let row = features
                        .iter()
                        .zip(limits)
                        .map(|(feature, limit)| (feature.to_string(), Limit::from(limit)))
                        .collect();
                    (plan.to_string(), row)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_grow_with_tier() {
        let limits = PlanLimits::default();
        let tiers: Vec<&str> = std::iter::once(FREE_PLAN)
            .chain(PLAN_TIERS.iter().copied())
            .collect();
        for feature in limits.features() {
            for pair in tiers.windows(2) {
                assert!(
                    limits.limit(pair[1], feature) >= limits.limit(pair[0], feature),
                    "{feature}: {} < {}",
                    pair[1],
                    pair[0]
                );
            }
        }
    }

    #[test]
    fn test_unknown_plan_or_feature_is_zero() {
        let limits = PlanLimits::default();
        assert_eq!(limits.limit("enterprise", "meal_scans"), Limit::Finite(0));
        assert_eq!(limits.limit(FREE_PLAN, "teleport"), Limit::Finite(0));
        assert_eq!(limits.limit(FREE_PLAN, "meal_scans"), Limit::Finite(5));
    }

    #[test]
    fn test_limit_sentinel_roundtrip_through_toml() {
        let options: BillingOptions = toml::from_str(
            r#"
            webhook_secret = "whsec_x"
            [plans.free]
            meal_scans = 2
            [plans.pro]
            meal_scans = -1
            "#,
        )
        .unwrap();
        assert_eq!(options.default_period_days, 30);
        assert_eq!(options.plans.limit("pro", "meal_scans"), Limit::Unlimited);
        assert!(!options.plans.limit("free", "meal_scans").permits(2));
        assert_eq!(serde_json::to_value(Limit::Unlimited).unwrap(), serde_json::json!(-1));
    }
}
