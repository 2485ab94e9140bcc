//! Billing for milo: subscription reconciliation, the plan catalog, provider
//! webhooks and the usage-metered feature gate.
//!
//! - [`BillingService`]: `fulfill_payment`, `cancel_subscription`,
//!   `update_subscription`, `get_user_subscription`, `billing_history`
//! - [`ProductCatalog`]: `upsert_product`, `list_products`, `seed_default_products`
//! - [`WebhookProcessor`]: signature check, audit, dispatch
//! - [`FeatureGate`]: `check_feature_access`, `track_feature_usage`, `get_user_usage`
//! - [`OnboardingService`]: onboarding and trial flags, pending plan handoff

pub mod catalog;
pub mod config;
pub mod error;
pub mod onboarding;
pub mod reconcile;
pub mod types;
pub mod usage;
pub mod webhook;

pub use catalog::ProductCatalog;
pub use config::{BillingOptions, Limit, PlanLimits, FREE_PLAN, PLAN_TIERS};
pub use error::{BillingError, BillingResult};
pub use onboarding::{OnboardingService, PendingPlan};
pub use reconcile::BillingService;
pub use types::*;
pub use usage::{month_window, FeatureGate};
pub use webhook::{verify_signature, WebhookProcessor, SIGNATURE_HEADER};
