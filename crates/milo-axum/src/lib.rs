//! Axum HTTP boundary for the milo backend.
//!
//! [`Milo`] wires the store client into every component and builds the
//! router:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /api/billing/webhook` | provider webhook ingestion |
//! | `POST /api/billing/fulfill` | reconcile a completed checkout |
//! | `POST /api/billing/cancel` | cancel the active subscription |
//! | `GET /api/billing/subscription/{user_id}` | subscription summary |
//! | `GET /api/billing/history/{user_id}` | latest billing events |
//! | `GET /api/billing/products` | active plan catalog |
//! | `POST /api/features/check` | feature gate decision |
//! | `POST /api/features/track` | record feature usage |
//! | `GET /api/features/usage/{user_id}` | current-month usage |
//! | `GET /api/auth/get-session` | role-augmented session |
//! | `GET /api/onboarding/status` | caller's onboarding and trial flags |
//! | `POST /api/onboarding/complete` | mark onboarding done |
//! | `POST /api/onboarding/trial` | mark the trial activated |
//! | `GET, POST /api/onboarding/pending-plan` | read or park a plan for web checkout |
//! | `POST /api/onboarding/pending-plan/clear` | mark a pending plan completed |
//! | `GET /api/admin/stats` | user counts (admins only) |
//! | `GET /api/admin/users/recent` | newest users (admins only) |
//! | `GET /api/cache/metrics` | cache stats (admins only) |
//! | `GET /api/health` | liveness |
//!
//! Fulfill, cancel and track act on the `userId` in their body and require a
//! session belonging to that user (by id or email) or to an admin. The
//! onboarding routes always act on the caller.

pub mod config;

pub use config::{ListenOptions, ServerConfig};

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use milo_auth::{CacheStore, DocumentAuthAdapter, RoleAugmenter, SessionWithUser, UserDirectory};
use milo_billing::{
    BillingError, BillingService, FeatureGate, FulfillmentRequest, OnboardingService,
    ProductCatalog, SubscriptionInput, WebhookProcessor, SIGNATURE_HEADER,
};
use milo_core::db::models::{BillingInterval, ADMIN_ROLE};
use milo_core::error::{ApiError, ErrorCode, MiloError};
use milo_store::{StoreClient, StoreError};

/// Cookie carrying the session token when no bearer header is sent.
pub const SESSION_COOKIE: &str = "milo.session_token";

// ─── Error Handling ──────────────────────────────────────────────

/// An [`ApiError`] rendered as a JSON response.
#[derive(Debug)]
pub struct HttpError(pub ApiError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (status_of(&self.0), Json(self.0.to_json())).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl From<MiloError> for HttpError {
    fn from(err: MiloError) -> Self {
        error!(error = %err, "request failed");
        Self(ApiError::internal())
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        MiloError::from(err).into()
    }
}

/// Outside the webhook route, billing failures are internal errors.
impl From<BillingError> for HttpError {
    fn from(err: BillingError) -> Self {
        if err.is_client_error() {
            return Self(err.into());
        }
        error!(error = %err, "billing operation failed");
        Self(ApiError::internal())
    }
}

fn status_of(err: &ApiError) -> StatusCode {
    StatusCode::from_u16(err.status.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

// ─── Cookie / Token Extraction ───────────────────────────────────

/// Session token from `Authorization: Bearer`, else from the session cookie
/// (plain or `__Secure-` prefixed).
fn extract_session_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ").map(str::trim) {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let cookies = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    let secure_name = format!("__Secure-{cookie_name}");
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        let name = name.trim();
        (name == cookie_name || name == secure_name).then(|| value.to_string())
    })
}

// ─── Milo Builder ────────────────────────────────────────────────

/// Shared handler state. Every component holds the same store client.
#[derive(Debug, Clone)]
pub struct AppState {
    pub adapter: DocumentAuthAdapter,
    pub augmenter: RoleAugmenter,
    pub cache: CacheStore,
    pub billing: BillingService,
    pub catalog: ProductCatalog,
    pub gate: FeatureGate,
    pub webhooks: WebhookProcessor,
    pub onboarding: OnboardingService,
    pub directory: UserDirectory,
}

impl AppState {
    pub fn new(client: Arc<StoreClient>, config: &ServerConfig) -> Self {
        let billing = BillingService::new(client.clone(), config.billing.clone());
        Self {
            adapter: DocumentAuthAdapter::new(client.clone(), config.auth.clone()),
            augmenter: RoleAugmenter::from_store(client.clone()),
            cache: CacheStore::new(client.clone()),
            catalog: ProductCatalog::new(client.clone()),
            gate: FeatureGate::new(client.clone(), config.billing.plans.clone()),
            onboarding: OnboardingService::new(client.clone()),
            directory: UserDirectory::new(client),
            webhooks: WebhookProcessor::new(billing.clone()),
            billing,
        }
    }
}

/// Entry point: builds the router over an explicitly passed store client.
///
/// ```rust,ignore
/// let client = Arc::new(StoreClient::connect(&config.store).await?);
/// let app = Milo::new(client, &config).router_with_cors();
/// axum::serve(listener, app).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Milo {
    state: Arc<AppState>,
}

impl Milo {
    pub fn new(client: Arc<StoreClient>, config: &ServerConfig) -> Self {
        Self {
            state: Arc::new(AppState::new(client, config)),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// All routes, with request tracing.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(handle_health))
            // Billing
            .route("/api/billing/webhook", post(handle_webhook))
            .route("/api/billing/fulfill", post(handle_fulfill))
            .route("/api/billing/cancel", post(handle_cancel))
            .route("/api/billing/subscription/{user_id}", get(handle_subscription))
            .route("/api/billing/history/{user_id}", get(handle_history))
            .route("/api/billing/products", get(handle_products))
            // Feature gate
            .route("/api/features/check", post(handle_feature_check))
            .route("/api/features/track", post(handle_feature_track))
            .route("/api/features/usage/{user_id}", get(handle_feature_usage))
            // Auth
            .route("/api/auth/get-session", get(handle_get_session))
            // Onboarding
            .route("/api/onboarding/status", get(handle_onboarding_status))
            .route("/api/onboarding/complete", post(handle_complete_onboarding))
            .route("/api/onboarding/trial", post(handle_activate_trial))
            .route(
                "/api/onboarding/pending-plan",
                get(handle_get_pending_plan).post(handle_store_pending_plan),
            )
            .route("/api/onboarding/pending-plan/clear", post(handle_clear_pending_plan))
            // Admin
            .route("/api/admin/stats", get(handle_admin_stats))
            .route("/api/admin/users/recent", get(handle_recent_users))
            // Cache
            .route("/api/cache/metrics", get(handle_cache_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// [`Milo::router`] with permissive CORS.
    pub fn router_with_cors(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        self.router().layer(cors)
    }

    /// Periodically delete expired sessions, verifications and cache entries.
    pub fn spawn_expiry_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match state.adapter.sweep_expired(Utc::now()).await {
                    Ok(report) => info!(
                        sessions = report.sessions,
                        verifications = report.verifications,
                        "expired auth rows swept"
                    ),
                    Err(e) => warn!(error = %e, "auth expiry sweep failed"),
                }
                match state.cache.cleanup_expired().await {
                    Ok(removed) => info!(removed, "expired cache entries swept"),
                    Err(e) => warn!(error = %e, "cache sweep failed"),
                }
            }
        })
    }
}

// ─── Request Types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FulfillBody {
    checkout_session_id: String,
    user_id: String,
    internal_plan_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FulfillReply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    billing_cycle: Option<BillingInterval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    user_id: String,
    #[serde(default)]
    cancel_at_period_end: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureCheckBody {
    user_id: String,
    feature_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureTrackBody {
    user_id: String,
    feature_id: String,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingPlanBody {
    plan_id: String,
    #[serde(default)]
    billing: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearPendingPlanBody {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct RecentUsersParams {
    #[serde(default)]
    limit: Option<usize>,
}

// ─── Route Handlers ─────────────────────────────────────────────

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Replies in plain text: `200` once processed (unrecognized types
/// included), `400` for signature faults, `500` otherwise so the provider
/// redelivers.
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    match state.webhooks.process(&body, signature).await {
        Ok(receipt) => {
            info!(
                event_id = %receipt.event_id,
                event_type = %receipt.event_type,
                handled = receipt.handled,
                duplicate = receipt.duplicate,
                "webhook processed"
            );
            (StatusCode::OK, "Webhook processed").into_response()
        }
        Err(err) => {
            if err.is_client_error() {
                warn!(error = %err, "webhook rejected");
            } else {
                error!(error = %err, "webhook processing failed");
            }
            let api = ApiError::from(err);
            (status_of(&api), api.message).into_response()
        }
    }
}

/// Business failures come back as `{success: false, error}` with `200`;
/// store failures as the same shape with `500`.
async fn handle_fulfill(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FulfillBody>,
) -> Response {
    if let Err(err) = require_owner(&state, &headers, &body.user_id).await {
        return err.into_response();
    }
    let request = FulfillmentRequest {
        user_id: body.user_id,
        product_id: body.internal_plan_id,
        external_customer_id: body.checkout_session_id,
        subscription: SubscriptionInput::active(),
    };
    match state.billing.fulfill_payment(request).await {
        Ok(outcome) => Json(FulfillReply {
            success: outcome.success,
            plan_id: outcome.product_id,
            billing_cycle: outcome.billing_cycle,
            error: outcome.error,
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "payment fulfillment failed");
            let reply = FulfillReply {
                success: false,
                plan_id: None,
                billing_cycle: None,
                error: Some(ErrorCode::InternalServerError.to_string()),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(reply)).into_response()
        }
    }
}

async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> Result<impl IntoResponse, HttpError> {
    require_owner(&state, &headers, &body.user_id).await?;
    let outcome = state
        .billing
        .cancel_subscription(&body.user_id, body.cancel_at_period_end)
        .await?;
    Ok(Json(outcome))
}

async fn handle_subscription(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(state.billing.get_user_subscription(&user_id).await?))
}

async fn handle_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(state.billing.billing_history(&user_id).await?))
}

async fn handle_products(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(state.catalog.list_products().await?))
}

async fn handle_feature_check(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FeatureCheckBody>,
) -> Result<impl IntoResponse, HttpError> {
    let access = state
        .gate
        .check_feature_access(&body.user_id, &body.feature_id)
        .await?;
    Ok(Json(access))
}

async fn handle_feature_track(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FeatureTrackBody>,
) -> Result<impl IntoResponse, HttpError> {
    require_owner(&state, &headers, &body.user_id).await?;
    let event_id = state
        .gate
        .track_feature_usage(&body.user_id, &body.feature_id, body.amount, body.metadata)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "eventId": event_id })))
}

async fn handle_feature_usage(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(state.gate.get_user_usage(&user_id).await?))
}

/// Resolve the caller's session and apply role precedence.
async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SessionWithUser, HttpError> {
    let token = extract_session_token(headers, SESSION_COOKIE)
        .ok_or_else(|| ApiError::unauthorized(ErrorCode::Unauthorized))?;
    let session = state
        .adapter
        .get_session(&token)
        .await?
        .ok_or_else(|| ApiError::unauthorized(ErrorCode::SessionNotFound))?;
    Ok(state.augmenter.augment(session).await)
}

fn is_admin(session: &SessionWithUser) -> bool {
    session.user.role.as_deref() == Some(ADMIN_ROLE)
}

/// The caller must be `user_id` (matched by id or email) or an admin.
async fn require_owner(
    state: &AppState,
    headers: &HeaderMap,
    user_id: &str,
) -> Result<SessionWithUser, HttpError> {
    let session = require_session(state, headers).await?;
    let own = session.user.id == user_id || session.user.email == user_id;
    if !own && !is_admin(&session) {
        warn!(caller = %session.user.id, target = user_id, "cross-user request refused");
        return Err(ApiError::forbidden().into());
    }
    Ok(session)
}

async fn handle_get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    Ok(Json(require_session(&state, &headers).await?))
}

async fn handle_onboarding_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.onboarding.onboarding_status(&session.user.id).await?))
}

async fn handle_complete_onboarding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.onboarding.complete_onboarding(&session.user.id).await?))
}

async fn handle_activate_trial(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.onboarding.activate_trial(&session.user.id).await?))
}

async fn handle_store_pending_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PendingPlanBody>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    let session_id = state
        .onboarding
        .store_pending_plan(&session.user.id, &body.plan_id, body.billing.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "sessionId": session_id })))
}

async fn handle_get_pending_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    Ok(Json(state.onboarding.get_pending_plan(&session.user.id).await?))
}

/// Always reports success; clearing someone else's session is a no-op.
async fn handle_clear_pending_plan(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ClearPendingPlanBody>,
) -> Result<impl IntoResponse, HttpError> {
    let session = require_session(&state, &headers).await?;
    state
        .onboarding
        .clear_pending_plan(&session.user.id, &body.session_id)
        .await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), HttpError> {
    let session = require_session(state, headers).await?;
    if !is_admin(&session) {
        return Err(ApiError::forbidden().into());
    }
    Ok(())
}

async fn handle_admin_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    require_admin(&state, &headers).await?;
    Ok(Json(state.directory.admin_stats(Utc::now()).await?))
}

async fn handle_recent_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RecentUsersParams>,
) -> Result<impl IntoResponse, HttpError> {
    require_admin(&state, &headers).await?;
    Ok(Json(state.directory.recent_users(params.limit).await?))
}

async fn handle_cache_metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    require_admin(&state, &headers).await?;
    Ok(Json(state.cache.stats().await?))
}

// ─── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_session_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok_123".parse().unwrap());
        headers.insert("cookie", "milo.session_token=from_cookie".parse().unwrap());
        let token = extract_session_token(&headers, SESSION_COOKIE);
        assert_eq!(token.as_deref(), Some("tok_123"));
    }

    #[test]
    fn test_extract_session_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            "theme=dark; __Secure-milo.session_token=abc123; other=1".parse().unwrap(),
        );
        let token = extract_session_token(&headers, SESSION_COOKIE);
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_extract_session_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_session_token(&headers, SESSION_COOKIE), None);

        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert_eq!(extract_session_token(&headers, SESSION_COOKIE), None);
    }

    #[test]
    fn test_internal_errors_hide_detail() {
        let HttpError(api) = HttpError::from(MiloError::Database("connection reset".into()));
        assert_eq!(api.code, ErrorCode::InternalServerError);
        assert!(!api.message.contains("connection"));

        let HttpError(api) = HttpError::from(BillingError::MissingSignature);
        assert_eq!(status_of(&api), StatusCode::BAD_REQUEST);
    }
}
