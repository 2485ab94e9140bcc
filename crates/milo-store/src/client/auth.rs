// Users, sessions, accounts and verifications.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use milo_core::db::models::{Account, Session, User, Verification};

use super::{fields, Handle, Upserted};
use crate::document::{Document, DocumentStore, IndexQuery, Order};
use crate::error::StoreResult;
use crate::schema::{Table, BY_CREATION_TIME};

// ─── Users ───────────────────────────────────────────────────────

/// Trial and onboarding flags for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingStatus {
    pub has_completed_onboarding: bool,
    pub has_activated_trial: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub trial_activated_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub onboarding_completed_at: Option<DateTime<Utc>>,
    pub is_new_user: bool,
}

impl OnboardingStatus {
    pub fn of(user: &User) -> Self {
        let completed = user.has_completed_onboarding.unwrap_or(false);
        let trial = user.has_activated_trial.unwrap_or(false);
        Self {
            has_completed_onboarding: completed,
            has_activated_trial: trial,
            trial_activated_at: user.trial_activated_at,
            onboarding_completed_at: user.onboarding_completed_at,
            is_new_user: !completed && !trial,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Users<'a>(Handle<'a>);

impl<'a> Users<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Users))
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        self.0.get(id).await
    }

    pub async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.0.first(IndexQuery::new("by_email").eq("email", email)).await
    }

    /// Insert the user unless one with the same email exists; in that case
    /// the existing user is returned untouched.
    pub async fn create_or_get(&self, user: &User) -> StoreResult<Upserted<User>> {
        self.0.insert_if_absent("by_email", user).await
    }

    /// Patch arbitrary fields. `updatedAt` is always stamped.
    pub async fn update(
        &self,
        id: &str,
        mut patch: Document,
        now: DateTime<Utc>,
    ) -> StoreResult<User> {
        patch.insert("updatedAt".into(), json!(now.timestamp_millis()));
        self.0.patch(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.0.delete(id).await
    }

    pub async fn count(&self) -> StoreResult<usize> {
        self.0.count(IndexQuery::new(BY_CREATION_TIME)).await
    }

    pub async fn list_all(&self) -> StoreResult<Vec<User>> {
        self.0.all(IndexQuery::new(BY_CREATION_TIME)).await
    }

    pub async fn count_by_role(&self, role: &str) -> StoreResult<usize> {
        self.0.count(IndexQuery::new("by_role").eq("role", role)).await
    }

    /// Users with `createdAt >= since`.
    pub async fn count_created_since(&self, since: DateTime<Utc>) -> StoreResult<usize> {
        self.0
            .count(IndexQuery::new("by_created_at").gte("createdAt", since.timestamp_millis()))
            .await
    }

    /// The `limit` most recently created users, newest first.
    pub async fn recent(&self, limit: usize) -> StoreResult<Vec<User>> {
        self.0
            .all(
                IndexQuery::new("by_created_at")
                    .order(Order::Desc)
                    .limit(limit),
            )
            .await
    }

    pub async fn complete_onboarding(&self, id: &str, now: DateTime<Utc>) -> StoreResult<User> {
        let ms = now.timestamp_millis();
        self.0
            .patch(
                id,
                fields([
                    ("hasCompletedOnboarding", json!(true)),
                    ("onboardingCompletedAt", json!(ms)),
                    ("updatedAt", json!(ms)),
                ]),
            )
            .await
    }

    pub async fn activate_trial(&self, id: &str, now: DateTime<Utc>) -> StoreResult<User> {
        let ms = now.timestamp_millis();
        self.0
            .patch(
                id,
                fields([
                    ("hasActivatedTrial", json!(true)),
                    ("trialActivatedAt", json!(ms)),
                    ("updatedAt", json!(ms)),
                ]),
            )
            .await
    }

    /// Mark onboarding done and stamp the subscription activation time.
    pub async fn activate_subscription(&self, id: &str, now: DateTime<Utc>) -> StoreResult<User> {
        let ms = now.timestamp_millis();
        self.0
            .patch(
                id,
                fields([
                    ("hasCompletedOnboarding", json!(true)),
                    ("subscriptionActivatedAt", json!(ms)),
                    ("updatedAt", json!(ms)),
                ]),
            )
            .await
    }

    pub async fn onboarding_status(&self, id: &str) -> StoreResult<Option<OnboardingStatus>> {
        Ok(self.get_by_id(id).await?.as_ref().map(OnboardingStatus::of))
    }
}

// ─── Sessions ────────────────────────────────────────────────────

/// Session counts at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Sessions<'a>(Handle<'a>);

impl<'a> Sessions<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Sessions))
    }

    /// Raw lookup; expiry is the caller's concern.
    pub async fn get_by_token(&self, token: &str) -> StoreResult<Option<Session>> {
        self.0.first(IndexQuery::new("by_token").eq("token", token)).await
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<Session>> {
        self.0.get(id).await
    }

    pub async fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Session>> {
        self.0.all(IndexQuery::new("by_user_id").eq("userId", user_id)).await
    }

    pub async fn create(&self, session: &Session) -> StoreResult<Session> {
        self.0.insert(session).await
    }

    pub async fn update(
        &self,
        id: &str,
        mut patch: Document,
        now: DateTime<Utc>,
    ) -> StoreResult<Session> {
        patch.insert("updatedAt".into(), json!(now.timestamp_millis()));
        self.0.patch(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.0.delete(id).await
    }

    pub async fn remove_by_token(&self, token: &str) -> StoreResult<bool> {
        self.0
            .delete_matching(IndexQuery::new("by_token").eq("token", token))
            .await
            .map(|n| n > 0)
    }

    pub async fn remove_by_user(&self, user_id: &str) -> StoreResult<usize> {
        self.0
            .delete_matching(IndexQuery::new("by_user_id").eq("userId", user_id))
            .await
    }

    /// Delete sessions whose expiry is before `now`.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.0.delete_matching(expired_before(now)).await
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> StoreResult<SessionStats> {
        let all: Vec<Session> = self.0.all(IndexQuery::new(BY_CREATION_TIME)).await?;
        let expired = all.iter().filter(|s| s.is_expired(now)).count();
        Ok(SessionStats {
            total: all.len(),
            active: all.len() - expired,
            expired,
        })
    }
}

fn expired_before(now: DateTime<Utc>) -> IndexQuery {
    IndexQuery::new("by_expires_at")
        .gte("expiresAt", 0)
        .lt("expiresAt", now.timestamp_millis())
}

// ─── Accounts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Accounts<'a>(Handle<'a>);

impl<'a> Accounts<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Accounts))
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<Account>> {
        self.0.get(id).await
    }

    pub async fn get_by_provider_account(
        &self,
        provider_id: &str,
        account_id: &str,
    ) -> StoreResult<Option<Account>> {
        self.0
            .first(
                IndexQuery::new("by_provider_account")
                    .eq("providerId", provider_id)
                    .eq("accountId", account_id),
            )
            .await
    }

    pub async fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Account>> {
        self.0.all(IndexQuery::new("by_user_id").eq("userId", user_id)).await
    }

    /// Link an account. A (providerId, accountId) pair that is already linked
    /// returns the existing row.
    pub async fn create(&self, account: &Account) -> StoreResult<Upserted<Account>> {
        self.0.insert_if_absent("by_provider_account", account).await
    }

    pub async fn update(
        &self,
        id: &str,
        mut patch: Document,
        now: DateTime<Utc>,
    ) -> StoreResult<Account> {
        patch.insert("updatedAt".into(), json!(now.timestamp_millis()));
        self.0.patch(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.0.delete(id).await
    }

    pub async fn remove_by_user(&self, user_id: &str) -> StoreResult<usize> {
        self.0
            .delete_matching(IndexQuery::new("by_user_id").eq("userId", user_id))
            .await
    }
}

// ─── Verifications ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct Verifications<'a>(Handle<'a>);

impl<'a> Verifications<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore) -> Self {
        Self(Handle::new(store, Table::Verifications))
    }

    pub async fn get_by_id(&self, id: &str) -> StoreResult<Option<Verification>> {
        self.0.get(id).await
    }

    /// Newest verification for an identifier.
    pub async fn get_by_identifier(&self, identifier: &str) -> StoreResult<Option<Verification>> {
        self.0
            .first(
                IndexQuery::new("by_identifier")
                    .eq("identifier", identifier)
                    .order(Order::Desc),
            )
            .await
    }

    pub async fn get_by_identifier_value(
        &self,
        identifier: &str,
        value: &str,
    ) -> StoreResult<Option<Verification>> {
        self.0
            .first(
                IndexQuery::new("by_identifier_value")
                    .eq("identifier", identifier)
                    .eq("value", value),
            )
            .await
    }

    pub async fn list_by_identifier(&self, identifier: &str) -> StoreResult<Vec<Verification>> {
        self.0
            .all(IndexQuery::new("by_identifier").eq("identifier", identifier))
            .await
    }

    pub async fn list_all(&self) -> StoreResult<Vec<Verification>> {
        self.0.all(IndexQuery::new(BY_CREATION_TIME)).await
    }

    pub async fn create(&self, verification: &Verification) -> StoreResult<Verification> {
        self.0.insert(verification).await
    }

    pub async fn update(
        &self,
        id: &str,
        mut patch: Document,
        now: DateTime<Utc>,
    ) -> StoreResult<Verification> {
        patch.insert("updatedAt".into(), json!(now.timestamp_millis()));
        self.0.patch(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        self.0.delete(id).await
    }

    pub async fn remove_by_identifier(&self, identifier: &str) -> StoreResult<usize> {
        self.0
            .delete_matching(IndexQuery::new("by_identifier").eq("identifier", identifier))
            .await
    }

    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.0.delete_matching(expired_before(now)).await
    }
}
