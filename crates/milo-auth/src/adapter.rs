// The auth framework's `Adapter` over the typed store client.
//
// Every call parses the model string into an `AuthModel` and the where-list
// into a typed lookup key before touching the store. Returned records carry
// both `_id` and `id`. Store failures propagate unchanged; "not found" is
// always `None`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use milo_core::db::adapter::{Adapter, AdapterResult, FindManyQuery, Operator, WhereClause};
use milo_core::db::models::{Account, Session, User, Verification};
use milo_core::error::MiloError;
use milo_core::options::AuthOptions;
use milo_core::utils::id::generate_id_with_length;
use milo_core::utils::{parse_timestamp, temporary_id};
use milo_store::{Document, StoreClient, StoreError};

use crate::model::{AccountLookup, AuthModel, SessionLookup, UserLookup, VerificationLookup};
use crate::session::SessionWithUser;

/// Fields the framework may send as RFC 3339 strings; stored as epoch millis.
const DATE_FIELDS: &[&str] = &[
    "expiresAt",
    "createdAt",
    "updatedAt",
    "banExpires",
    "accessTokenExpiresAt",
    "refreshTokenExpiresAt",
    "trialActivatedAt",
    "onboardingCompletedAt",
    "subscriptionActivatedAt",
];

/// Rows removed by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub verifications: usize,
}

/// Auth storage adapter backed by the document store.
#[derive(Debug, Clone)]
pub struct DocumentAuthAdapter {
    client: Arc<StoreClient>,
    options: AuthOptions,
}

impl DocumentAuthAdapter {
    pub fn new(client: Arc<StoreClient>, options: AuthOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    /// Load a usable session and its user by bearer token.
    pub async fn get_session(&self, token: &str) -> AdapterResult<Option<SessionWithUser>> {
        let now = Utc::now();
        let session = self.client.sessions().get_by_token(token).await?;
        let Some(session) = session.and_then(|s| self.usable(s, now)) else {
            return Ok(None);
        };
        let user = self.client.users().get_by_id(&session.user_id).await?;
        Ok(user.map(|user| SessionWithUser { user, session }))
    }

    /// Delete expired sessions and verifications.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> AdapterResult<SweepReport> {
        let report = SweepReport {
            sessions: self.client.sessions().cleanup_expired(now).await?,
            verifications: self.client.verifications().cleanup_expired(now).await?,
        };
        debug!(sessions = report.sessions, verifications = report.verifications, "expiry sweep");
        Ok(report)
    }

    fn log(&self, op: &'static str, model: AuthModel, detail: &dyn fmt::Debug) {
        if self.options.debug_logs {
            debug!(op, model = %model, detail = ?detail, "auth adapter");
        }
    }

    fn usable(&self, session: Session, now: DateTime<Utc>) -> Option<Session> {
        (self.options.lenient_session_expiry || !session.is_expired(now)).then_some(session)
    }

    // ─── Typed lookups ───────────────────────────────────────────

    async fn find_user(&self, lookup: &UserLookup) -> AdapterResult<Option<User>> {
        let users = self.client.users();
        Ok(match lookup {
            UserLookup::Id(id) => users.get_by_id(id).await?,
            UserLookup::Email(email) => users.get_by_email(email).await?,
        })
    }

    async fn find_session(
        &self,
        lookup: &SessionLookup,
        now: DateTime<Utc>,
    ) -> AdapterResult<Option<Session>> {
        let sessions = self.client.sessions();
        let found = match lookup {
            SessionLookup::Id(id) => sessions.get_by_id(id).await?,
            SessionLookup::Token(token) => sessions.get_by_token(token).await?,
            SessionLookup::UserId(user_id) => sessions
                .list_by_user(user_id)
                .await?
                .into_iter()
                .find(|s| self.options.lenient_session_expiry || !s.is_expired(now)),
        };
        Ok(found.and_then(|s| self.usable(s, now)))
    }

    async fn find_account(&self, lookup: &AccountLookup) -> AdapterResult<Option<Account>> {
        let accounts = self.client.accounts();
        Ok(match lookup {
            AccountLookup::Id(id) => accounts.get_by_id(id).await?,
            AccountLookup::ProviderAccount {
                provider_id,
                account_id,
            } => accounts.get_by_provider_account(provider_id, account_id).await?,
            AccountLookup::UserId(user_id) => {
                accounts.list_by_user(user_id).await?.into_iter().next()
            }
        })
    }

    async fn find_verification(
        &self,
        lookup: &VerificationLookup,
        now: DateTime<Utc>,
    ) -> AdapterResult<Option<Verification>> {
        let verifications = self.client.verifications();
        let found = match lookup {
            VerificationLookup::Id(id) => verifications.get_by_id(id).await?,
            VerificationLookup::Identifier(identifier) => {
                verifications.get_by_identifier(identifier).await?
            }
            VerificationLookup::IdentifierValue { identifier, value } => {
                verifications.get_by_identifier_value(identifier, value).await?
            }
        };
        Ok(found.filter(|v| !v.is_expired(now)))
    }

    /// Document id addressed by a where-list, or `None` when it identifies nothing.
    async fn target_id(
        &self,
        model: AuthModel,
        where_clauses: &[WhereClause],
    ) -> AdapterResult<Option<String>> {
        Ok(match model {
            AuthModel::User => match UserLookup::resolve(where_clauses) {
                Some(UserLookup::Id(id)) => Some(id),
                Some(lookup) => self.find_user(&lookup).await?.map(|u| u.id),
                None => None,
            },
            AuthModel::Session => match SessionLookup::resolve(where_clauses) {
                Some(SessionLookup::Id(id)) => Some(id),
                Some(SessionLookup::Token(token)) => {
                    self.client.sessions().get_by_token(&token).await?.map(|s| s.id)
                }
                Some(SessionLookup::UserId(_)) | None => None,
            },
            AuthModel::Account => match AccountLookup::resolve(where_clauses) {
                Some(AccountLookup::Id(id)) => Some(id),
                Some(lookup @ AccountLookup::ProviderAccount { .. }) => {
                    self.find_account(&lookup).await?.map(|a| a.id)
                }
                Some(AccountLookup::UserId(_)) | None => None,
            },
            AuthModel::Verification => {
                let verifications = self.client.verifications();
                match VerificationLookup::resolve(where_clauses) {
                    Some(VerificationLookup::Id(id)) => Some(id),
                    Some(VerificationLookup::Identifier(identifier)) => {
                        verifications.get_by_identifier(&identifier).await?.map(|v| v.id)
                    }
                    Some(VerificationLookup::IdentifierValue { identifier, value }) => verifications
                        .get_by_identifier_value(&identifier, &value)
                        .await?
                        .map(|v| v.id),
                    None => None,
                }
            }
            AuthModel::PasskeyChallenge => None,
        })
    }

    async fn delete_by_id(&self, model: AuthModel, id: &str) -> AdapterResult<bool> {
        let removed = match model {
            AuthModel::User => self.client.users().remove(id).await?,
            AuthModel::Session => self.client.sessions().remove(id).await?,
            AuthModel::Account => self.client.accounts().remove(id).await?,
            AuthModel::Verification => self.client.verifications().remove(id).await?,
            AuthModel::PasskeyChallenge => false,
        };
        Ok(removed)
    }
}

#[async_trait]
impl Adapter for DocumentAuthAdapter {
    async fn create(&self, model: &str, data: Value) -> AdapterResult<Value> {
        let model: AuthModel = model.parse()?;
        let now = Utc::now();
        self.log("create", model, &data);

        let record = match model {
            AuthModel::User => {
                let user = user_from_input(&data, now)?;
                let outcome = self.client.users().create_or_get(&user).await?;
                if !outcome.created {
                    debug!(
                        email = %outcome.record.email,
                        "user already exists, returning existing record"
                    );
                }
                to_record(&outcome.record)?
            }
            AuthModel::Session => {
                let session = session_from_input(&data, now)?;
                to_record(&self.client.sessions().create(&session).await?)?
            }
            AuthModel::Account => {
                let account = account_from_input(&data, now)?;
                let outcome = self.client.accounts().create(&account).await?;
                to_record(&outcome.record)?
            }
            AuthModel::Verification => {
                let verification = verification_from_input(&data, now)?;
                to_record(&self.client.verifications().create(&verification).await?)?
            }
            AuthModel::PasskeyChallenge => {
                let mut data = data;
                let id = temporary_id();
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("_id".into(), json!(id));
                    obj.insert("id".into(), json!(id));
                }
                data
            }
        };

        self.log("created", model, &record);
        Ok(record)
    }

    async fn find_one(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
    ) -> AdapterResult<Option<Value>> {
        let model: AuthModel = model.parse()?;
        let now = Utc::now();
        self.log("find_one", model, &where_clauses);

        let record = match model {
            AuthModel::User => match UserLookup::resolve(where_clauses) {
                Some(lookup) => self.find_user(&lookup).await?.map(|u| to_record(&u)).transpose()?,
                None => None,
            },
            AuthModel::Session => match SessionLookup::resolve(where_clauses) {
                Some(lookup) => self
                    .find_session(&lookup, now)
                    .await?
                    .map(|s| to_record(&s))
                    .transpose()?,
                None => None,
            },
            AuthModel::Account => match AccountLookup::resolve(where_clauses) {
                Some(lookup) => self
                    .find_account(&lookup)
                    .await?
                    .map(|a| to_record(&a))
                    .transpose()?,
                None => None,
            },
            AuthModel::Verification => match VerificationLookup::resolve(where_clauses) {
                Some(lookup) => self
                    .find_verification(&lookup, now)
                    .await?
                    .map(|v| to_record(&v))
                    .transpose()?,
                None => None,
            },
            AuthModel::PasskeyChallenge => None,
        };

        self.log("found", model, &record);
        Ok(record)
    }

    async fn find_many(&self, model: &str, query: FindManyQuery) -> AdapterResult<Vec<Value>> {
        let model: AuthModel = model.parse()?;
        let now = Utc::now();
        self.log("find_many", model, &query);
        let clauses = &query.where_clauses;

        let records = match model {
            AuthModel::User => {
                let users: Vec<User> = match UserLookup::resolve(clauses) {
                    Some(lookup) => self.find_user(&lookup).await?.into_iter().collect(),
                    None => self.client.users().list_all().await?,
                };
                to_records(&users)?
            }
            AuthModel::Session => {
                let sessions: Vec<Session> = match SessionLookup::resolve(clauses) {
                    Some(SessionLookup::UserId(user_id)) => self
                        .client
                        .sessions()
                        .list_by_user(&user_id)
                        .await?
                        .into_iter()
                        .filter_map(|s| self.usable(s, now))
                        .collect(),
                    Some(lookup) => self.find_session(&lookup, now).await?.into_iter().collect(),
                    None => Vec::new(),
                };
                to_records(&sessions)?
            }
            AuthModel::Account => {
                let accounts: Vec<Account> = match AccountLookup::resolve(clauses) {
                    Some(AccountLookup::UserId(user_id)) => {
                        self.client.accounts().list_by_user(&user_id).await?
                    }
                    Some(lookup) => self.find_account(&lookup).await?.into_iter().collect(),
                    None => Vec::new(),
                };
                to_records(&accounts)?
            }
            AuthModel::Verification => {
                let store = self.client.verifications();
                let verifications: Vec<Verification> = match VerificationLookup::resolve(clauses) {
                    Some(VerificationLookup::Identifier(identifier)) => {
                        store.list_by_identifier(&identifier).await?
                    }
                    Some(lookup) => {
                        self.find_verification(&lookup, now).await?.into_iter().collect()
                    }
                    None => store.list_all().await?,
                };
                let live: Vec<Verification> =
                    verifications.into_iter().filter(|v| !v.is_expired(now)).collect();
                to_records(&live)?
            }
            AuthModel::PasskeyChallenge => Vec::new(),
        };

        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<i64> {
        let model: AuthModel = model.parse()?;
        self.log("count", model, &where_clauses);
        let count = match model {
            AuthModel::User => match UserLookup::resolve(where_clauses) {
                Some(lookup) => usize::from(self.find_user(&lookup).await?.is_some()),
                None => self.client.users().count().await?,
            },
            _ => 0,
        };
        Ok(count as i64)
    }

    async fn update(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
        data: Value,
    ) -> AdapterResult<Option<Value>> {
        let model: AuthModel = model.parse()?;
        self.log("update", model, &(where_clauses, &data));
        if model == AuthModel::PasskeyChallenge {
            return Ok(Some(data));
        }

        let Some(id) = self.target_id(model, where_clauses).await? else {
            return Ok(None);
        };
        let patch = to_patch(&data)?;
        let now = Utc::now();

        let record = match model {
            AuthModel::User => found(self.client.users().update(&id, patch, now).await)?
                .map(|u| to_record(&u))
                .transpose()?,
            AuthModel::Session => found(self.client.sessions().update(&id, patch, now).await)?
                .map(|s| to_record(&s))
                .transpose()?,
            AuthModel::Account => found(self.client.accounts().update(&id, patch, now).await)?
                .map(|a| to_record(&a))
                .transpose()?,
            AuthModel::Verification => {
                found(self.client.verifications().update(&id, patch, now).await)?
                    .map(|v| to_record(&v))
                    .transpose()?
            }
            AuthModel::PasskeyChallenge => None,
        };

        self.log("updated", model, &record);
        Ok(record)
    }

    async fn update_many(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
        data: Value,
    ) -> AdapterResult<i64> {
        let model: AuthModel = model.parse()?;
        self.log("update_many (unsupported)", model, &(where_clauses, &data));
        Ok(0)
    }

    async fn delete(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<()> {
        let model: AuthModel = model.parse()?;
        self.log("delete", model, &where_clauses);
        if let Some(id) = self.target_id(model, where_clauses).await? {
            self.delete_by_id(model, &id).await?;
        }
        Ok(())
    }

    async fn delete_many(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<i64> {
        let model: AuthModel = model.parse()?;
        self.log("delete_many", model, &where_clauses);

        let removed = match model {
            AuthModel::Session => match SessionLookup::resolve(where_clauses) {
                Some(SessionLookup::UserId(user_id)) => {
                    self.client.sessions().remove_by_user(&user_id).await?
                }
                _ => self.delete_single(model, where_clauses).await?,
            },
            AuthModel::Account => match AccountLookup::resolve(where_clauses) {
                Some(AccountLookup::UserId(user_id)) => {
                    self.client.accounts().remove_by_user(&user_id).await?
                }
                _ => self.delete_single(model, where_clauses).await?,
            },
            AuthModel::Verification => match expiry_cutoff(where_clauses) {
                Some(cutoff) => self.client.verifications().cleanup_expired(cutoff).await?,
                None => match VerificationLookup::resolve(where_clauses) {
                    Some(VerificationLookup::Identifier(identifier)) => {
                        self.client.verifications().remove_by_identifier(&identifier).await?
                    }
                    _ => self.delete_single(model, where_clauses).await?,
                },
            },
            AuthModel::User => self.delete_single(model, where_clauses).await?,
            AuthModel::PasskeyChallenge => 0,
        };

        self.log("deleted", model, &removed);
        Ok(removed as i64)
    }
}

impl DocumentAuthAdapter {
    async fn delete_single(
        &self,
        model: AuthModel,
        where_clauses: &[WhereClause],
    ) -> AdapterResult<usize> {
        match self.target_id(model, where_clauses).await? {
            Some(id) => Ok(usize::from(self.delete_by_id(model, &id).await?)),
            None => Ok(0),
        }
    }
}

// ─── Record conversion ───────────────────────────────────────────

/// Serialize a model as an adapter record with both `_id` and `id`.
fn to_record<T: Serialize>(model: &T) -> AdapterResult<Value> {
    let mut value = serde_json::to_value(model)?;
    if let Some(obj) = value.as_object_mut() {
        if let Some(id) = obj.get("_id").cloned() {
            obj.insert("id".into(), id);
        }
    }
    Ok(value)
}

fn to_records<T: Serialize>(models: &[T]) -> AdapterResult<Vec<Value>> {
    models.iter().map(to_record).collect()
}

/// Map a missing target document to `None`.
fn found<T>(result: Result<T, StoreError>) -> AdapterResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::DocumentNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Cutoff from an `expiresAt < t` (or `<=`) clause.
fn expiry_cutoff(where_clauses: &[WhereClause]) -> Option<DateTime<Utc>> {
    where_clauses
        .iter()
        .find(|c| c.field == "expiresAt" && matches!(c.operator, Operator::Lt | Operator::Lte))
        .and_then(|c| parse_timestamp(&c.value))
}

/// Convert framework update data into a store patch.
fn to_patch(data: &Value) -> AdapterResult<Document> {
    let obj = data
        .as_object()
        .ok_or_else(|| MiloError::Validation("update data must be an object".into()))?;
    let mut patch = Document::new();
    for (key, value) in obj {
        if matches!(key.as_str(), "id" | "_id" | "_creationTime") {
            continue;
        }
        let value = if DATE_FIELDS.contains(&key.as_str()) && !value.is_null() {
            let ts = parse_timestamp(value)
                .ok_or_else(|| MiloError::Validation(format!("{key} is not a timestamp")))?;
            json!(ts.timestamp_millis())
        } else {
            value.clone()
        };
        patch.insert(key.clone(), value);
    }
    Ok(patch)
}

/// Typed reads over framework input data.
struct Input<'a> {
    model: AuthModel,
    fields: &'a Map<String, Value>,
}

impl<'a> Input<'a> {
    fn new(model: AuthModel, data: &'a Value) -> AdapterResult<Self> {
        let fields = data
            .as_object()
            .ok_or_else(|| MiloError::Validation(format!("{model} data must be an object")))?;
        Ok(Self { model, fields })
    }

    fn str(&self, field: &str) -> Option<String> {
        self.fields.get(field).and_then(Value::as_str).map(str::to_string)
    }

    fn require(&self, field: &str) -> AdapterResult<String> {
        self.str(field)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MiloError::Validation(format!("{}.{field} is required", self.model)))
    }

    fn bool(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    fn time(&self, field: &str) -> Option<DateTime<Utc>> {
        self.fields.get(field).and_then(parse_timestamp)
    }

    fn require_time(&self, field: &str) -> AdapterResult<DateTime<Utc>> {
        self.time(field)
            .ok_or_else(|| {
                MiloError::Validation(format!("{}.{field} must be a timestamp", self.model))
            })
    }
}

fn user_from_input(data: &Value, now: DateTime<Utc>) -> AdapterResult<User> {
    let input = Input::new(AuthModel::User, data)?;
    let mut user = User::new(input.str("name").unwrap_or_default(), input.require("email")?, now);
    if let Some(first) = input.str("firstName") {
        user.first_name = first;
    }
    if let Some(last) = input.str("lastName") {
        user.last_name = last;
    }
    user.email_verified = input.bool("emailVerified").unwrap_or(false);
    user.image = input.str("image");
    if let Some(role) = input.str("role") {
        user.role = Some(role);
    }
    user.created_at = input.time("createdAt").unwrap_or(now);
    user.updated_at = input.time("updatedAt").unwrap_or(now);
    Ok(user)
}

fn session_from_input(data: &Value, now: DateTime<Utc>) -> AdapterResult<Session> {
    let input = Input::new(AuthModel::Session, data)?;
    Ok(Session {
        id: String::new(),
        creation_time: 0,
        user_id: input.require("userId")?,
        token: input.str("token").unwrap_or_else(|| generate_id_with_length(32)),
        expires_at: input.require_time("expiresAt")?,
        ip_address: input.str("ipAddress"),
        user_agent: input.str("userAgent"),
        impersonated_by: input.str("impersonatedBy"),
        created_at: input.time("createdAt").unwrap_or(now),
        updated_at: input.time("updatedAt").unwrap_or(now),
    })
}

fn account_from_input(data: &Value, now: DateTime<Utc>) -> AdapterResult<Account> {
    let input = Input::new(AuthModel::Account, data)?;
    Ok(Account {
        id: String::new(),
        creation_time: 0,
        user_id: input.require("userId")?,
        account_id: input.require("accountId")?,
        provider_id: input.require("providerId")?,
        access_token: input.str("accessToken"),
        refresh_token: input.str("refreshToken"),
        access_token_expires_at: input.time("accessTokenExpiresAt"),
        refresh_token_expires_at: input.time("refreshTokenExpiresAt"),
        scope: input.str("scope"),
        id_token: input.str("idToken"),
        password: input.str("password"),
        created_at: input.time("createdAt").unwrap_or(now),
        updated_at: input.time("updatedAt").unwrap_or(now),
    })
}

fn verification_from_input(data: &Value, now: DateTime<Utc>) -> AdapterResult<Verification> {
    let input = Input::new(AuthModel::Verification, data)?;
    Ok(Verification {
        id: String::new(),
        creation_time: 0,
        identifier: input.require("identifier")?,
        value: input.str("value").unwrap_or_default(),
        expires_at: input.require_time("expiresAt")?,
        created_at: input.time("createdAt").unwrap_or(now),
        updated_at: input.time("updatedAt").unwrap_or(now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_record_mirrors_id() {
        let user = User::new("A", "a@x.io", Utc::now());
        let mut user = user;
        user.id = "u1".into();
        let record = to_record(&user).unwrap();
        assert_eq!(record["_id"], "u1");
        assert_eq!(record["id"], "u1");
    }

    #[test]
    fn test_to_patch_converts_dates_and_drops_ids() {
        let patch = to_patch(&json!({
            "id": "x",
            "expiresAt": "2030-01-01T00:00:00Z",
            "ipAddress": "1.2.3.4",
            "impersonatedBy": null,
        }))
        .unwrap();
        assert!(!patch.contains_key("id"));
        assert_eq!(patch["expiresAt"], json!(1_893_456_000_000i64));
        assert_eq!(patch["impersonatedBy"], Value::Null);
        assert!(to_patch(&json!({"expiresAt": "soon"})).is_err());
    }

    #[test]
    fn test_account_without_user_is_validation_error() {
        let input = json!({"providerId": "github", "accountId": "1"});
        let err = account_from_input(&input, Utc::now()).unwrap_err();
        assert!(matches!(err, MiloError::Validation(ref m) if m == "account.userId is required"));
    }

    #[test]
    fn test_user_input_defaults() {
        let input = json!({"name": "Mary Jane Watson", "email": "mj@x.io"});
        let user = user_from_input(&input, Utc::now()).unwrap();
        assert_eq!(user.first_name, "Mary");
        assert_eq!(user.last_name, "Jane Watson");
        assert_eq!(user.role.as_deref(), Some("user"));
        assert!(!user.email_verified);
    }

    #[test]
    fn test_expiry_cutoff_accepts_millis() {
        let clauses = vec![WhereClause::with_operator("expiresAt", Operator::Lt, 1_000i64)];
        assert_eq!(expiry_cutoff(&clauses).unwrap().timestamp_millis(), 1_000);
        assert!(expiry_cutoff(&[WhereClause::eq("expiresAt", 1_000i64)]).is_none());
    }
}
