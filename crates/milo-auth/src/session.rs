// Session role augmentation.
//
// Every session handed to a client carries `user.role` resolved in this
// order: the role service's answer, then the role stored on the user record,
// then `"user"`. A failing role service never fails the session read.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use milo_core::db::models::{Session, User, DEFAULT_ROLE};
use milo_core::error::MiloError;
use milo_store::StoreClient;

/// A session together with its owning user, as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWithUser {
    pub user: User,
    pub session: Session,
}

/// Authoritative source of user roles.
#[async_trait]
pub trait RoleService: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` means the service has no opinion about this user.
    async fn role_for(&self, user_id: &str) -> Result<Option<String>, MiloError>;
}

/// Reads the role from the user record in the document store.
#[derive(Debug, Clone)]
pub struct StoreRoleService {
    client: Arc<StoreClient>,
}

impl StoreRoleService {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoleService for StoreRoleService {
    async fn role_for(&self, user_id: &str) -> Result<Option<String>, MiloError> {
        let user = self.client.users().get_by_id(user_id).await?;
        Ok(user.and_then(|u| u.role))
    }
}

/// Hook for rewriting the `{ user, session }` JSON payload before it is
/// returned by a get-session endpoint.
#[async_trait]
pub trait SessionTransformer: Send + Sync + std::fmt::Debug {
    async fn transform(&self, session_data: &Value) -> Result<Value, String>;
}

/// Applies role precedence to session payloads.
#[derive(Debug, Clone)]
pub struct RoleAugmenter {
    roles: Arc<dyn RoleService>,
}

impl RoleAugmenter {
    pub fn new(roles: Arc<dyn RoleService>) -> Self {
        Self { roles }
    }

    pub fn from_store(client: Arc<StoreClient>) -> Self {
        Self::new(Arc::new(StoreRoleService::new(client)))
    }

    pub async fn augment(&self, mut data: SessionWithUser) -> SessionWithUser {
        let role = self.resolve_role(&data.user.id, data.user.role.as_deref()).await;
        data.user.role = Some(role);
        data
    }

    async fn resolve_role(&self, user_id: &str, stored: Option<&str>) -> String {
        let live = match self.roles.role_for(user_id).await {
            Ok(role) => role,
            Err(e) => {
                warn!(user_id, error = %e, "role lookup failed, keeping stored role");
                None
            }
        };
        live.or_else(|| stored.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_ROLE.to_string())
    }
}

#[async_trait]
impl SessionTransformer for RoleAugmenter {
    async fn transform(&self, session_data: &Value) -> Result<Value, String> {
        let mut data = session_data.clone();
        let user = data
            .get_mut("user")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| "session payload has no user object".to_string())?;
        let user_id = user
            .get("id")
            .or_else(|| user.get("_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| "session user has no id".to_string())?
            .to_string();
        let stored = user.get("role").and_then(Value::as_str).map(str::to_string);

        let role = self.resolve_role(&user_id, stored.as_deref()).await;
        user.insert("role".into(), Value::String(role));
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct FixedRole(Option<&'static str>);

    #[async_trait]
    impl RoleService for FixedRole {
        async fn role_for(&self, _user_id: &str) -> Result<Option<String>, MiloError> {
            Ok(self.0.map(str::to_string))
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl RoleService for Broken {
        async fn role_for(&self, _user_id: &str) -> Result<Option<String>, MiloError> {
            Err(MiloError::Database("unreachable".into()))
        }
    }

    fn payload(role: Option<&str>) -> Value {
        let mut user = json!({"id": "u1", "email": "a@x.io"});
        if let Some(role) = role {
            user["role"] = json!(role);
        }
        json!({"user": user, "session": {"token": "t"}})
    }

    #[tokio::test]
    async fn test_live_role_wins() {
        let augmenter = RoleAugmenter::new(Arc::new(FixedRole(Some("admin"))));
        let out = augmenter.transform(&payload(Some("user"))).await.unwrap();
        assert_eq!(out["user"]["role"], "admin");
        assert_eq!(out["session"]["token"], "t");
    }

    #[tokio::test]
    async fn test_stored_role_then_default() {
        let augmenter = RoleAugmenter::new(Arc::new(FixedRole(None)));
        let out = augmenter.transform(&payload(Some("coach"))).await.unwrap();
        assert_eq!(out["user"]["role"], "coach");
        let out = augmenter.transform(&payload(None)).await.unwrap();
        assert_eq!(out["user"]["role"], "user");
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_stored() {
        let augmenter = RoleAugmenter::new(Arc::new(Broken));
        let out = augmenter.transform(&payload(Some("admin"))).await.unwrap();
        assert_eq!(out["user"]["role"], "admin");
    }

    #[tokio::test]
    async fn test_payload_without_user_is_rejected() {
        let augmenter = RoleAugmenter::new(Arc::new(FixedRole(None)));
        assert!(augmenter.transform(&json!({"session": {}})).await.is_err());
    }
}
