// End-to-end adapter behavior over the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use milo_auth::{DocumentAuthAdapter, RoleAugmenter};
use milo_core::db::adapter::{Adapter, FindManyQuery, Operator, WhereClause};
use milo_core::error::MiloError;
use milo_core::options::AuthOptions;
use milo_store::StoreClient;

fn adapter_with(options: AuthOptions) -> DocumentAuthAdapter {
    DocumentAuthAdapter::new(Arc::new(StoreClient::memory()), options)
}

fn adapter() -> DocumentAuthAdapter {
    adapter_with(AuthOptions::default())
}

#[tokio::test]
async fn test_create_user_twice_returns_same_record() {
    let adapter = adapter();
    let data = json!({"name": "Alice Doe", "email": "alice@example.com", "emailVerified": true});

    let first = adapter.create("user", data.clone()).await.unwrap();
    let second = adapter.create("user", data).await.unwrap();

    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["firstName"], "Alice");
    assert_eq!(first["role"], "user");
    assert_eq!(adapter.count("user", &[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_oauth_sign_in_flow() {
    let adapter = adapter();
    let user = adapter
        .create("user", json!({"name": "Alice", "email": "alice@example.com"}))
        .await
        .unwrap();
    let user_id = user["id"].as_str().unwrap().to_string();

    let account = json!({"userId": user_id, "providerId": "github", "accountId": "42"});
    let linked = adapter.create("account", account.clone()).await.unwrap();
    let relinked = adapter.create("account", account).await.unwrap();
    assert_eq!(linked["id"], relinked["id"]);

    let found = adapter
        .find_one(
            "account",
            &[
                WhereClause::eq("providerId", "github").and(),
                WhereClause::eq("accountId", "42"),
            ],
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["userId"], user_id.as_str());

    let expires = (Utc::now() + Duration::days(7)).to_rfc3339();
    adapter
        .create("session", json!({"userId": user_id, "token": "tok_1", "expiresAt": expires}))
        .await
        .unwrap();

    let with_user = adapter.get_session("tok_1").await.unwrap().unwrap();
    assert_eq!(with_user.user.email, "alice@example.com");

    adapter
        .delete_many("session", &[WhereClause::eq("userId", user_id.as_str())])
        .await
        .unwrap();
    assert!(adapter.get_session("tok_1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_session_hidden_unless_lenient() {
    let expired = json!({
        "userId": "u1",
        "token": "old",
        "expiresAt": (Utc::now() - Duration::minutes(1)).timestamp_millis(),
    });
    let by_token = [WhereClause::eq("token", "old")];

    let strict = adapter();
    strict.create("session", expired.clone()).await.unwrap();
    assert!(strict.find_one("session", &by_token).await.unwrap().is_none());
    assert!(strict
        .find_many("session", FindManyQuery::filtered(vec![WhereClause::eq("userId", "u1")]))
        .await
        .unwrap()
        .is_empty());

    let lenient = adapter_with(AuthOptions::default().lenient_session_expiry(true));
    lenient.create("session", expired).await.unwrap();
    assert!(lenient.find_one("session", &by_token).await.unwrap().is_some());
}

#[tokio::test]
async fn test_update_session_by_token_converts_dates() {
    let adapter = adapter();
    adapter
        .create(
            "session",
            json!({
                "userId": "u1",
                "token": "t",
                "expiresAt": (Utc::now() + Duration::hours(1)).to_rfc3339(),
            }),
        )
        .await
        .unwrap();

    let later = Utc::now() + Duration::days(30);
    let updated = adapter
        .update(
            "session",
            &[WhereClause::eq("token", "t")],
            json!({"expiresAt": later.to_rfc3339()}),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated["expiresAt"], json!(later.timestamp_millis()));

    let missing = adapter
        .update("session", &[WhereClause::eq("token", "nope")], json!({"ipAddress": "x"}))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_verification_sweep_by_expiry_clause() {
    let adapter = adapter();
    let now = Utc::now();
    for (identifier, offset) in [("old", -Duration::minutes(5)), ("fresh", Duration::minutes(5))] {
        adapter
            .create(
                "verification",
                json!({
                    "identifier": identifier,
                    "value": "v",
                    "expiresAt": (now + offset).timestamp_millis(),
                }),
            )
            .await
            .unwrap();
    }

    assert!(adapter
        .find_one("verification", &[WhereClause::eq("identifier", "old")])
        .await
        .unwrap()
        .is_none());

    let removed = adapter
        .delete_many(
            "verification",
            &[WhereClause::with_operator("expiresAt", Operator::Lt, now.to_rfc3339())],
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(adapter
        .find_one("verification", &[WhereClause::eq("state", "fresh")])
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_find_many_hides_expired_verifications() {
    let adapter = adapter();
    let now = Utc::now();
    for (value, offset) in [("stale", -Duration::minutes(1)), ("live", Duration::minutes(10))] {
        adapter
            .create(
                "verification",
                json!({
                    "identifier": "reset:alice",
                    "value": value,
                    "expiresAt": (now + offset).timestamp_millis(),
                }),
            )
            .await
            .unwrap();
    }

    let by_identifier = adapter
        .find_many(
            "verification",
            FindManyQuery::filtered(vec![WhereClause::eq("identifier", "reset:alice")]),
        )
        .await
        .unwrap();
    assert_eq!(by_identifier.len(), 1);
    assert_eq!(by_identifier[0]["value"], "live");

    let all = adapter
        .find_many("verification", FindManyQuery::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["value"], "live");
}

#[tokio::test]
async fn test_unknown_model_and_missing_user_id() {
    let adapter = adapter();
    let err = adapter.find_one("widget", &[]).await.unwrap_err();
    assert!(matches!(err, MiloError::Config(ref m) if m == "Unknown model: widget"));

    let err = adapter
        .create("account", json!({"providerId": "github", "accountId": "1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, MiloError::Validation(_)));
}

#[tokio::test]
async fn test_passkey_challenge_is_not_persisted() {
    let adapter = adapter();
    let created = adapter
        .create("passkeyChallenge", json!({"challenge": "abc"}))
        .await
        .unwrap();
    assert!(created["id"].as_str().unwrap().starts_with("temp_"));
    assert!(adapter
        .find_one("passkeyChallenge", &[WhereClause::eq("id", created["id"].clone())])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_sweep_and_role_augmentation() {
    let client = Arc::new(StoreClient::memory());
    let adapter = DocumentAuthAdapter::new(client.clone(), AuthOptions::default());
    let user = adapter
        .create("user", json!({"name": "Coach", "email": "coach@example.com", "role": "admin"}))
        .await
        .unwrap();
    let user_id = user["id"].as_str().unwrap();
    adapter
        .create(
            "session",
            json!({
                "userId": user_id,
                "token": "live",
                "expiresAt": (Utc::now() + Duration::hours(1)).timestamp_millis(),
            }),
        )
        .await
        .unwrap();
    adapter
        .create(
            "session",
            json!({
                "userId": user_id,
                "token": "dead",
                "expiresAt": (Utc::now() - Duration::hours(1)).timestamp_millis(),
            }),
        )
        .await
        .unwrap();

    let report = adapter.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(report.sessions, 1);

    let session = adapter.get_session("live").await.unwrap().unwrap();
    let mut stripped = session.clone();
    stripped.user.role = None;
    let augmented = RoleAugmenter::from_store(client).augment(stripped).await;
    assert_eq!(augmented.user.role.as_deref(), Some("admin"));
}
