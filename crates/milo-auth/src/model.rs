// Typed model names and lookup keys.
//
// The auth framework addresses records with a model string and a list of
// where-clauses. Both are parsed once, here, into an `AuthModel` and a
// per-model lookup enum; everything downstream works on the typed keys.

use std::fmt;
use std::str::FromStr;

use milo_core::db::adapter::{Operator, WhereClause};
use milo_core::error::MiloError;

/// Models the auth framework stores through the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthModel {
    User,
    Session,
    Account,
    Verification,
    /// Accepted but never persisted.
    PasskeyChallenge,
}

impl AuthModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Session => "session",
            Self::Account => "account",
            Self::Verification => "verification",
            Self::PasskeyChallenge => "passkeyChallenge",
        }
    }
}

impl FromStr for AuthModel {
    type Err = MiloError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "session" => Ok(Self::Session),
            "account" => Ok(Self::Account),
            "verification" => Ok(Self::Verification),
            "passkeyChallenge" => Ok(Self::PasskeyChallenge),
            other => Err(MiloError::Config(format!("Unknown model: {other}"))),
        }
    }
}

impl fmt::Display for AuthModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Lookup keys ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserLookup {
    Id(String),
    Email(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Id(String),
    Token(String),
    UserId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountLookup {
    Id(String),
    ProviderAccount {
        provider_id: String,
        account_id: String,
    },
    UserId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationLookup {
    Id(String),
    Identifier(String),
    IdentifierValue { identifier: String, value: String },
}

/// Equality terms of a where-list, in order.
///
/// Only `eq` clauses with string values identify records; other clauses are
/// ignored by key resolution.
struct EqTerms<'a>(Vec<(&'a str, &'a str)>);

impl<'a> EqTerms<'a> {
    fn new(clauses: &'a [WhereClause]) -> Self {
        Self(
            clauses
                .iter()
                .filter(|c| c.operator == Operator::Eq)
                .filter_map(|c| c.value_str().map(|v| (c.field.as_str(), v)))
                .collect(),
        )
    }

    fn get(&self, field: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.to_string())
    }

    fn id(&self) -> Option<String> {
        self.get("id").or_else(|| self.get("_id"))
    }
}

impl UserLookup {
    pub fn resolve(clauses: &[WhereClause]) -> Option<Self> {
        let terms = EqTerms::new(clauses);
        terms
            .id()
            .map(Self::Id)
            .or_else(|| terms.get("email").map(Self::Email))
    }
}

impl SessionLookup {
    pub fn resolve(clauses: &[WhereClause]) -> Option<Self> {
        let terms = EqTerms::new(clauses);
        terms
            .id()
            .map(Self::Id)
            .or_else(|| terms.get("token").map(Self::Token))
            .or_else(|| terms.get("userId").map(Self::UserId))
    }
}

impl AccountLookup {
    pub fn resolve(clauses: &[WhereClause]) -> Option<Self> {
        let terms = EqTerms::new(clauses);
        if let Some(id) = terms.id() {
            return Some(Self::Id(id));
        }
        match (terms.get("providerId"), terms.get("accountId")) {
            (Some(provider_id), Some(account_id)) => Some(Self::ProviderAccount {
                provider_id,
                account_id,
            }),
            _ => terms.get("userId").map(Self::UserId),
        }
    }
}

impl VerificationLookup {
    /// `state` is accepted as an alias for `identifier`.
    pub fn resolve(clauses: &[WhereClause]) -> Option<Self> {
        let terms = EqTerms::new(clauses);
        if let Some(id) = terms.id() {
            return Some(Self::Id(id));
        }
        let identifier = terms.get("identifier").or_else(|| terms.get("state"))?;
        match terms.get("value") {
            Some(value) => Some(Self::IdentifierValue { identifier, value }),
            None => Some(Self::Identifier(identifier)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_is_config_error() {
        let err = "widget".parse::<AuthModel>().unwrap_err();
        assert!(matches!(err, MiloError::Config(ref m) if m == "Unknown model: widget"));
        assert_eq!("passkeyChallenge".parse::<AuthModel>().unwrap(), AuthModel::PasskeyChallenge);
    }

    #[test]
    fn test_id_takes_precedence() {
        let clauses = vec![
            WhereClause::eq("email", "a@x.io").and(),
            WhereClause::eq("id", "u1"),
        ];
        assert_eq!(UserLookup::resolve(&clauses), Some(UserLookup::Id("u1".into())));
    }

    #[test]
    fn test_account_provider_pair() {
        let clauses = vec![
            WhereClause::eq("providerId", "github").and(),
            WhereClause::eq("accountId", "123"),
        ];
        assert_eq!(
            AccountLookup::resolve(&clauses),
            Some(AccountLookup::ProviderAccount {
                provider_id: "github".into(),
                account_id: "123".into()
            })
        );
        // half a pair falls through to nothing
        assert_eq!(AccountLookup::resolve(&[WhereClause::eq("providerId", "github")]), None);
    }

    #[test]
    fn test_verification_state_alias() {
        assert_eq!(
            VerificationLookup::resolve(&[WhereClause::eq("state", "abc")]),
            Some(VerificationLookup::Identifier("abc".into()))
        );
        let clauses = vec![
            WhereClause::eq("identifier", "email:a").and(),
            WhereClause::eq("value", "tok"),
        ];
        assert!(matches!(
            VerificationLookup::resolve(&clauses),
            Some(VerificationLookup::IdentifierValue { .. })
        ));
    }

    #[test]
    fn test_non_eq_clauses_do_not_identify() {
        let clauses = vec![WhereClause::with_operator("token", Operator::Ne, "t")];
        assert_eq!(SessionLookup::resolve(&clauses), None);
    }
}
