// Auth storage adapter trait: the storage interface the auth framework calls.
//
// Five core operations (create, find_one, find_many, update, delete) plus the
// bulk variants and count. Every call is parameterized by a model name and a
// generic where-list / data payload; backends translate these onto their own
// storage API.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MiloError;

/// Result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, MiloError>;

// ─── Where Clause ────────────────────────────────────────────────

/// Comparison operators for WHERE clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equal (default).
    #[default]
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Value is in the given list.
    In,
    /// String contains substring.
    Contains,
    /// String starts with prefix.
    StartsWith,
    /// String ends with suffix.
    EndsWith,
}

/// A single WHERE condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhereClause {
    /// The field name to filter on.
    pub field: String,
    /// The comparison value.
    pub value: serde_json::Value,
    /// The comparison operator (default: Eq).
    #[serde(default)]
    pub operator: Operator,
    /// Connector to the next clause. None means this is the last/only clause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector: Option<Connector>,
}

/// Logical connector between WHERE clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connector {
    And,
    Or,
}

impl WhereClause {
    /// Simple equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            operator: Operator::Eq,
            connector: None,
        }
    }

    /// Filter with an explicit operator.
    pub fn with_operator(
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            operator,
            connector: None,
        }
    }

    /// Add an AND connector.
    pub fn and(mut self) -> Self {
        self.connector = Some(Connector::And);
        self
    }

    /// Add an OR connector.
    pub fn or(mut self) -> Self {
        self.connector = Some(Connector::Or);
        self
    }

    /// The value as a string slice, if it is a JSON string.
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

// ─── Sort / Pagination ───────────────────────────────────────────

/// Sort direction for ORDER BY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Sort specification (field + direction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Query parameters for `find_many`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindManyQuery {
    pub where_clauses: Vec<WhereClause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<SortBy>,
}

impl FindManyQuery {
    /// Query with only a where-list.
    pub fn filtered(where_clauses: Vec<WhereClause>) -> Self {
        Self {
            where_clauses,
            ..Default::default()
        }
    }
}

// ─── Adapter Trait ───────────────────────────────────────────────

/// The auth framework's storage interface.
///
/// Implementations work with `serde_json::Value` so the framework stays
/// schema-agnostic. The shape of these methods is the contract the auth
/// framework depends on; replacement backends must keep it.
#[async_trait]
pub trait Adapter: Send + Sync + fmt::Debug {
    /// Create a new record in the given model.
    /// Returns the created record, including its generated identifier.
    async fn create(
        &self,
        model: &str,
        data: serde_json::Value,
    ) -> AdapterResult<serde_json::Value>;

    /// Find a single record matching the WHERE clauses.
    /// Returns `None` if no match found; "not found" is never an error.
    async fn find_one(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
    ) -> AdapterResult<Option<serde_json::Value>>;

    /// Find multiple records matching the query parameters.
    async fn find_many(
        &self,
        model: &str,
        query: FindManyQuery,
    ) -> AdapterResult<Vec<serde_json::Value>>;

    /// Count records matching the WHERE clauses.
    async fn count(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<i64>;

    /// Update a single record matching the WHERE clauses.
    /// Returns the updated record, or `None` if no match was found.
    async fn update(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
        data: serde_json::Value,
    ) -> AdapterResult<Option<serde_json::Value>>;

    /// Update multiple records matching the WHERE clauses.
    /// Returns the number of affected rows.
    async fn update_many(
        &self,
        model: &str,
        where_clauses: &[WhereClause],
        data: serde_json::Value,
    ) -> AdapterResult<i64>;

    /// Delete a single record matching the WHERE clauses.
    async fn delete(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<()>;

    /// Delete multiple records matching the WHERE clauses.
    /// Returns the number of deleted rows.
    async fn delete_many(&self, model: &str, where_clauses: &[WhereClause]) -> AdapterResult<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_eq_defaults() {
        let clause = WhereClause::eq("email", "alice@example.com");
        assert_eq!(clause.operator, Operator::Eq);
        assert!(clause.connector.is_none());
        assert_eq!(clause.value_str(), Some("alice@example.com"));
    }

    #[test]
    fn test_where_clause_deserializes_without_operator() {
        let clause: WhereClause =
            serde_json::from_value(serde_json::json!({"field": "token", "value": "t1"})).unwrap();
        assert_eq!(clause.operator, Operator::Eq);
        assert_eq!(clause.field, "token");
    }

    #[test]
    fn test_connector_serializes_uppercase() {
        let clause = WhereClause::eq("a", 1).or();
        let json = serde_json::to_value(&clause).unwrap();
        assert_eq!(json["connector"], "OR");
    }
}
