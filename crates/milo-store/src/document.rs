// The document store backend trait and its index-only query model.
//
// Documents are JSON objects. Backends assign `_id` and `_creationTime` on
// insert. Reads go through named indexes: equality on a prefix of the index
// fields, an optional range on the next field, then an optional post-index
// equality filter. Anything else is rejected.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::schema::{IndexDef, Table, CREATION_TIME, ID};

/// A stored document.
pub type Document = Map<String, Value>;

/// Result of an atomic insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// No document matched the index key; the new document has this id.
    Inserted(String),
    /// A document with the same index key already exists.
    Existing(Document),
}

/// Result order. Index field values first, then creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Range on the index field that follows the equality prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFilter {
    pub field: String,
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

/// An index-backed query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub index: String,
    pub eq: Vec<(String, Value)>,
    pub range: Option<RangeFilter>,
    pub filter: Vec<(String, Value)>,
    pub order: Order,
    pub limit: Option<usize>,
    conflict: Option<String>,
}

impl IndexQuery {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            eq: Vec::new(),
            range: None,
            filter: Vec::new(),
            order: Order::Asc,
            limit: None,
            conflict: None,
        }
    }

    /// Equality on the next index field.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bound(field.into(), Some(Bound::Excluded(value.into())), None)
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bound(field.into(), Some(Bound::Included(value.into())), None)
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bound(field.into(), None, Some(Bound::Excluded(value.into())))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bound(field.into(), None, Some(Bound::Included(value.into())))
    }

    /// Equality applied after the index scan.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.push((field.into(), value.into()));
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn bound(
        mut self,
        field: String,
        lower: Option<Bound<Value>>,
        upper: Option<Bound<Value>>,
    ) -> Self {
        let range = self.range.get_or_insert_with(|| RangeFilter {
            field: field.clone(),
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        });
        if range.field != field {
            self.conflict = Some(format!(
                "range on both `{}` and `{field}`",
                range.field
            ));
            return self;
        }
        if let Some(lower) = lower {
            range.lower = lower;
        }
        if let Some(upper) = upper {
            range.upper = upper;
        }
        self
    }

    /// Check the query against the table's indexes and return the index used.
    pub fn resolve(&self, table: Table) -> StoreResult<&'static IndexDef> {
        let table_name = table.name();
        if let Some(conflict) = &self.conflict {
            return Err(StoreError::invalid_query(table_name, conflict.clone()));
        }
        let index = table.index(&self.index).ok_or_else(|| {
            StoreError::invalid_query(table_name, format!("unknown index `{}`", self.index))
        })?;
        if self.eq.len() > index.fields.len() {
            return Err(StoreError::invalid_query(
                table_name,
                format!("`{}` has only {} fields", index.name, index.fields.len()),
            ));
        }
        for ((field, _), expected) in self.eq.iter().zip(index.fields) {
            if field != expected {
                return Err(StoreError::invalid_query(
                    table_name,
                    format!(
                        "`{field}` is not the next field of `{}` (expected `{expected}`)",
                        index.name
                    ),
                ));
            }
        }
        if let Some(range) = &self.range {
            match index.fields.get(self.eq.len()) {
                Some(next) if *next == range.field => {}
                _ => {
                    return Err(StoreError::invalid_query(
                        table_name,
                        format!(
                            "range field `{}` does not follow the equality prefix of `{}`",
                            range.field, index.name
                        ),
                    ))
                }
            }
        }
        Ok(index)
    }

    /// Whether a document satisfies every condition of this query.
    pub fn matches(&self, doc: &Document) -> bool {
        let eq_ok = self
            .eq
            .iter()
            .chain(self.filter.iter())
            .all(|(field, value)| {
                compare_values(field_value(doc, field), value) == Ordering::Equal
            });
        if !eq_ok {
            return false;
        }
        match &self.range {
            Some(range) => in_range(field_value(doc, &range.field), &range.lower, &range.upper),
            None => true,
        }
    }
}

// ─── Backend Trait ───────────────────────────────────────────────

/// A document store backend.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Insert a document, returning its generated id.
    async fn insert(&self, table: Table, doc: Document) -> StoreResult<String>;

    /// Insert unless a document with the same values for `index`'s fields
    /// already exists. Check and insert are one atomic step.
    async fn insert_if_absent(
        &self,
        table: Table,
        index: &str,
        doc: Document,
    ) -> StoreResult<InsertOutcome>;

    async fn get(&self, table: Table, id: &str) -> StoreResult<Option<Document>>;

    /// Merge `fields` into a document. A null value removes the field.
    /// Returns the patched document.
    async fn patch(&self, table: Table, id: &str, fields: Document) -> StoreResult<Document>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, table: Table, id: &str) -> StoreResult<bool>;

    async fn query(&self, table: Table, query: &IndexQuery) -> StoreResult<Vec<Document>>;

    /// First result of `query`, if any.
    async fn first(&self, table: Table, query: IndexQuery) -> StoreResult<Option<Document>> {
        let mut docs = self.query(table, &query.limit(1)).await?;
        Ok(if docs.is_empty() { None } else { Some(docs.swap_remove(0)) })
    }
}

// ─── Shared Helpers ──────────────────────────────────────────────

static NULL: Value = Value::Null;

/// A document field, missing fields read as null.
pub fn field_value<'a>(doc: &'a Document, field: &str) -> &'a Value {
    doc.get(field).unwrap_or(&NULL)
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            if a == b {
                Ordering::Equal
            } else {
                a.to_string().cmp(&b.to_string())
            }
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn in_range(value: &Value, lower: &Bound<Value>, upper: &Bound<Value>) -> bool {
    let lower_ok = match lower {
        Bound::Included(b) => compare_values(value, b) != Ordering::Less,
        Bound::Excluded(b) => compare_values(value, b) == Ordering::Greater,
        Bound::Unbounded => true,
    };
    let upper_ok = match upper {
        Bound::Included(b) => compare_values(value, b) != Ordering::Greater,
        Bound::Excluded(b) => compare_values(value, b) == Ordering::Less,
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}

/// Order two documents by the index fields, then creation time.
pub fn compare_by_index(index: &IndexDef, a: &Document, b: &Document) -> Ordering {
    index
        .fields
        .iter()
        .chain(std::iter::once(&CREATION_TIME))
        .map(|field| compare_values(field_value(a, field), field_value(b, field)))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Stamp a new document with its id and creation time.
pub fn stamp(mut doc: Document, id: &str, creation_time: i64) -> Document {
    doc.insert(ID.to_string(), Value::String(id.to_string()));
    doc.insert(CREATION_TIME.to_string(), Value::from(creation_time));
    doc
}

/// Merge patch fields into a document. Null removes; system fields are immutable.
pub fn apply_patch(doc: &mut Document, fields: Document) {
    for (key, value) in fields {
        if key == ID || key == CREATION_TIME {
            continue;
        }
        if value.is_null() {
            doc.remove(&key);
        } else {
            doc.insert(key, value);
        }
    }
}

/// Equality query matching `doc` on every field of `index`.
pub fn key_query(table: Table, index: &str, doc: &Document) -> StoreResult<IndexQuery> {
    let def = table
        .index(index)
        .ok_or_else(|| {
            StoreError::invalid_query(table.name(), format!("unknown index `{index}`"))
        })?;
    let mut query = IndexQuery::new(index);
    for field in def.fields {
        let value = doc.get(*field).cloned().ok_or_else(|| {
            StoreError::invalid_query(table.name(), format!("document lacks index field `{field}`"))
        })?;
        query = query.eq(*field, value);
    }
    Ok(query)
}

/// Convert a serializable value into a document.
pub fn to_document<T: serde::Serialize>(table: Table, value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Malformed {
            table: table.name(),
            reason: format!("expected an object, got {other}"),
        }),
        Err(e) => Err(StoreError::Malformed {
            table: table.name(),
            reason: e.to_string(),
        }),
    }
}

/// Decode a document into its model.
pub fn from_document<T: serde::de::DeserializeOwned>(
    table: Table,
    doc: Document,
) -> StoreResult<T> {
    serde_json::from_value(Value::Object(doc)).map_err(|e| StoreError::Malformed {
        table: table.name(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_resolve_accepts_prefix_and_range() {
        let q = IndexQuery::new("by_user_feature")
            .eq("userId", "u1")
            .eq("featureId", "meal_scans")
            .gte("timestamp", 10)
            .lte("timestamp", 20);
        assert_eq!(q.resolve(Table::UsageEvents).unwrap().name, "by_user_feature");
    }

    #[test]
    fn test_resolve_rejects_non_prefix_field() {
        let q = IndexQuery::new("by_user_feature").eq("featureId", "meal_scans");
        assert!(matches!(
            q.resolve(Table::UsageEvents),
            Err(StoreError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_unknown_index_and_split_range() {
        assert!(IndexQuery::new("by_color").resolve(Table::Users).is_err());
        let q = IndexQuery::new("by_expires_at")
            .gte("expiresAt", 1)
            .lte("createdAt", 2);
        assert!(q.resolve(Table::Sessions).is_err());
        let q = IndexQuery::new("by_user_id").lt("expiresAt", 1);
        assert!(q.resolve(Table::Sessions).is_err());
    }

    #[test]
    fn test_matches_range_bounds() {
        let q = IndexQuery::new("by_timestamp").gt("timestamp", 10).lte("timestamp", 20);
        assert!(!q.matches(&doc(json!({"timestamp": 10}))));
        assert!(q.matches(&doc(json!({"timestamp": 11}))));
        assert!(q.matches(&doc(json!({"timestamp": 20}))));
        assert!(!q.matches(&doc(json!({"timestamp": 21}))));
    }

    #[test]
    fn test_missing_field_reads_as_null() {
        let q = IndexQuery::new("by_expires_at").lt("expiresAt", 100);
        // null sorts below numbers, so entries without expiry fall in the range
        assert!(q.matches(&doc(json!({"key": "k"}))));
        let q = IndexQuery::new("by_expires_at").gte("expiresAt", 0).lt("expiresAt", 100);
        assert!(!q.matches(&doc(json!({"key": "k"}))));
    }

    #[test]
    fn test_apply_patch_removes_nulls_and_keeps_system_fields() {
        let mut d = doc(json!({"_id": "a", "_creationTime": 1, "role": "admin", "name": "x"}));
        apply_patch(&mut d, doc(json!({"role": null, "name": "y", "_id": "b"})));
        assert_eq!(d.get("role"), None);
        assert_eq!(d["name"], "y");
        assert_eq!(d["_id"], "a");
    }

    #[test]
    fn test_compare_values_mixed_numbers() {
        assert_eq!(compare_values(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
    }

    #[test]
    fn test_key_query_requires_all_index_fields() {
        let d = doc(json!({"providerId": "github"}));
        assert!(key_query(Table::Accounts, "by_provider_account", &d).is_err());
        let d = doc(json!({"providerId": "github", "accountId": "123"}));
        let q = key_query(Table::Accounts, "by_provider_account", &d).unwrap();
        assert_eq!(q.eq.len(), 2);
    }
}
