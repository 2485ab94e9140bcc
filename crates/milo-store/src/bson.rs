// JSON ⇄ BSON conversion and index-query translation for the MongoDB backend.

use std::ops::Bound;

use mongodb::bson::{doc, Bson, Document as BsonDocument};
use serde_json::Value;

use crate::document::{Document, IndexQuery, Order};
use crate::schema::{IndexDef, CREATION_TIME};

/// Convert serde_json::Value to MongoDB BSON.
pub fn json_to_bson(v: &Value) -> Bson {
    match v {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else if let Some(f) = n.as_f64() {
                Bson::Double(f)
            } else {
                Bson::String(n.to_string())
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(arr) => Bson::Array(arr.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(to_bson_doc(map)),
    }
}

/// Convert BSON to serde_json::Value.
pub fn bson_to_json(b: &Bson) -> Value {
    match b {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => serde_json::json!(*b),
        Bson::Int32(i) => serde_json::json!(*i),
        Bson::Int64(i) => serde_json::json!(*i),
        Bson::Double(f) => serde_json::json!(*f),
        Bson::String(s) => serde_json::json!(s),
        Bson::ObjectId(oid) => serde_json::json!(oid.to_hex()),
        Bson::Array(arr) => Value::Array(arr.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(from_bson_doc(doc)),
        Bson::DateTime(dt) => serde_json::json!(dt.timestamp_millis()),
        _ => Value::Null,
    }
}

pub fn to_bson_doc(map: &Document) -> BsonDocument {
    let mut doc = BsonDocument::new();
    for (k, v) in map {
        doc.insert(k.clone(), json_to_bson(v));
    }
    doc
}

pub fn from_bson_doc(doc: &BsonDocument) -> Document {
    doc.iter()
        .map(|(k, v)| (k.clone(), bson_to_json(v)))
        .collect()
}

/// Build the `$set` / `$unset` update for a patch. Null fields are unset.
/// Returns `None` when the patch changes nothing.
pub fn build_patch(fields: &Document) -> Option<BsonDocument> {
    let mut set = BsonDocument::new();
    let mut unset = BsonDocument::new();
    for (k, v) in fields {
        if k == crate::schema::ID || k == CREATION_TIME {
            continue;
        }
        if v.is_null() {
            unset.insert(k.clone(), "");
        } else {
            set.insert(k.clone(), json_to_bson(v));
        }
    }
    let mut update = BsonDocument::new();
    if !set.is_empty() {
        update.insert("$set", set);
    }
    if !unset.is_empty() {
        update.insert("$unset", unset);
    }
    (!update.is_empty()).then_some(update)
}

/// Translate an index query into a find filter.
pub fn build_filter(query: &IndexQuery) -> BsonDocument {
    let mut filter = BsonDocument::new();
    for (field, value) in query.eq.iter().chain(query.filter.iter()) {
        filter.insert(field.clone(), json_to_bson(value));
    }
    if let Some(range) = &query.range {
        let mut cond = BsonDocument::new();
        match &range.lower {
            Bound::Included(v) => {
                cond.insert("$gte", json_to_bson(v));
            }
            Bound::Excluded(v) => {
                cond.insert("$gt", json_to_bson(v));
            }
            Bound::Unbounded => {}
        }
        match &range.upper {
            Bound::Included(v) => {
                cond.insert("$lte", json_to_bson(v));
            }
            Bound::Excluded(v) => {
                cond.insert("$lt", json_to_bson(v));
            }
            Bound::Unbounded => {}
        }
        if !cond.is_empty() {
            filter.insert(range.field.clone(), cond);
        }
    }
    filter
}

/// Sort on the index fields, then creation time.
pub fn build_sort(index: &IndexDef, order: Order) -> BsonDocument {
    let direction = match order {
        Order::Asc => 1,
        Order::Desc => -1,
    };
    let mut sort = BsonDocument::new();
    for field in index.fields.iter().chain(std::iter::once(&CREATION_TIME)) {
        sort.insert(*field, direction);
    }
    sort
}

/// Key document for creating an index.
pub fn index_keys(index: &IndexDef) -> BsonDocument {
    let mut keys = doc! {};
    for field in index.fields {
        keys.insert(*field, 1);
    }
    keys
}
