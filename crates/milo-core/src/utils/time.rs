// Timestamp conversion between the wire shapes the auth framework sends
// (RFC 3339 strings or epoch millis) and chrono.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Convert epoch milliseconds to a UTC timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Parse a JSON timestamp. Accepts an RFC 3339 string or an epoch-millis number.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis),
        _ => None,
    }
}
