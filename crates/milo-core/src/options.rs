// Store and auth option structs.
//
// Both deserialize from the `[store]` and `[auth]` tables of the server
// config file. Every field has a default so an empty table is valid.

use serde::{Deserialize, Serialize};

// ─── Store Options ───────────────────────────────────────────────

/// Which document store backend to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store, for development and tests.
    #[default]
    Memory,
    Mongodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StoreOptions {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string (MongoDB backend only).
    #[serde(default = "default_store_uri")]
    pub uri: String,

    /// Database name (MongoDB backend only).
    #[serde(default = "default_store_database")]
    pub database: String,
}

fn default_store_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_store_database() -> String {
    "milo".to_string()
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            uri: default_store_uri(),
            database: default_store_database(),
        }
    }
}

impl StoreOptions {
    pub fn mongodb(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            backend: StoreBackend::Mongodb,
            uri: uri.into(),
            database: database.into(),
        }
    }
}

// ─── Auth Options ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AuthOptions {
    /// Emit `debug!` events for every adapter call (default: true).
    #[serde(default = "default_true")]
    pub debug_logs: bool,

    /// Return expired sessions from token lookups instead of treating them
    /// as absent (default: false).
    #[serde(default)]
    pub lenient_session_expiry: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            debug_logs: true,
            lenient_session_expiry: false,
        }
    }
}

impl AuthOptions {
    pub fn lenient_session_expiry(mut self, lenient: bool) -> Self {
        self.lenient_session_expiry = lenient;
        self
    }

    pub fn debug_logs(mut self, enabled: bool) -> Self {
        self.debug_logs = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_tables_use_defaults() {
        let store: StoreOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(store.backend, StoreBackend::Memory);
        assert_eq!(store.database, "milo");

        let auth: AuthOptions = serde_json::from_str("{}").unwrap();
        assert!(auth.debug_logs);
        assert!(!auth.lenient_session_expiry);
    }

    #[test]
    fn test_backend_parses_lowercase() {
        let store: StoreOptions =
            serde_json::from_str(r#"{"backend": "mongodb", "database": "coach"}"#).unwrap();
        assert_eq!(store.backend, StoreBackend::Mongodb);
        assert_eq!(store.database, "coach");
    }
}
