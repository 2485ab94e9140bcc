// Secondary storage: the key/value cache the auth framework uses for session
// caching and other short-lived data. TTLs are in seconds.

use async_trait::async_trait;

/// A secondary key-value storage backend with TTL support.
#[async_trait]
pub trait SecondaryStorage: Send + Sync + std::fmt::Debug {
    /// Get a value by key. Returns `None` if the key doesn't exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<String>, SecondaryStorageError>;

    /// Set a key-value pair with an optional TTL in seconds.
    /// `None` or `Some(0)` means the entry never expires.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<u64>,
    ) -> Result<(), SecondaryStorageError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), SecondaryStorageError>;
}

/// Errors from secondary storage operations.
#[derive(Debug, thiserror::Error)]
pub enum SecondaryStorageError {
    #[error("Secondary storage operation failed: {0}")]
    OperationFailed(String),
}
