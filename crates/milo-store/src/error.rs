use milo_core::error::MiloError;

/// Document store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The query names an unknown index or uses fields out of index order.
    #[error("Invalid query on {table}: {reason}")]
    InvalidQuery { table: &'static str, reason: String },

    #[error("Document {id} not found in {table}")]
    DocumentNotFound { table: &'static str, id: String },

    /// A stored document could not be decoded into its model.
    #[error("Malformed document in {table}: {reason}")]
    Malformed { table: &'static str, reason: String },

    /// Backend (driver / network) failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn invalid_query(table: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            table,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for MiloError {
    fn from(e: StoreError) -> Self {
        MiloError::Database(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
