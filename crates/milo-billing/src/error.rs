//! Billing error codes.
//!
//! Business outcomes (unknown product, nothing to cancel) are not errors;
//! they come back as `success: false` values. These variants cover webhook
//! rejection, invalid usage input and store failures.
//!
//! A webhook body that cannot be parsed is a server failure (`500`) so the
//! provider redelivers it; only signature faults are client errors.

use milo_core::error::{ApiError, ErrorCode, HttpStatus};
use milo_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Missing stripe signature")]
    MissingSignature,

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Webhook timestamp outside the tolerance window")]
    StaleSignature,

    #[error("Could not parse webhook body: {0}")]
    MalformedEvent(String),

    #[error("Usage amount must be at least 1, got {0}")]
    InvalidAmount(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BillingError {
    /// Client-side rejections; everything else is a server failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingSignature
                | Self::InvalidSignature
                | Self::StaleSignature
                | Self::InvalidAmount(_)
        )
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::MissingSignature => ApiError::bad_request(ErrorCode::MissingSignature),
            BillingError::InvalidSignature | BillingError::StaleSignature => {
                ApiError::bad_request(ErrorCode::InvalidSignature)
            }
            BillingError::InvalidAmount(_) => ApiError::bad_request(ErrorCode::InvalidUsageAmount),
            BillingError::MalformedEvent(_) => {
                ApiError::new(HttpStatus::InternalServerError, ErrorCode::CouldNotParseBody)
            }
            BillingError::Serialization(_) | BillingError::Store(_) => {
                ApiError::new(HttpStatus::InternalServerError, ErrorCode::WebhookError)
            }
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_mapping_hides_store_detail() {
        let api: ApiError =
            BillingError::Store(StoreError::Backend("connection reset".into())).into();
        assert_eq!(api.status, HttpStatus::InternalServerError);
        assert!(!api.message.contains("connection reset"));

        let api: ApiError = BillingError::MissingSignature.into();
        assert_eq!(api.status, HttpStatus::BadRequest);
        assert_eq!(api.message, "Missing stripe signature");
    }

    #[test]
    fn test_client_errors() {
        assert!(BillingError::StaleSignature.is_client_error());
        assert!(BillingError::InvalidAmount(0).is_client_error());
        assert!(!BillingError::Store(StoreError::Backend("x".into())).is_client_error());
    }

    #[test]
    fn test_malformed_body_is_server_error() {
        let err = BillingError::MalformedEvent("expected value".into());
        assert!(!err.is_client_error());
        let api: ApiError = err.into();
        assert_eq!(api.status, HttpStatus::InternalServerError);
        assert_eq!(api.code, ErrorCode::CouldNotParseBody);
    }
}
