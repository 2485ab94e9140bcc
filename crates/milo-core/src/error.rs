// Error taxonomy shared by every milo crate.
//
// `MiloError` is the internal error type (configuration faults, validation of
// relational fields, store failures). `ApiError` is what the HTTP boundary
// renders: a status, a stable code and a coarse message with no internal
// detail.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    Unauthorized,
    Forbidden,
    MissingSignature,
    InvalidSignature,
    CouldNotParseBody,
    InvalidUsageAmount,
    SubscriptionNotFound,
    WebhookError,
    InternalServerError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::SessionNotFound => "Session not found",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::MissingSignature => "Missing stripe signature",
            Self::InvalidSignature => "Invalid stripe signature",
            Self::CouldNotParseBody => "Could not parse body",
            Self::InvalidUsageAmount => "Usage amount must be at least 1",
            Self::SubscriptionNotFound => "No active subscription found",
            Self::WebhookError => "Webhook error",
            Self::InternalServerError => "Internal server error",
        };
        write!(f, "{msg}")
    }
}

/// HTTP status codes used by the API error system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpStatus {
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    InternalServerError = 500,
}

impl HttpStatus {
    pub fn status_code(&self) -> u16 {
        *self as u16
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_code())
    }
}

/// API error carrying an HTTP status, an error code and a client-safe message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status} {code}: {message}")]
pub struct ApiError {
    pub status: HttpStatus,
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: HttpStatus, code: ErrorCode) -> Self {
        Self {
            message: code.to_string(),
            status,
            code,
        }
    }

    pub fn bad_request(code: ErrorCode) -> Self {
        Self::new(HttpStatus::BadRequest, code)
    }

    pub fn unauthorized(code: ErrorCode) -> Self {
        Self::new(HttpStatus::Unauthorized, code)
    }

    pub fn forbidden() -> Self {
        Self::new(HttpStatus::Forbidden, ErrorCode::Forbidden)
    }

    pub fn internal() -> Self {
        Self::new(HttpStatus::InternalServerError, ErrorCode::InternalServerError)
    }

    /// JSON body for the error response.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code,
            "message": self.message,
        })
    }
}

/// Internal (non-HTTP) error.
#[derive(Debug, thiserror::Error)]
pub enum MiloError {
    /// Fatal misconfiguration, e.g. an unknown model name.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required relational field is missing or malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Document store failure, propagated unchanged.
    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(String),

}

impl From<serde_json::Error> for MiloError {
    fn from(e: serde_json::Error) -> Self {
        MiloError::Other(format!("Serialization failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_value(ErrorCode::MissingSignature).unwrap();
        assert_eq!(json, "MISSING_SIGNATURE");
    }

    #[test]
    fn test_api_error_uses_code_message() {
        let err = ApiError::bad_request(ErrorCode::MissingSignature);
        assert_eq!(err.status.status_code(), 400);
        assert_eq!(err.message, "Missing stripe signature");
        assert_eq!(err.to_json()["code"], "MISSING_SIGNATURE");
    }

    #[test]
    fn test_config_error_display() {
        let err = MiloError::Config("Unknown model: widget".into());
        assert_eq!(err.to_string(), "Configuration error: Unknown model: widget");
    }
}
