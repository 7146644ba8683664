//! Error types for FreemKit
//!
//! This module provides the error hierarchy for the webhook pipeline using
//! `thiserror`. [`WebhookError`] is the taxonomy surfaced to webhook callers;
//! the remaining enums cover configuration, storage and the Kit API client.

use http::StatusCode;
use thiserror::Error;

/// The main error type for FreemKit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Webhook pipeline errors
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Kit API client errors
    #[error("Kit API error: {0}")]
    Client(#[from] ClientError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Webhook pipeline errors.
///
/// Validation-class variants are returned synchronously to the HTTP caller.
/// `ApiError` and `DbError` only occur while an event is being processed and
/// drive the queue's retry policy instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Body is not decodable JSON or carries no plugin id
    #[error("Invalid request body or missing plugin ID")]
    InvalidRequest,

    /// Plugin id has no matching tenant configuration
    #[error("Plugin ID not found in configuration")]
    InvalidPlugin,

    /// Computed HMAC does not match the supplied signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Delivery timestamp is outside the accepted window
    #[error("Webhook timestamp is outside the accepted time window.")]
    StaleWebhook,

    /// A timestamp is required by policy but none was found
    #[error("Webhook timestamp is required but missing.")]
    MissingTimestamp,

    /// Payload has no `objects.user`
    #[error("Missing user data in request.")]
    InvalidData,

    /// User email is missing or malformed
    #[error("Invalid or missing email address.")]
    InvalidEmail,

    /// Payload has no event type
    #[error("Missing event type in request.")]
    InvalidEvent,

    /// Subscription client call failed
    #[error("Processed with API errors: {0}")]
    ApiError(String),

    /// Local subscriber upsert failed
    #[error("Processed with database errors: {0}")]
    DbError(String),

    /// Queue or replay marker could not be persisted
    #[error("Unable to queue webhook: {0}")]
    Storage(String),
}

impl WebhookError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidPlugin => "invalid_plugin",
            Self::InvalidSignature => "invalid_signature",
            Self::StaleWebhook => "stale_webhook",
            Self::MissingTimestamp => "missing_timestamp",
            Self::InvalidData => "invalid_data",
            Self::InvalidEmail => "invalid_email",
            Self::InvalidEvent => "invalid_event",
            Self::ApiError(_) => "api_error",
            Self::DbError(_) => "db_error",
            Self::Storage(_) => "queue_error",
        }
    }

    /// HTTP status used when this error is returned to a webhook caller
    pub fn status_code(&self) -> StatusCode {
        if self.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    /// Whether this error is a rejection of the request itself (never retried)
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            Self::ApiError(_) | Self::DbError(_) | Self::Storage(_)
        )
    }
}

impl From<StoreError> for WebhookError {
    fn from(err: StoreError) -> Self {
        WebhookError::Storage(err.to_string())
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the settings schema
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Settings are structurally valid but semantically wrong
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Key-value and subscriber store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backing file could not be read or written
    #[error("Store I/O failed: {0}")]
    Io(String),

    /// Stored data could not be (de)serialized
    #[error("Store serialization failed: {0}")]
    Serialization(String),

    /// Subscriber record has no email
    #[error("Email is required.")]
    MissingEmail,
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Kit API client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// No access token configured
    #[error("Connect to Kit using OAuth to continue.")]
    NotConnected,

    /// Email failed validation before the request was sent
    #[error("Invalid email address format: {0}")]
    InvalidEmail(String),

    /// A form or tag id is not a positive integer
    #[error("Invalid Kit resource id: {0}")]
    InvalidId(String),

    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Kit answered with a non-success status
    #[error("Kit API returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        message: String,
    },

    /// Subscriber creation response carried no usable id
    #[error("Unable to determine subscriber ID.")]
    MissingSubscriberId,

    /// Client could not be constructed
    #[error("Invalid Kit client configuration: {0}")]
    Config(String),
}

/// Result type alias for FreemKit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for webhook pipeline operations
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for Kit client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

impl Error {
    /// Create a generic error from a string
    pub fn generic<S: Into<String>>(msg: S) -> Self {
        Error::Generic(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Webhook(WebhookError::InvalidSignature);
        assert_eq!(err.to_string(), "Webhook error: Invalid signature");
    }

    #[test]
    fn test_webhook_error_codes() {
        assert_eq!(WebhookError::InvalidRequest.code(), "invalid_request");
        assert_eq!(WebhookError::InvalidPlugin.code(), "invalid_plugin");
        assert_eq!(WebhookError::StaleWebhook.code(), "stale_webhook");
        assert_eq!(WebhookError::ApiError("x".into()).code(), "api_error");
    }

    #[test]
    fn test_validation_errors_are_bad_requests() {
        for err in [
            WebhookError::InvalidRequest,
            WebhookError::InvalidPlugin,
            WebhookError::InvalidSignature,
            WebhookError::StaleWebhook,
            WebhookError::MissingTimestamp,
            WebhookError::InvalidData,
            WebhookError::InvalidEmail,
            WebhookError::InvalidEvent,
        ] {
            assert!(err.is_validation());
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_processing_errors_are_server_errors() {
        let err = WebhookError::Storage("disk full".to_string());
        assert!(!err.is_validation());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_store_error_converts_to_storage() {
        let err: WebhookError = StoreError::Io("denied".to_string()).into();
        assert_eq!(err.code(), "queue_error");
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Api {
            status: 422,
            message: "Email address is invalid".to_string(),
        };
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("Email address is invalid"));
    }

    #[test]
    fn test_generic_error() {
        let err = Error::generic("something went wrong");
        assert_eq!(err.to_string(), "something went wrong");
    }
}
