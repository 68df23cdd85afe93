//! Unified error types for Cloudshelf.
//!
//! Every backend maps its native failures into [`AppError`] through the
//! storage crate's classification step, so callers only ever see the kinds
//! listed in [`ErrorKind`].

use std::fmt;
use thiserror::Error;

/// Top-level error kind categorization shared by every storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The requested object, bucket, or repository was not found.
    NotFound,
    /// Credentials were rejected (invalid token, bad signature, expired key).
    Authentication,
    /// The credentials are valid but lack permission for the action.
    Authorization,
    /// The backend could not be reached (DNS, TLS, proxy, timeout).
    Network,
    /// The payload exceeds a client-enforced limit.
    PayloadTooLarge,
    /// The backend answered with something other than the expected format.
    MalformedResponse,
    /// A batch operation succeeded only for part of its input.
    PartialFailure,
    /// Input validation failed.
    Validation,
    /// A configuration error occurred.
    Configuration,
    /// A local file I/O error occurred.
    Storage,
    /// A serialization/deserialization error occurred.
    Serialization,
    /// The backend reported a failure not covered by another kind.
    ExternalService,
    /// The backend does not support the requested operation.
    NotSupported,
    /// An internal error occurred.
    Internal,
}

impl ErrorKind {
    /// Backend-agnostic description shown to users for this kind.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NotFound => "Bucket, repository, or object not found",
            Self::Authentication => "Invalid token or credentials",
            Self::Authorization => "Access denied",
            Self::Network => "Network or proxy failure",
            Self::PayloadTooLarge => "Payload too large",
            Self::MalformedResponse => "Unexpected response from the storage service",
            Self::PartialFailure => "Operation only partially succeeded",
            Self::Validation => "Invalid input",
            Self::Configuration => "Invalid configuration",
            Self::Storage => "Local file error",
            Self::Serialization => "Could not encode or decode data",
            Self::ExternalService => "Storage service error",
            Self::NotSupported => "Operation not supported by this provider",
            Self::Internal => "Internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Authentication => write!(f, "AUTHENTICATION"),
            Self::Authorization => write!(f, "AUTHORIZATION"),
            Self::Network => write!(f, "NETWORK"),
            Self::PayloadTooLarge => write!(f, "PAYLOAD_TOO_LARGE"),
            Self::MalformedResponse => write!(f, "MALFORMED_RESPONSE"),
            Self::PartialFailure => write!(f, "PARTIAL_FAILURE"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Storage => write!(f, "STORAGE"),
            Self::Serialization => write!(f, "SERIALIZATION"),
            Self::ExternalService => write!(f, "EXTERNAL_SERVICE"),
            Self::NotSupported => write!(f, "NOT_SUPPORTED"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// The unified error used throughout Cloudshelf.
///
/// `message` carries the backend's native wording; [`AppError::user_message`]
/// prefixes it with the backend-agnostic description of the kind.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    /// The category of error.
    pub kind: ErrorKind,
    /// A human-readable error message.
    pub message: String,
    /// Optional underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new application error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new application error with an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Create an authorization error.
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Create a payload-too-large error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PayloadTooLarge, message)
    }

    /// Create a malformed-response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedResponse, message)
    }

    /// Create a partial-failure error.
    pub fn partial_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PartialFailure, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    /// Create an external-service error.
    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, message)
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Message suitable for display: the kind's description plus the
    /// backend's own wording.
    pub fn user_message(&self) -> String {
        if self.message.is_empty() {
            self.kind.describe().to_string()
        } else {
            format!("{}: {}", self.kind.describe(), self.message)
        }
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(
            ErrorKind::Serialization,
            format!("JSON serialization error: {err}"),
            err,
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorKind::Storage, format!("I/O error: {err}"), err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_source(
            ErrorKind::Configuration,
            format!("Configuration error: {err}"),
            err,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_prefixes_kind_description() {
        let err = AppError::authorization("The bucket policy denies s3:ListBucket");
        assert_eq!(
            err.user_message(),
            "Access denied: The bucket policy denies s3:ListBucket"
        );
        assert_eq!(err.to_string(), "AUTHORIZATION: The bucket policy denies s3:ListBucket");
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: AppError = io.into();
        assert_eq!(err.kind, ErrorKind::Storage);
        assert!(err.source.is_some());
        assert!(err.clone().source.is_none());
    }
}
