//! The `{success, data}` / `{success: false, error}` envelope used at the
//! IPC and JSON output boundary.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::result::AppResult;

/// Failure payload carried by an [`OperationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// Machine-readable kind, e.g. `NOT_FOUND`.
    pub code: String,
    /// Backend-agnostic, human-readable message.
    pub message: String,
}

/// Discriminated result envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl<T> OperationResult<T> {
    /// Successful envelope.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed envelope.
    pub fn err(err: &AppError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OperationError::from(err)),
        }
    }
}

impl From<&AppError> for OperationError {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.kind.to_string(),
            message: err.user_message(),
        }
    }
}

impl<T> From<AppResult<T>> for OperationResult<T> {
    fn from(result: AppResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::err(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let envelope: OperationResult<u32> = Ok(7).into();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": 7}));
    }

    #[test]
    fn test_failure_shape() {
        let envelope: OperationResult<u32> =
            Err(AppError::not_found("no such key: a.txt")).into();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert!(json.get("data").is_none());
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("Bucket, repository, or object not found")
        );
    }
}
