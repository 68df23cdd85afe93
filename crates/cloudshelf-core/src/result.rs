//! Convenience result type alias for Cloudshelf.

use crate::error::AppError;

/// A specialized `Result` type for Cloudshelf operations.
pub type AppResult<T> = Result<T, AppError>;
