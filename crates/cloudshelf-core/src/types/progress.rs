//! Transfer progress reporting types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One progress sample emitted during an upload or download.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Completion in the range `0.0..=100.0`.
    pub percent: f64,
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Total bytes expected; `0` when unknown.
    pub total: u64,
    /// Instantaneous speed in bytes per second, once a full sampling window has elapsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl TransferProgress {
    /// Whether this sample reports a finished transfer.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.transferred >= self.total
    }
}

/// Callback invoked inline with each progress sample. Must not block.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;
