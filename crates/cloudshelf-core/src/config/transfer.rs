//! Transfer, preview, and URL tuning shared by every provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Minimum part size accepted by S3-dialect multipart APIs.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Tuning knobs for uploads, downloads, previews, and signed URLs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransferConfig {
    /// Largest object (bytes) `get_file_content` will materialize.
    #[serde(default = "default_preview_max")]
    #[validate(range(min = 1))]
    pub preview_max_bytes: u64,
    /// Default lifetime of signed URLs in seconds.
    #[serde(default = "default_presign_expiry")]
    #[validate(range(min = 1, max = 604_800))]
    pub presign_expiry_secs: u64,
    /// Files larger than this use multipart/resumable upload where supported.
    #[serde(default = "default_multipart_threshold")]
    #[validate(range(min = 5_242_880))]
    pub multipart_threshold_bytes: u64,
    /// Size of each multipart part.
    #[serde(default = "default_part_size")]
    #[validate(range(min = 5_242_880, max = 104_857_600))]
    pub part_size_bytes: u64,
    /// Minimum spacing between progress callbacks in milliseconds.
    #[serde(default = "default_progress_interval")]
    #[validate(range(min = 50))]
    pub progress_interval_ms: u64,
    /// Idle timeout for HTTP transports in seconds: the longest wait for the
    /// next bytes of a response, not a deadline on the whole transfer.
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
    /// Page size used when search walks a listing.
    #[serde(default = "default_search_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub search_page_size: u32,
}

impl TransferConfig {
    /// Default signed URL lifetime.
    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }

    /// Minimum spacing between progress callbacks.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Idle timeout between reads.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            preview_max_bytes: default_preview_max(),
            presign_expiry_secs: default_presign_expiry(),
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
            progress_interval_ms: default_progress_interval(),
            request_timeout_secs: default_request_timeout(),
            search_page_size: default_search_page_size(),
        }
    }
}

fn default_preview_max() -> u64 {
    1_048_576 // 1 MiB
}

fn default_presign_expiry() -> u64 {
    900
}

fn default_multipart_threshold() -> u64 {
    16_777_216 // 16 MiB
}

fn default_part_size() -> u64 {
    8_388_608 // 8 MiB
}

fn default_progress_interval() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    300
}

fn default_search_page_size() -> u32 {
    1000
}
