//! Storage provider Facades, one per backend type.

pub mod azure;
pub mod b2;
pub mod cos;
pub mod dropbox;
pub mod github;
pub mod local;
pub mod oss;
pub mod qiniu;
pub mod s3;
pub mod upyun;
pub mod webdav;

pub use azure::AzureStorageProvider;
pub use b2::B2StorageProvider;
pub use cos::CosStorageProvider;
pub use dropbox::DropboxStorageProvider;
pub use github::GithubStorageProvider;
pub use local::LocalStorageProvider;
pub use oss::OssStorageProvider;
pub use qiniu::QiniuStorageProvider;
pub use s3::S3StorageProvider;
pub use upyun::UpyunStorageProvider;
pub use webdav::WebDavStorageProvider;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};

use cloudshelf_core::config::provider::ProviderConfig;
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS;
use cloudshelf_core::types::{FileInfo, ProgressCallback};

use crate::http;
use crate::preview::PreviewGate;
use crate::progress::ProgressReporter;
use crate::url::UrlResolver;

/// State every Facade carries: its normalized profile, transfer tuning,
/// URL policy and preview gate.
#[derive(Debug, Clone)]
pub struct FacadeContext {
    /// Normalized profile.
    pub profile: ProviderConfig,
    /// Transfer tuning.
    pub transfer: TransferConfig,
    /// URL resolution policy.
    pub urls: UrlResolver,
    /// Preview size gate.
    pub preview: PreviewGate,
}

impl FacadeContext {
    /// Context for a profile whose backend does (or does not) expose a
    /// default public endpoint.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig, has_default_endpoint: bool) -> Self {
        let urls = UrlResolver::new(&profile, has_default_endpoint, transfer.presign_expiry());
        let preview = PreviewGate::new(transfer.preview_max_bytes);
        Self {
            profile,
            transfer,
            urls,
            preview,
        }
    }

    /// HTTP client honouring this profile's proxy and timeout.
    pub fn http_client(&self) -> AppResult<reqwest::Client> {
        http::build_client(self.profile.proxy.as_deref(), self.transfer.request_timeout())
    }

    /// Progress reporter for a transfer of `total` bytes.
    pub fn reporter(&self, progress: Option<ProgressCallback>, total: u64) -> ProgressReporter {
        ProgressReporter::new(progress, total, self.transfer.progress_interval())
    }

    /// Whether a file of `size` bytes should use multipart/resumable upload.
    pub fn use_multipart(&self, size: u64) -> bool {
        size > self.transfer.multipart_threshold_bytes
    }
}

/// MIME type for a key, guessed from its extension.
pub fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Strip leading `/` and reject keys that are empty.
pub fn clean_key(key: &str) -> AppResult<&str> {
    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(cloudshelf_core::AppError::validation("Object key must not be empty"));
    }
    Ok(key)
}

/// Text value of a response header.
pub fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Parse an RFC 1123 `Last-Modified` style date.
pub fn parse_http_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Metadata from the standard headers of a `HEAD` (or `GET`) response.
/// `class_header` names the vendor header carrying the storage class.
pub fn info_from_headers(key: &str, headers: &HeaderMap, class_header: Option<&str>) -> FileInfo {
    FileInfo {
        key: key.to_string(),
        size: header_text(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_modified: header_text(headers, LAST_MODIFIED.as_str())
            .as_deref()
            .and_then(parse_http_date),
        etag: header_text(headers, ETAG.as_str())
            .map(|e| e.trim_matches('"').to_string())
            .filter(|e| !e.is_empty()),
        content_type: header_text(headers, CONTENT_TYPE.as_str()),
        storage_class: class_header
            .and_then(|name| header_text(headers, name))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string()),
    }
}

/// `Range` header value asking for the first `cap` bytes.
pub fn range_header(cap: u64) -> String {
    format!("bytes=0-{}", cap.saturating_sub(1))
}
