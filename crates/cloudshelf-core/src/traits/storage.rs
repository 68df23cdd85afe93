//! Storage provider trait: the capability contract every backend Facade
//! satisfies.
//!
//! Propagation style is uniform across backends. [`StorageProvider::test_connection`]
//! never fails and reports through [`ConnectionStatus`];
//! [`StorageProvider::file_exists`] turns not-found into `Ok(false)` and
//! propagates every other failure; the remaining operations propagate
//! classified [`AppError`](crate::AppError)s. Wrap any result in
//! [`OperationResult`](crate::types::OperationResult) at the IPC boundary.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::result::AppResult;
use crate::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, ListOptions, ListResult, PreviewContent,
    ProgressCallback, ProviderType, SearchOptions, SearchResult, UploadOutcome,
};

/// Trait for object storage backends.
///
/// Implementations hold an immutable, normalized profile and their own
/// transport client; no per-object state is cached between calls.
#[async_trait]
pub trait StorageProvider: Send + Sync + std::fmt::Debug + 'static {
    /// Backend type of this Facade.
    fn provider_type(&self) -> ProviderType;

    /// Bucket, container, or repository this Facade addresses.
    fn bucket(&self) -> &str;

    /// Cheapest call proving reachability and credential validity.
    async fn test_connection(&self) -> ConnectionStatus;

    /// Stream a local file to `key`.
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        progress: Option<ProgressCallback>,
    ) -> AppResult<UploadOutcome>;

    /// Stream `key` to a local file. The partially written file is left for
    /// the caller to clean up when an error is returned.
    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> AppResult<()>;

    /// Delete one object. Deleting a missing key succeeds.
    async fn delete_file(&self, key: &str) -> AppResult<()>;

    /// Delete many objects in backend-legal batches, continuing past failures.
    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome>;

    /// List one page.
    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult>;

    /// Case-insensitive substring search over every key under `options.prefix`.
    async fn search_files(&self, term: &str, options: &SearchOptions) -> AppResult<SearchResult> {
        crate::search::search_listing(self, term, options).await
    }

    /// Address for `key`: custom domain, else default public endpoint, else
    /// a signed URL with the configured default lifetime.
    async fn get_public_url(&self, key: &str) -> AppResult<String>;

    /// Time-limited signed URL. Backends that cannot sign fall back to
    /// [`StorageProvider::get_public_url`].
    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>)
    -> AppResult<String>;

    /// Whether `key` exists.
    async fn file_exists(&self, key: &str) -> AppResult<bool> {
        match self.get_file_info(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Normalized metadata for `key`.
    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo>;

    /// Size-gated inline preview of `key`.
    async fn get_file_content(&self, key: &str, max_size: Option<u64>)
    -> AppResult<PreviewContent>;
}
