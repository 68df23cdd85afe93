//! S3-compatible object storage provider (AWS, R2, MinIO, Wasabi, B2 S3 API).
//!
//! Propagation: every operation returns classified SDK errors; SDK retries
//! are disabled so the caller owns any retry policy. Uploads above the
//! multipart threshold use `CreateMultipartUpload`, reporting progress once
//! per part.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Builder, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SdkDateTime, Length};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier, StorageClass,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, S3Config};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteFailure, DeleteOutcome, FileInfo, FolderEntry, ListOptions,
    ListResult, ObjectEntry, PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch::{self, DEFAULT_BATCH_LIMIT};
use crate::classify;
use crate::http::CONNECT_TIMEOUT;
use crate::progress::ProgressReporter;
use crate::providers::{FacadeContext, clean_key, content_type_for};
use crate::transfer::{self, FileSink};
use crate::url::{UrlPlan, encode_key};

/// S3-compatible storage provider.
#[derive(Debug, Clone)]
pub struct S3StorageProvider {
    ctx: FacadeContext,
    config: S3Config,
    client: Client,
}

impl S3StorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::S3(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected an s3 profile"));
        };

        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
            None,
            "cloudshelf",
        );
        let mut builder = Builder::new()
            .behavior_version_latest()
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .read_timeout(transfer.request_timeout())
                    .build(),
            );
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "Initialized S3 storage provider"
        );

        Ok(Self {
            ctx: FacadeContext::new(profile, transfer, true),
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    fn default_url(&self, key: &str) -> String {
        let key = encode_key(key.trim_start_matches('/'));
        match &self.config.endpoint {
            Some(endpoint) if self.config.force_path_style => {
                format!("{endpoint}/{}/{key}", self.config.bucket)
            }
            Some(endpoint) => match endpoint.split_once("://") {
                Some((scheme, host)) => format!("{scheme}://{}.{host}/{key}", self.config.bucket),
                None => format!("{endpoint}/{}/{key}", self.config.bucket),
            },
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{key}",
                self.config.bucket, self.config.region
            ),
        }
    }

    async fn sign(&self, key: &str, expires: Duration) -> AppResult<String> {
        let config = PresigningConfig::expires_in(expires)
            .map_err(|e| AppError::validation(format!("Invalid signed URL lifetime: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(clean_key(key)?)
            .presigned(config)
            .await
            .map_err(|e| sdk_error("Failed to sign URL", e))?;
        Ok(request.uri().to_string())
    }

    async fn put_single(&self, local_path: &Path, key: &str, content_type: &str) -> AppResult<()> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to open {}", local_path.display()),
                e,
            )
        })?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(body);
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        request
            .send()
            .await
            .map_err(|e| sdk_error("Upload failed", e))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type);
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        let created = request
            .send()
            .await
            .map_err(|e| sdk_error("Failed to start multipart upload", e))?;
        let upload_id = created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| AppError::malformed("Multipart upload has no upload id"))?;

        let result = self
            .upload_parts(local_path, key, size, &upload_id, reporter)
            .await;
        match result {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| sdk_error("Failed to complete multipart upload", e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        upload_id: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let ranges = transfer::part_ranges(size, self.ctx.transfer.part_size_bytes);
        for (index, (offset, len)) in ranges.into_iter().enumerate() {
            let number = index as i32 + 1;
            let body = ByteStream::read_from()
                .path(local_path)
                .offset(offset)
                .length(Length::Exact(len))
                .build()
                .await
                .map_err(|e| {
                    AppError::with_source(
                        ErrorKind::Storage,
                        format!("Failed to read part {number} of {}", local_path.display()),
                        e,
                    )
                })?;
            let output = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_error(&format!("Failed to upload part {number}"), e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(number)
                    .build(),
            );
            reporter.advance(len);
        }
        Ok(parts)
    }

    async fn delete_chunk(&self, keys: Vec<String>) -> AppResult<DeleteOutcome> {
        let objects = keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| AppError::validation(format!("Invalid key '{key}': {e}")))
            })
            .collect::<AppResult<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| AppError::validation(format!("Invalid delete request: {e}")))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.config.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| sdk_error("Batch delete failed", e))?;

        let deleted = output
            .deleted()
            .iter()
            .filter_map(|d| d.key().map(str::to_string))
            .collect();
        let failed = output
            .errors()
            .iter()
            .map(|e| DeleteFailure {
                key: e.key().unwrap_or_default().to_string(),
                error: format!(
                    "{}: {}",
                    e.code().unwrap_or("Error"),
                    e.message().unwrap_or("delete failed")
                ),
            })
            .collect();
        Ok(DeleteOutcome { deleted, failed })
    }
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::S3
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self
            .client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
        {
            Ok(_) => ConnectionStatus::ok(format!("Bucket {} is reachable", self.config.bucket)),
            Err(e) => ConnectionStatus::failed(&sdk_error("Connection test failed", e)),
        }
    }

    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        progress: Option<ProgressCallback>,
    ) -> AppResult<UploadOutcome> {
        let key = clean_key(key)?;
        let size = transfer::local_file_size(local_path).await?;
        let content_type = content_type_for(key);
        let reporter = self.ctx.reporter(progress, size);

        if self.ctx.use_multipart(size) {
            self.put_multipart(local_path, key, size, &content_type, &reporter)
                .await?;
        } else {
            self.put_single(local_path, key, &content_type).await?;
            reporter.advance(size);
        }
        reporter.finish();
        info!(bucket = %self.config.bucket, key, bytes = size, "Uploaded object");

        let url = if self.ctx.urls.is_public() {
            self.get_public_url(key).await.ok()
        } else {
            None
        };
        Ok(UploadOutcome {
            key: key.to_string(),
            bucket: self.config.bucket.clone(),
            url,
        })
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> AppResult<()> {
        let output = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(clean_key(key)?)
            .send()
            .await
            .map_err(|e| sdk_error("Download failed", e))?;
        let total = output.content_length().unwrap_or(0).max(0) as u64;
        let mut sink = FileSink::create(local_path, self.ctx.reporter(progress, total)).await?;
        let mut body = output.body;
        while let Some(chunk) = body.try_next().await.map_err(|e| {
            AppError::with_source(ErrorKind::Network, "Download stream failed", e)
        })? {
            sink.write(&chunk).await?;
        }
        let bytes = sink.finish().await?;
        debug!(key, bytes, "Downloaded object");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(clean_key(key)?)
            .send()
            .await
            .map_err(|e| sdk_error("Delete failed", e))?;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_in_chunks(keys, DEFAULT_BATCH_LIMIT, |chunk| self.delete_chunk(chunk)).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(&options.prefix)
            .max_keys(options.page_size() as i32);
        if !options.delimiter.is_empty() {
            request = request.delimiter(&options.delimiter);
        }
        if let Some(token) = &options.continuation_token {
            request = request.continuation_token(token);
        }
        let output = request
            .send()
            .await
            .map_err(|e| sdk_error("Listing failed", e))?;

        let files = output
            .contents()
            .iter()
            .filter_map(|item| {
                let key = item.key()?;
                Some(
                    ObjectEntry::new(key, item.size().unwrap_or(0).max(0) as u64)
                        .modified(item.last_modified().and_then(to_chrono))
                        .etag(item.e_tag())
                        .storage_class(item.storage_class().map(|c| c.as_str())),
                )
            })
            .collect();
        let folders = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(FolderEntry::new)
            .collect();
        let next = next_token(output.next_continuation_token(), output.is_truncated());
        Ok(ListResult::from_parts(files, folders, next))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.default_url(key)),
            UrlPlan::Signed(expires) => self.sign(key, expires).await,
        }
    }

    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>) -> AppResult<String> {
        self.sign(key, expires_in.unwrap_or(self.ctx.urls.default_expiry()))
            .await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error(&format!("Object {key}"), e))?;
        Ok(FileInfo {
            key: key.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            last_modified: head.last_modified().and_then(to_chrono),
            etag: head.e_tag().map(|e| e.trim_matches('"').to_string()),
            content_type: head.content_type().map(str::to_string),
            storage_class: head
                .storage_class()
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS.to_string()),
        })
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let output = self
                    .client
                    .get_object()
                    .bucket(&self.config.bucket)
                    .key(&key)
                    .range(format!("bytes=0-{}", cap - 1))
                    .send()
                    .await
                    .map_err(|e| sdk_error("Preview download failed", e))?;
                let mut body = output.body;
                let mut buffer = Vec::new();
                while let Some(chunk) = body.try_next().await.map_err(|e| {
                    AppError::with_source(ErrorKind::Network, "Preview stream failed", e)
                })? {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() as u64 >= cap {
                        buffer.truncate(cap as usize);
                        break;
                    }
                }
                Ok(buffer)
            })
            .await
    }
}

fn to_chrono(at: &SdkDateTime) -> Option<DateTime<Utc>> {
    at.to_millis()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Classify an SDK failure: dispatch and timeout errors are network
/// failures, service errors are classified by HTTP status and S3 error code.
fn sdk_error<E>(context: &str, err: SdkError<E>) -> AppError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let kind = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ErrorKind::Network,
        SdkError::ResponseError(_) => ErrorKind::MalformedResponse,
        SdkError::ConstructionFailure(_) => ErrorKind::Validation,
        _ => classify::kind_for(status.unwrap_or(0), err.code()),
    };
    let detail = match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        (Some(code), None) => code.to_string(),
        _ => match status {
            Some(status) => format!("HTTP {status}"),
            None => DisplayErrorContext(&err).to_string(),
        },
    };
    AppError::with_source(kind, format!("{context}: {detail}"), err)
}

/// Cursor for the next ListObjectsV2 page. Some S3-compatible services echo
/// a token on the final page, so `IsTruncated = false` overrides it.
fn next_token(token: Option<&str>, is_truncated: Option<bool>) -> Option<String> {
    token
        .filter(|t| !t.is_empty() && is_truncated.unwrap_or(true))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_token_respects_truncation_flag() {
        assert_eq!(next_token(Some("t1"), Some(true)).as_deref(), Some("t1"));
        assert_eq!(next_token(Some("t1"), None).as_deref(), Some("t1"));
        assert_eq!(next_token(Some("stale"), Some(false)), None);
        assert_eq!(next_token(Some(""), Some(true)), None);
        assert_eq!(next_token(None, Some(true)), None);
    }

    fn provider(endpoint: Option<&str>, path_style: bool, private: bool) -> S3StorageProvider {
        let mut profile = ProviderConfig::new(BackendConfig::S3(S3Config {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            bucket: "photos".into(),
            region: "eu-west-1".into(),
            endpoint: endpoint.map(str::to_string),
            force_path_style: path_style,
            storage_class: None,
        }));
        profile.private = private;
        S3StorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap()
    }

    #[test]
    fn test_default_urls() {
        assert_eq!(
            provider(None, false, false).default_url("a b.png"),
            "https://photos.s3.eu-west-1.amazonaws.com/a%20b.png"
        );
        assert_eq!(
            provider(Some("http://127.0.0.1:9000"), true, false).default_url("x/y.txt"),
            "http://127.0.0.1:9000/photos/x/y.txt"
        );
        assert_eq!(
            provider(Some("https://r2.example.com"), false, false).default_url("k"),
            "https://photos.r2.example.com/k"
        );
    }

    #[tokio::test]
    async fn test_public_url_is_unsigned_for_public_profiles() {
        let url = provider(None, false, false).get_public_url("k.txt").await.unwrap();
        assert!(!url.contains("X-Amz-Signature"));
    }

    #[tokio::test]
    async fn test_private_profile_gets_presigned_url() {
        let url = provider(None, false, true).get_public_url("k.txt").await.unwrap();
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=900"));

        let url = provider(None, false, false)
            .get_presigned_url("k.txt", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Expires=60"));
    }
}
