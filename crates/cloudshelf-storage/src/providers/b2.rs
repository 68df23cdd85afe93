//! Backblaze B2 storage provider (native API v2).
//!
//! The account is authorized once per provider and the session (API URL,
//! download URL, bucket id, token) is cached. Listing pages on
//! `nextFileName`. Deleting a key removes every stored version, so each
//! delete first looks up the file ids. Large files are uploaded as parts
//! with a SHA-1 per part.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use cloudshelf_core::config::provider::{B2Config, BackendConfig, ProviderConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, FolderEntry, ListOptions, ListResult,
    ObjectEntry, PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch;
use crate::classify;
use crate::progress::ProgressReporter;
use crate::providers::{FacadeContext, clean_key, content_type_for, range_header};
use crate::transfer;
use crate::url::{UrlPlan, encode_key, encode_query};

const DEFAULT_API_BASE: &str = "https://api.backblazeb2.com";
/// Versions requested per `b2_list_file_versions` call.
const VERSION_PAGE_SIZE: u32 = 100;

/// Backblaze B2 storage provider.
#[derive(Debug, Clone)]
pub struct B2StorageProvider {
    ctx: FacadeContext,
    config: B2Config,
    client: Client,
    api_base: String,
    session: OnceCell<Session>,
}

/// Result of `b2_authorize_account` plus the resolved bucket id.
#[derive(Clone)]
struct Session {
    token: String,
    api_url: String,
    download_url: String,
    bucket_id: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("api_url", &self.api_url)
            .field("download_url", &self.download_url)
            .field("bucket_id", &self.bucket_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
    #[serde(default)]
    allowed: Allowed,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Allowed {
    bucket_id: Option<String>,
    bucket_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketList {
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bucket {
    bucket_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileVersion {
    file_name: String,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    content_length: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content_sha1: Option<String>,
    #[serde(default)]
    upload_timestamp: Option<i64>,
    action: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileNames {
    files: Vec<FileVersion>,
    #[serde(default)]
    next_file_name: Option<String>,
    #[serde(default)]
    next_file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTarget {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartedFile {
    file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAuthorization {
    authorization_token: String,
}

impl FileVersion {
    fn modified(&self) -> Option<DateTime<Utc>> {
        self.upload_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// B2 reports `none` as the SHA-1 of large files.
    fn sha1(&self) -> Option<String> {
        self.content_sha1
            .clone()
            .filter(|s| !s.is_empty() && s != "none")
    }

    fn into_entry(self) -> ObjectEntry {
        let modified = self.modified();
        let sha1 = self.sha1();
        ObjectEntry::new(self.file_name, self.content_length)
            .modified(modified)
            .etag(sha1)
    }

    fn into_info(self) -> FileInfo {
        FileInfo {
            last_modified: self.modified(),
            etag: self.sha1(),
            content_type: self.content_type,
            size: self.content_length,
            key: self.file_name,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }
}

/// Split a `b2_list_file_names` page into objects and folders.
fn split_page(files: Vec<FileVersion>) -> (Vec<ObjectEntry>, Vec<FolderEntry>) {
    let mut objects = Vec::new();
    let mut folders = Vec::new();
    for file in files {
        match file.action.as_str() {
            "folder" => folders.push(FolderEntry::new(file.file_name)),
            "upload" => objects.push(file.into_entry()),
            _ => {}
        }
    }
    (objects, folders)
}

impl B2StorageProvider {
    /// Create a provider from a normalized profile. No request is made until
    /// the first operation.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::B2(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a b2 profile"));
        };
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(bucket = %config.bucket, "Initialized B2 storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            api_base,
            session: OnceCell::new(),
        })
    }

    async fn session(&self) -> AppResult<&Session> {
        self.session.get_or_try_init(|| self.authorize()).await
    }

    async fn authorize(&self) -> AppResult<Session> {
        let response = self
            .client
            .get(format!("{}/b2api/v2/b2_authorize_account", self.api_base))
            .basic_auth(&self.config.key_id, Some(&self.config.application_key))
            .send()
            .await
            .map_err(classify::transport)?;
        let auth: AuthorizeResponse = classify::read_json(response).await?;

        let bucket_id = match auth.allowed {
            Allowed {
                bucket_id: Some(id),
                bucket_name: Some(name),
            } if name == self.config.bucket => id,
            _ => {
                let response = self
                    .client
                    .post(format!("{}/b2api/v2/b2_list_buckets", auth.api_url))
                    .header(AUTHORIZATION, &auth.authorization_token)
                    .json(&json!({
                        "accountId": auth.account_id,
                        "bucketName": self.config.bucket,
                    }))
                    .send()
                    .await
                    .map_err(classify::transport)?;
                let list: BucketList = classify::read_json(response).await?;
                list.buckets
                    .into_iter()
                    .next()
                    .map(|b| b.bucket_id)
                    .ok_or_else(|| {
                        AppError::not_found(format!("Bucket {} does not exist", self.config.bucket))
                    })?
            }
        };
        debug!(bucket = %self.config.bucket, api_url = %auth.api_url, "Authorized B2 account");
        Ok(Session {
            token: auth.authorization_token,
            api_url: auth.api_url,
            download_url: auth.download_url,
            bucket_id,
        })
    }

    /// Call a JSON API operation.
    async fn call<T: DeserializeOwned>(&self, operation: &str, body: Value) -> AppResult<T> {
        let session = self.session().await?;
        let response = self
            .client
            .post(format!("{}/b2api/v2/{operation}", session.api_url))
            .header(AUTHORIZATION, &session.token)
            .json(&body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::read_json(response).await
    }

    async fn file_names(
        &self,
        prefix: &str,
        delimiter: &str,
        start: Option<&str>,
        max: u32,
    ) -> AppResult<FileNames> {
        let session = self.session().await?;
        let mut body = json!({
            "bucketId": session.bucket_id,
            "maxFileCount": max,
            "prefix": prefix,
        });
        if !delimiter.is_empty() {
            body["delimiter"] = Value::String(delimiter.to_string());
        }
        if let Some(start) = start {
            body["startFileName"] = Value::String(start.to_string());
        }
        self.call("b2_list_file_names", body).await
    }

    /// Current version of exactly `key`.
    async fn lookup(&self, key: &str) -> AppResult<FileVersion> {
        let page = self.file_names(key, "", Some(key), 1).await?;
        page.files
            .into_iter()
            .find(|f| f.file_name == key && f.action == "upload")
            .ok_or_else(|| AppError::not_found(format!("{key} does not exist")))
    }

    /// Every stored version of exactly `key`, following the version cursor
    /// for as long as it stays on `key`.
    async fn versions(&self, key: &str) -> AppResult<Vec<FileVersion>> {
        let session = self.session().await?;
        let mut versions = Vec::new();
        let mut start_id: Option<String> = None;
        loop {
            let mut body = json!({
                "bucketId": session.bucket_id,
                "startFileName": key,
                "prefix": key,
                "maxFileCount": VERSION_PAGE_SIZE,
            });
            if let Some(id) = &start_id {
                body["startFileId"] = Value::String(id.clone());
            }
            let page: FileNames = self.call("b2_list_file_versions", body).await?;
            versions.extend(page.files.into_iter().filter(|f| f.file_name == key));
            match (page.next_file_name, page.next_file_id) {
                (Some(name), Some(id)) if name == key && start_id.as_ref() != Some(&id) => {
                    start_id = Some(id);
                }
                _ => return Ok(versions),
            }
        }
    }

    async fn download_url(&self, key: &str) -> AppResult<String> {
        let session = self.session().await?;
        Ok(format!(
            "{}/file/{}/{}",
            session.download_url,
            self.config.bucket,
            encode_key(key)
        ))
    }

    async fn download(&self, key: &str, range: Option<String>) -> AppResult<reqwest::Response> {
        let session = self.session().await?;
        let mut request = self
            .client
            .get(self.download_url(key).await?)
            .header(AUTHORIZATION, &session.token);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request.send().await.map_err(classify::transport)?;
        classify::ensure_success(response).await
    }

    async fn signed_url(&self, key: &str, expires: Duration) -> AppResult<String> {
        let key = clean_key(key)?;
        let session = self.session().await?;
        let auth: DownloadAuthorization = self
            .call(
                "b2_get_download_authorization",
                json!({
                    "bucketId": session.bucket_id,
                    "fileNamePrefix": key,
                    "validDurationInSeconds": expires.as_secs().clamp(1, 604_800),
                }),
            )
            .await?;
        Ok(format!(
            "{}?Authorization={}",
            self.download_url(key).await?,
            encode_query(&auth.authorization_token)
        ))
    }

    async fn upload_single(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let session = self.session().await?;
        let sha1 = transfer::sha1_of_range(local_path, 0, size).await?;
        let target: UploadTarget = self
            .call("b2_get_upload_url", json!({ "bucketId": session.bucket_id }))
            .await?;
        let body = transfer::file_part_body(local_path, 0, size, reporter.clone()).await?;
        let response = self
            .client
            .post(&target.upload_url)
            .header(AUTHORIZATION, &target.authorization_token)
            .header("X-Bz-File-Name", encode_key(key))
            .header("X-Bz-Content-Sha1", sha1)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn upload_large(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let session = self.session().await?;
        let started: StartedFile = self
            .call(
                "b2_start_large_file",
                json!({
                    "bucketId": session.bucket_id,
                    "fileName": key,
                    "contentType": content_type,
                }),
            )
            .await?;

        match self
            .upload_parts(local_path, &started.file_id, size, reporter)
            .await
        {
            Ok(part_sha1s) => {
                let _: Value = self
                    .call(
                        "b2_finish_large_file",
                        json!({ "fileId": started.file_id, "partSha1Array": part_sha1s }),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                let cancelled: AppResult<Value> = self
                    .call("b2_cancel_large_file", json!({ "fileId": started.file_id }))
                    .await;
                if let Err(cancel) = cancelled {
                    warn!(key, error = %cancel, "Failed to cancel large file upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        file_id: &str,
        size: u64,
        reporter: &ProgressReporter,
    ) -> AppResult<Vec<String>> {
        let target: UploadTarget = self
            .call("b2_get_upload_part_url", json!({ "fileId": file_id }))
            .await?;
        let mut sha1s = Vec::new();
        let ranges = transfer::part_ranges(size, self.ctx.transfer.part_size_bytes);
        for (index, (offset, len)) in ranges.into_iter().enumerate() {
            let sha1 = transfer::sha1_of_range(local_path, offset, len).await?;
            let body = transfer::file_part_body(local_path, offset, len, reporter.clone()).await?;
            let response = self
                .client
                .post(&target.upload_url)
                .header(AUTHORIZATION, &target.authorization_token)
                .header("X-Bz-Part-Number", index + 1)
                .header("X-Bz-Content-Sha1", &sha1)
                .header(CONTENT_LENGTH, len)
                .body(body)
                .send()
                .await
                .map_err(classify::transport)?;
            classify::ensure_success(response).await?;
            sha1s.push(sha1);
        }
        Ok(sha1s)
    }
}

#[async_trait]
impl StorageProvider for B2StorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::B2
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.file_names("", "", None, 1).await {
            Ok(_) => ConnectionStatus::ok(format!("Bucket {} is reachable", self.config.bucket)),
            Err(e) => ConnectionStatus::failed(&e),
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
            self.upload_large(local_path, key, size, &content_type, &reporter)
                .await?;
        } else {
            self.upload_single(local_path, key, size, &content_type, &reporter)
                .await?;
        }
        reporter.finish();
        info!(bucket = %self.config.bucket, key, bytes = size, "Uploaded file");

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
        let response = self.download(clean_key(key)?, None).await?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded file");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let key = clean_key(key)?;
        let versions = self.versions(key).await?;
        if versions.is_empty() {
            debug!(key, "Delete of missing file treated as success");
            return Ok(());
        }
        for version in versions {
            let Some(file_id) = version.file_id else {
                continue;
            };
            let result: AppResult<Value> = self
                .call(
                    "b2_delete_file_version",
                    json!({ "fileName": key, "fileId": file_id }),
                )
                .await;
            match result {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_each(keys, |key| async move { self.delete_file(&key).await }).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let page = self
            .file_names(
                &options.prefix,
                &options.delimiter,
                options.continuation_token.as_deref().filter(|t| !t.is_empty()),
                options.page_size(),
            )
            .await?;
        let (files, folders) = split_page(page.files);
        Ok(ListResult::from_parts(files, folders, page.next_file_name))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => self.download_url(clean_key(key)?).await,
            UrlPlan::Signed(expires) => self.signed_url(key, expires).await,
        }
    }

    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>) -> AppResult<String> {
        self.signed_url(key, expires_in.unwrap_or(self.ctx.urls.default_expiry()))
            .await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        Ok(self.lookup(clean_key(key)?).await?.into_info())
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self.download(&key, Some(range_header(cap))).await?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}
