//! Qiniu Kodo storage provider.
//!
//! Management calls (list, stat, delete, batch) are signed with a QBox
//! token; uploads carry an upload token built from a put policy. Qiniu has
//! no default public endpoint, so every profile needs a custom domain;
//! private buckets get `e`/`token` download signatures on that domain.
//!
//! Listing pages are keyed only by `marker`: a non-empty marker means more
//! results. Status 612 ("no such file or directory") on delete is success.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, QiniuConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteFailure, DeleteOutcome, FileInfo, FolderEntry, ListOptions,
    ListResult, ObjectEntry, PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch::{self, DEFAULT_BATCH_LIMIT};
use crate::classify;
use crate::progress::ProgressReporter;
use crate::providers::{FacadeContext, clean_key, content_type_for, range_header};
use crate::signing;
use crate::transfer;
use crate::url::{UrlPlan, encode_key, query_string};

/// Qiniu's "no such file or directory" status.
const NO_SUCH_FILE: u16 = 612;
/// Lifetime of upload tokens.
const UPLOAD_TOKEN_SECS: i64 = 3600;

/// Qiniu Kodo storage provider.
#[derive(Debug, Clone)]
pub struct QiniuStorageProvider {
    ctx: FacadeContext,
    config: QiniuConfig,
    client: Client,
    domain: String,
    hosts: Hosts,
}

#[derive(Debug, Clone)]
struct Hosts {
    rs: String,
    rsf: String,
    up: String,
}

impl Hosts {
    fn for_config(config: &QiniuConfig) -> Self {
        match &config.api_base {
            Some(base) => Self {
                rs: base.clone(),
                rsf: base.clone(),
                up: base.clone(),
            },
            None => Self {
                rs: format!("https://rs-{}.qiniuapi.com", config.region),
                rsf: format!("https://rsf-{}.qiniuapi.com", config.region),
                up: format!("https://up-{}.qiniup.com", config.region),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    marker: Option<String>,
    #[serde(default, rename = "commonPrefixes")]
    common_prefixes: Vec<String>,
    #[serde(default)]
    items: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListItem {
    key: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    fsize: u64,
    #[serde(default)]
    put_time: i64,
    #[serde(default, rename = "type")]
    storage_type: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatResponse {
    #[serde(default)]
    fsize: u64,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    put_time: i64,
    #[serde(default, rename = "type")]
    storage_type: u8,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    code: u16,
    #[serde(default)]
    data: Option<BatchData>,
}

#[derive(Debug, Deserialize)]
struct BatchData {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitPartsResponse {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletedPart {
    part_number: u32,
    etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteParts<'a> {
    parts: Vec<CompletedPart>,
    fname: &'a str,
    mime_type: &'a str,
}

impl QiniuStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Qiniu(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a qiniu profile"));
        };
        let domain = profile
            .custom_domain
            .clone()
            .ok_or_else(|| AppError::validation("custom_domain is required for qiniu profiles"))?;
        let hosts = Hosts::for_config(&config);
        let ctx = FacadeContext::new(profile, transfer, false);
        let client = ctx.http_client()?;
        info!(bucket = %config.bucket, region = %config.region, "Initialized Qiniu storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            domain,
            hosts,
        })
    }

    /// `base64url("bucket:key")`, the entry form used in management paths.
    fn entry(&self, key: &str) -> String {
        signing::base64_url(format!("{}:{key}", self.config.bucket).as_bytes())
    }

    fn sign(&self, data: &[u8]) -> AppResult<String> {
        let mac = signing::hmac_sha1(self.config.secret_key.as_bytes(), data)?;
        Ok(signing::base64_url(&mac))
    }

    /// QBox authorization over `path?query\n` plus a form body.
    fn qbox_token(&self, path_and_query: &str, form_body: Option<&str>) -> AppResult<String> {
        let mut data = format!("{path_and_query}\n");
        if let Some(body) = form_body {
            data.push_str(body);
        }
        Ok(format!("QBox {}:{}", self.config.access_key, self.sign(data.as_bytes())?))
    }

    fn management(
        &self,
        method: Method,
        host: &str,
        path_and_query: &str,
        form_body: Option<String>,
    ) -> AppResult<RequestBuilder> {
        let token = self.qbox_token(path_and_query, form_body.as_deref())?;
        let mut request = self
            .client
            .request(method, format!("{host}{path_and_query}"))
            .header(AUTHORIZATION, token);
        if let Some(body) = form_body {
            request = request
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body);
        }
        Ok(request)
    }

    /// Upload token scoped to `bucket:key` (overwrite allowed).
    fn upload_token(&self, key: &str) -> AppResult<String> {
        let policy = serde_json::json!({
            "scope": format!("{}:{key}", self.config.bucket),
            "deadline": Utc::now().timestamp() + UPLOAD_TOKEN_SECS,
        });
        let encoded = signing::base64_url(policy.to_string().as_bytes());
        Ok(format!(
            "{}:{}:{encoded}",
            self.config.access_key,
            self.sign(encoded.as_bytes())?
        ))
    }

    fn sign_url(&self, key: &str, expires: Duration) -> AppResult<String> {
        let key = clean_key(key)?;
        let deadline = Utc::now().timestamp() + expires.as_secs() as i64;
        let base = format!("{}/{}?e={deadline}", self.domain, encode_key(key));
        let token = format!("{}:{}", self.config.access_key, self.sign(base.as_bytes())?);
        Ok(format!("{base}&token={token}"))
    }

    /// URL the object body can be fetched from with this profile's privacy.
    fn fetch_url(&self, key: &str) -> AppResult<String> {
        if self.ctx.profile.private {
            self.sign_url(key, self.ctx.urls.default_expiry())
        } else {
            Ok(format!("{}/{}", self.domain, encode_key(clean_key(key)?)))
        }
    }

    async fn form_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let (body, size) = transfer::file_body(local_path, reporter.clone()).await?;
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let part = Part::stream_with_length(body, size)
            .file_name(file_name)
            .mime_str(content_type)
            .map_err(classify::transport)?;
        let form = Form::new()
            .text("token", self.upload_token(key)?)
            .text("key", key.to_string())
            .part("file", part);
        let response = self
            .client
            .post(format!("{}/", self.hosts.up))
            .multipart(form)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn resumable_upload(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let token = format!("UpToken {}", self.upload_token(key)?);
        let base = format!(
            "{}/buckets/{}/objects/{}/uploads",
            self.hosts.up,
            self.config.bucket,
            signing::base64_url(key.as_bytes())
        );

        let response = self
            .client
            .post(&base)
            .header(AUTHORIZATION, &token)
            .send()
            .await
            .map_err(classify::transport)?;
        let init: InitPartsResponse = classify::read_json(response).await?;
        let upload_url = format!("{base}/{}", init.upload_id);
        debug!(key, upload_id = %init.upload_id, size, "Initiated resumable upload");

        let result = self
            .upload_parts(local_path, &upload_url, &token, size, reporter)
            .await;
        let parts = match result {
            Ok(parts) => parts,
            Err(e) => {
                let abort = self
                    .client
                    .delete(&upload_url)
                    .header(AUTHORIZATION, &token)
                    .send()
                    .await;
                if let Err(abort) = abort {
                    warn!(key, error = %abort, "Failed to abort resumable upload");
                }
                return Err(e);
            }
        };

        let file_name = key.rsplit('/').next().unwrap_or(key);
        let response = self
            .client
            .post(&upload_url)
            .header(AUTHORIZATION, &token)
            .json(&CompleteParts {
                parts,
                fname: file_name,
                mime_type: content_type,
            })
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        upload_url: &str,
        token: &str,
        size: u64,
        reporter: &ProgressReporter,
    ) -> AppResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let ranges = transfer::part_ranges(size, self.ctx.transfer.part_size_bytes);
        for (index, (offset, len)) in ranges.into_iter().enumerate() {
            let part_number = index as u32 + 1;
            let body = transfer::file_part_body(local_path, offset, len, reporter.clone()).await?;
            let response = self
                .client
                .put(format!("{upload_url}/{part_number}"))
                .header(AUTHORIZATION, token)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, len)
                .body(body)
                .send()
                .await
                .map_err(classify::transport)?;
            let part: PartResponse = classify::read_json(response).await?;
            parts.push(CompletedPart {
                part_number,
                etag: part.etag,
            });
        }
        Ok(parts)
    }

    async fn stat(&self, key: &str) -> AppResult<StatResponse> {
        let response = self
            .management(Method::GET, &self.hosts.rs, &format!("/stat/{}", self.entry(key)), None)?
            .send()
            .await
            .map_err(classify::transport)?;
        classify::read_json(response).await
    }

    async fn delete_chunk(&self, keys: Vec<String>) -> AppResult<DeleteOutcome> {
        let body = keys
            .iter()
            .map(|key| format!("op=/delete/{}", self.entry(key)))
            .collect::<Vec<_>>()
            .join("&");
        let response = self
            .management(Method::POST, &self.hosts.rs, "/batch", Some(body))?
            .send()
            .await
            .map_err(classify::transport)?;

        // 298 is a partial success; an all-failed batch comes back as 400
        // with the same per-operation array.
        let status = response.status().as_u16();
        let text = response.text().await.map_err(classify::transport)?;
        let items: Vec<BatchItem> = match classify::parse_json(&text) {
            Ok(items) if matches!(status, 200 | 298 | 400) => items,
            _ => return Err(classify::http_status(status, &text)),
        };
        Ok(batch_outcome(&keys, items))
    }
}

fn batch_outcome(keys: &[String], items: Vec<BatchItem>) -> DeleteOutcome {
    let mut outcome = DeleteOutcome::default();
    for (index, key) in keys.iter().enumerate() {
        match items.get(index) {
            Some(item) if item.code == 200 || item.code == NO_SUCH_FILE => {
                outcome.deleted.push(key.clone())
            }
            Some(item) => {
                let reason = item
                    .data
                    .as_ref()
                    .and_then(|d| d.error.clone())
                    .unwrap_or_else(|| format!("code {}", item.code));
                let err = AppError::new(classify::kind_for(item.code, None), reason);
                outcome.failed.push(DeleteFailure::new(key.clone(), &err));
            }
            None => outcome.failed.push(DeleteFailure {
                key: key.clone(),
                error: "Deletion was not confirmed by the service".to_string(),
            }),
        }
    }
    outcome
}

/// Qiniu reports `putTime` in units of 100 ns.
fn put_time(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(value / 10_000)
}

fn storage_class(kind: u8) -> &'static str {
    match kind {
        1 => "LINE",
        2 => "ARCHIVE",
        3 => "DEEP_ARCHIVE",
        4 => "ARCHIVE_IR",
        _ => DEFAULT_STORAGE_CLASS,
    }
}

#[async_trait]
impl StorageProvider for QiniuStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Qiniu
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let options = ListOptions {
            max_keys: 1,
            ..ListOptions::default()
        };
        match self.list_files(&options).await {
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
            self.resumable_upload(local_path, key, size, &content_type, &reporter)
                .await?;
        } else {
            self.form_upload(local_path, key, &content_type, &reporter)
                .await?;
        }
        reporter.finish();
        info!(bucket = %self.config.bucket, key, bytes = size, "Uploaded object");

        Ok(UploadOutcome {
            key: key.to_string(),
            bucket: self.config.bucket.clone(),
            url: self.get_public_url(key).await.ok(),
        })
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> AppResult<()> {
        let response = self
            .client
            .get(self.fetch_url(key)?)
            .send()
            .await
            .map_err(classify::transport)?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded object");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let path = format!("/delete/{}", self.entry(clean_key(key)?));
        let response = self
            .management(Method::POST, &self.hosts.rs, &path, None)?
            .send()
            .await
            .map_err(classify::transport)?;
        if response.status().as_u16() == NO_SUCH_FILE {
            debug!(key, "Delete of missing key treated as success");
            return Ok(());
        }
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_in_chunks(keys, DEFAULT_BATCH_LIMIT, |chunk| self.delete_chunk(chunk)).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let limit = options.page_size().to_string();
        let mut pairs: Vec<(&str, &str)> = vec![("bucket", self.config.bucket.as_str()), ("limit", limit.as_str())];
        if !options.prefix.is_empty() {
            pairs.push(("prefix", options.prefix.as_str()));
        }
        if !options.delimiter.is_empty() {
            pairs.push(("delimiter", options.delimiter.as_str()));
        }
        if let Some(marker) = options.continuation_token.as_deref().filter(|m| !m.is_empty()) {
            pairs.push(("marker", marker));
        }
        let path = format!("/list?{}", query_string(pairs));

        let response = self
            .management(Method::GET, &self.hosts.rsf, &path, None)?
            .send()
            .await
            .map_err(classify::transport)?;
        let listing: ListResponse = classify::read_json(response).await?;

        let files = listing
            .items
            .into_iter()
            .map(|item| {
                ObjectEntry::new(item.key, item.fsize)
                    .modified(put_time(item.put_time))
                    .etag(item.hash)
                    .storage_class(Some(storage_class(item.storage_type)))
            })
            .collect();
        let folders = listing
            .common_prefixes
            .into_iter()
            .map(FolderEntry::new)
            .collect();
        Ok(ListResult::from_parts(files, folders, listing.marker))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(format!("{}/{}", self.domain, encode_key(clean_key(key)?))),
            UrlPlan::Signed(expires) => self.sign_url(key, expires),
        }
    }

    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>) -> AppResult<String> {
        self.sign_url(key, expires_in.unwrap_or(self.ctx.urls.default_expiry()))
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let stat = self.stat(key).await?;
        Ok(FileInfo {
            key: key.to_string(),
            size: stat.fsize,
            last_modified: put_time(stat.put_time),
            etag: stat.hash,
            content_type: stat.mime_type,
            storage_class: storage_class(stat.storage_type).to_string(),
        })
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let url = self.fetch_url(&info.key)?;
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .client
                    .get(url)
                    .header(RANGE, range_header(cap))
                    .send()
                    .await
                    .map_err(classify::transport)?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}
