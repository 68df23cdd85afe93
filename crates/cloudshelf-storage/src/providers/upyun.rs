//! Upyun USS storage provider.
//!
//! Requests are signed `UPYUN operator:base64(HMAC-SHA1(md5(password),
//! METHOD&URI&DATE))`. Upyun lists one directory at a time with an
//! `x-list-iter` cursor, so a `/`-delimited listing maps onto it directly;
//! recursive listings walk the tree once and page client-side. There is no
//! batch delete and no URL signing.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, UpyunConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, FolderEntry, ListOptions, ListResult,
    ObjectEntry, PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch;
use crate::classify;
use crate::pagination;
use crate::providers::{FacadeContext, clean_key, content_type_for, header_text, info_from_headers, range_header};
use crate::signing;
use crate::transfer;
use crate::url::{UrlPlan, encode_key};

const DEFAULT_API_BASE: &str = "https://v0.api.upyun.com";
/// Iterator value Upyun returns once a directory is exhausted.
const END_OF_LISTING: &str = "g2gCZAAEbmV4dGQAA2VvZg";

/// Upyun USS storage provider.
#[derive(Debug, Clone)]
pub struct UpyunStorageProvider {
    ctx: FacadeContext,
    config: UpyunConfig,
    client: Client,
    api_base: String,
    /// Hex MD5 of the operator password, the HMAC key.
    password_md5: String,
}

#[derive(Debug, Deserialize)]
struct DirectoryPage {
    #[serde(default)]
    files: Vec<DirectoryItem>,
    #[serde(default)]
    iter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryItem {
    name: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    last_modified: i64,
}

impl DirectoryItem {
    fn is_folder(&self) -> bool {
        self.kind == "folder" || self.kind == "F"
    }
}

impl UpyunStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Upyun(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected an upyun profile"));
        };
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let password_md5 = signing::md5_hex(config.password.as_bytes());
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(bucket = %config.bucket, "Initialized Upyun storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            api_base,
            password_md5,
        })
    }

    fn default_url(&self, key: &str) -> String {
        format!("http://{}.test.upcdn.net/{}", self.config.bucket, encode_key(key))
    }

    /// Signed request for `path` (a key, or a directory ending in `/`).
    fn request(&self, method: Method, path: &str) -> AppResult<RequestBuilder> {
        let uri = format!("/{}/{}", self.config.bucket, encode_key(path));
        let date = signing::http_date(Utc::now());
        let string_to_sign = format!("{}&{uri}&{date}", method.as_str());
        let mac = signing::hmac_sha1(self.password_md5.as_bytes(), string_to_sign.as_bytes())?;
        let authorization = format!("UPYUN {}:{}", self.config.operator, signing::base64(&mac));
        Ok(self
            .client
            .request(method, format!("{}{uri}", self.api_base))
            .header(DATE, date)
            .header(AUTHORIZATION, authorization))
    }

    /// One page of a single directory listing.
    async fn directory_page(
        &self,
        dir: &str,
        iter: Option<&str>,
        limit: u32,
    ) -> AppResult<(Vec<DirectoryItem>, Option<String>)> {
        let path = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut request = self
            .request(Method::GET, &path)?
            .header(ACCEPT, "application/json")
            .header("x-list-limit", limit.to_string());
        if let Some(iter) = iter {
            request = request.header("x-list-iter", iter);
        }
        let response = request.send().await.map_err(classify::transport)?;
        // A directory that does not exist yet lists as empty.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), None));
        }
        let page: DirectoryPage = classify::read_json(response).await?;
        let next = page.iter.filter(|i| !i.is_empty() && i != END_OF_LISTING);
        Ok((page.files, next))
    }

    /// Every object below `dir`, walking subdirectories.
    async fn walk(&self, dir: &str) -> AppResult<Vec<ObjectEntry>> {
        let mut pending = vec![dir.to_string()];
        let mut objects = Vec::new();
        while let Some(current) = pending.pop() {
            let mut iter: Option<String> = None;
            loop {
                let (items, next) = self.directory_page(&current, iter.as_deref(), 1000).await?;
                for item in items {
                    let key = join(&current, &item.name);
                    if item.is_folder() {
                        pending.push(key);
                    } else {
                        objects.push(ObjectEntry::new(key, item.length).modified(timestamp(item.last_modified)));
                    }
                }
                match next {
                    Some(next) => iter = Some(next),
                    None => break,
                }
            }
        }
        Ok(objects)
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    (secs > 0).then(|| DateTime::<Utc>::from_timestamp(secs, 0)).flatten()
}

#[async_trait]
impl StorageProvider for UpyunStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Upyun
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.directory_page("", None, 1).await {
            Ok(_) => ConnectionStatus::ok(format!("Service {} is reachable", self.config.bucket)),
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
        let reporter = self.ctx.reporter(progress, size);
        let (body, size) = transfer::file_body(local_path, reporter.clone()).await?;
        let response = self
            .request(Method::PUT, key)?
            .header(CONTENT_TYPE, content_type_for(key))
            .header(CONTENT_LENGTH, size)
            .header("mkdir", "true")
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
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
        let response = self
            .request(Method::GET, clean_key(key)?)?
            .send()
            .await
            .map_err(classify::transport)?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded object");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let response = self
            .request(Method::DELETE, clean_key(key)?)?
            .send()
            .await
            .map_err(classify::transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_each(keys, |key| async move { self.delete_file(&key).await }).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let dir = pagination::directory_of(&options.prefix);

        if options.delimiter == "/" {
            let (items, next) = self
                .directory_page(dir, options.continuation_token.as_deref(), options.page_size())
                .await?;
            let mut files = Vec::new();
            let mut folders = Vec::new();
            for item in items {
                let key = join(dir, &item.name);
                if !key.starts_with(&options.prefix) {
                    continue;
                }
                if item.is_folder() {
                    folders.push(FolderEntry::new(key));
                } else {
                    files.push(ObjectEntry::new(key, item.length).modified(timestamp(item.last_modified)));
                }
            }
            return Ok(ListResult::from_parts(files, folders, next));
        }

        let objects = self.walk(dir).await?;
        let (files, folders) =
            pagination::partition_by_delimiter(objects, &options.prefix, &options.delimiter);
        Ok(pagination::paginate(files, folders, options))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.default_url(clean_key(key)?)),
            UrlPlan::Signed(_) => Err(AppError::not_supported(
                "Upyun cannot sign URLs; configure a custom domain for private services",
            )),
        }
    }

    async fn get_presigned_url(&self, key: &str, _expires_in: Option<Duration>) -> AppResult<String> {
        self.get_public_url(key).await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let response = self
            .request(Method::HEAD, key)?
            .send()
            .await
            .map_err(classify::transport)?;
        let response = classify::ensure_success(response).await?;
        let headers = response.headers();
        if header_text(headers, "x-upyun-file-type").as_deref() == Some("folder") {
            return Err(AppError::not_found(format!("{key} is a directory")));
        }
        let mut info = info_from_headers(key, headers, None);
        if let Some(size) = header_text(headers, "x-upyun-file-size").and_then(|s| s.parse().ok()) {
            info.size = size;
        }
        if let Some(at) = header_text(headers, "x-upyun-file-date")
            .and_then(|s| s.parse().ok())
            .and_then(timestamp)
        {
            info.last_modified = Some(at);
        }
        Ok(info)
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .request(Method::GET, &key)?
                    .header(RANGE, range_header(cap))
                    .send()
                    .await
                    .map_err(classify::transport)?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}
