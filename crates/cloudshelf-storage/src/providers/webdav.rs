//! WebDAV storage provider.
//!
//! Keys are paths below the configured collection URL. A listing issues
//! `PROPFIND` with `Depth: 1` on the prefix's directory (and on every
//! subdirectory for recursive listings), then pages the result client-side.
//! Uploads create missing parent collections with `MKCOL` before the `PUT`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, WebdavConfig};
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
use crate::pagination;
use crate::providers::{FacadeContext, clean_key, content_type_for, parse_http_date, range_header};
use crate::transfer;
use crate::url::{UrlPlan, encode_key};
use crate::xml::{self, Element};

const PROPFIND_BODY: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
<D:propfind xmlns:D=\"DAV:\"><D:prop><D:resourcetype/><D:getcontentlength/>\
<D:getlastmodified/><D:getetag/><D:getcontenttype/></D:prop></D:propfind>";

/// WebDAV storage provider.
#[derive(Debug, Clone)]
pub struct WebDavStorageProvider {
    ctx: FacadeContext,
    config: WebdavConfig,
    client: Client,
    /// Decoded URL path of the root collection, without trailing `/`.
    root_path: String,
}

/// One `<D:response>` of a multistatus document.
#[derive(Debug, Clone, PartialEq)]
struct DavEntry {
    /// Key relative to the root collection, without trailing `/`.
    key: String,
    is_collection: bool,
    size: u64,
    last_modified: Option<chrono::DateTime<chrono::Utc>>,
    etag: Option<String>,
    content_type: Option<String>,
}

impl WebDavStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Webdav(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a webdav profile"));
        };
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            AppError::validation(format!("Invalid WebDAV endpoint '{}': {e}", config.endpoint))
        })?;
        let root_path = percent_decode_str(endpoint.path())
            .decode_utf8_lossy()
            .trim_end_matches('/')
            .to_string();
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(endpoint = %config.endpoint, "Initialized WebDAV storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            root_path,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, encode_key(path))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    async fn propfind(&self, path: &str, depth: &str) -> AppResult<Vec<DavEntry>> {
        let response = self
            .request(dav_method("PROPFIND")?, path)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(classify::transport)?;
        let body = classify::read_text(response).await?;
        parse_multistatus(&body, &self.root_path)
    }

    /// Direct children of a directory; a missing directory is empty.
    async fn children(&self, dir: &str) -> AppResult<Vec<DavEntry>> {
        let path = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let entries = match self.propfind(&path, "1").await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries.into_iter().filter(|e| e.key != dir).collect())
    }

    /// `MKCOL` every missing parent collection of `key`.
    async fn ensure_parents(&self, key: &str) -> AppResult<()> {
        let segments: Vec<&str> = key.split('/').collect();
        let mut current = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            let response = self
                .request(dav_method("MKCOL")?, &format!("{current}/"))
                .send()
                .await
                .map_err(classify::transport)?;
            // 405: the collection already exists.
            match response.status() {
                s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => {}
                _ => {
                    classify::ensure_success(response).await?;
                }
            }
        }
        Ok(())
    }

    fn object(entry: DavEntry) -> ObjectEntry {
        ObjectEntry::new(entry.key, entry.size)
            .modified(entry.last_modified)
            .etag(entry.etag)
    }
}

fn dav_method(name: &str) -> AppResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| AppError::internal(format!("Invalid HTTP method {name}: {e}")))
}

/// Parse a `multistatus` body into entries keyed relative to `root_path`.
fn parse_multistatus(body: &str, root_path: &str) -> AppResult<Vec<DavEntry>> {
    let root = xml::parse_document(body, "multistatus")?;
    let mut entries = Vec::new();
    for response in root.children_named("response") {
        let Some(href) = response.child_text("href") else {
            continue;
        };
        let Some(prop) = ok_prop(response) else {
            continue;
        };
        let key = key_from_href(href, root_path);
        let is_collection = prop.find(&["resourcetype", "collection"]).is_some();
        entries.push(DavEntry {
            key,
            is_collection,
            size: prop
                .child_text("getcontentlength")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
            last_modified: prop.child_text("getlastmodified").and_then(parse_http_date),
            etag: prop
                .child_text("getetag")
                .map(|e| e.trim_start_matches("W/").trim_matches('"').to_string())
                .filter(|e| !e.is_empty()),
            content_type: prop
                .child_text("getcontenttype")
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        });
    }
    Ok(entries)
}

/// The `prop` of the first `propstat` reporting a 2xx status.
fn ok_prop(response: &Element) -> Option<&Element> {
    response
        .children_named("propstat")
        .find(|ps| {
            ps.child_text("status")
                .is_none_or(|s| s.split_whitespace().nth(1).is_some_and(|c| c.starts_with('2')))
        })
        .and_then(|ps| ps.child("prop"))
}

fn key_from_href(href: &str, root_path: &str) -> String {
    // Servers send either an absolute URL or an absolute path.
    let path = match href.find("://") {
        Some(scheme_end) => {
            let rest = &href[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
        }
        None => href,
    };
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    decoded
        .strip_prefix(root_path)
        .unwrap_or(decoded.as_ref())
        .trim_matches('/')
        .to_string()
}

#[async_trait]
impl StorageProvider for WebDavStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Webdav
    }

    fn bucket(&self) -> &str {
        &self.config.endpoint
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match self.propfind("", "0").await {
            Ok(_) => ConnectionStatus::ok(format!("{} is reachable", self.config.endpoint)),
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
        self.ensure_parents(key).await?;

        let reporter = self.ctx.reporter(progress, size);
        let (body, size) = transfer::file_body(local_path, reporter.clone()).await?;
        let response = self
            .request(Method::PUT, key)
            .header(CONTENT_TYPE, content_type_for(key))
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        reporter.finish();
        info!(endpoint = %self.config.endpoint, key, bytes = size, "Uploaded file");

        let url = if self.ctx.urls.is_public() {
            self.get_public_url(key).await.ok()
        } else {
            None
        };
        Ok(UploadOutcome {
            key: key.to_string(),
            bucket: self.config.endpoint.clone(),
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
            .request(Method::GET, clean_key(key)?)
            .send()
            .await
            .map_err(classify::transport)?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded file");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let response = self
            .request(Method::DELETE, clean_key(key)?)
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
        let dir = pagination::directory_of(&options.prefix).to_string();

        if options.delimiter == "/" {
            let mut files = Vec::new();
            let mut folders = Vec::new();
            for entry in self.children(&dir).await? {
                if !entry.key.starts_with(&options.prefix) {
                    continue;
                }
                if entry.is_collection {
                    folders.push(FolderEntry::new(entry.key));
                } else {
                    files.push(Self::object(entry));
                }
            }
            return Ok(pagination::paginate(files, folders, options));
        }

        let mut pending = vec![dir];
        let mut objects = Vec::new();
        while let Some(current) = pending.pop() {
            for entry in self.children(&current).await? {
                if entry.is_collection {
                    pending.push(entry.key);
                } else {
                    objects.push(Self::object(entry));
                }
            }
        }
        let (files, folders) =
            pagination::partition_by_delimiter(objects, &options.prefix, &options.delimiter);
        Ok(pagination::paginate(files, folders, options))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.url(clean_key(key)?)),
            UrlPlan::Signed(_) => Err(AppError::not_supported(
                "WebDAV cannot sign URLs; configure a custom domain for private servers",
            )),
        }
    }

    async fn get_presigned_url(&self, key: &str, _expires_in: Option<Duration>) -> AppResult<String> {
        self.get_public_url(key).await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let entry = self
            .propfind(key, "0")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found(format!("{key} not found")))?;
        if entry.is_collection {
            return Err(AppError::not_found(format!("{key} is a collection")));
        }
        Ok(FileInfo {
            key: key.to_string(),
            size: entry.size,
            last_modified: entry.last_modified,
            etag: entry.etag,
            content_type: entry.content_type,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        })
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .request(Method::GET, &key)
                    .header(RANGE, range_header(cap))
                    .send()
                    .await
                    .map_err(classify::transport)?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}
