//! Dropbox storage provider (API v2).
//!
//! Keys live under the profile's `root_path`. Dropbox has no public
//! endpoint: without a custom domain every URL is a temporary link (fixed
//! four hour lifetime). Batch deletes run as an async job that is polled to
//! completion; a missing path counts as deleted.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RANGE};
use reqwest::{Body, Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, DropboxConfig, ProviderConfig};
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
use crate::pagination;
use crate::progress::ProgressReporter;
use crate::providers::{FacadeContext, clean_key, content_type_for, range_header};
use crate::transfer;
use crate::url::UrlPlan;

const API_BASE: &str = "https://api.dropboxapi.com/2";
const CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
const API_ARG: &str = "Dropbox-API-Arg";
const OCTET_STREAM: &str = "application/octet-stream";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLLS: u32 = 240;

/// Dropbox storage provider.
#[derive(Debug, Clone)]
pub struct DropboxStorageProvider {
    ctx: FacadeContext,
    config: DropboxConfig,
    client: Client,
    label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct FileMetadata {
    path_display: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    server_modified: Option<String>,
    #[serde(default)]
    content_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FolderMetadata {
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderPage {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

impl FolderPage {
    /// Dropbox returns a cursor even on the last page.
    fn next_cursor(&self) -> Option<String> {
        self.has_more.then(|| self.cursor.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TemporaryLink {
    link: String,
}

/// Dropbox path for `key` below `root` (`""` addresses the Dropbox root).
fn dropbox_path(root: &str, key: &str) -> String {
    let joined: Vec<&str> = [root, key.trim_matches('/')]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    if joined.is_empty() {
        String::new()
    } else {
        format!("/{}", joined.join("/"))
    }
}

/// Key of a Dropbox path below `root`, matched case-insensitively as
/// Dropbox does.
fn key_from_path(root: &str, path: &str) -> Option<String> {
    let rest = path.trim_start_matches('/');
    if root.is_empty() {
        return Some(rest.to_string());
    }
    let head = rest.get(..root.len())?;
    let tail = rest.get(root.len()..)?;
    if !head.eq_ignore_ascii_case(root) {
        return None;
    }
    tail.strip_prefix('/').map(str::to_string)
}

/// JSON for the `Dropbox-API-Arg` header, which must be ASCII.
fn api_arg(value: &Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

fn parse_modified(text: Option<&str>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Outcome of one `delete_batch` entry; a missing path is a success.
fn batch_entry_result(entry: &Value) -> Result<(), String> {
    let tag = |v: &Value| v.get(".tag").and_then(Value::as_str).map(str::to_string);
    match tag(entry).as_deref() {
        Some("success") => Ok(()),
        Some("failure") => {
            let failure = entry.get("failure").cloned().unwrap_or(Value::Null);
            let reason = tag(&failure).unwrap_or_else(|| "unknown".to_string());
            let detail = failure.get(&reason).and_then(|d| tag(d));
            match detail.as_deref() {
                Some("not_found") if reason == "path_lookup" => Ok(()),
                Some(detail) => Err(format!("{reason}/{detail}")),
                None => Err(reason),
            }
        }
        other => Err(format!("unexpected entry {}", other.unwrap_or("without tag"))),
    }
}

/// Pair each requested key with its entry of a completed batch job.
fn batch_outcome(keys: &[String], entries: &[Value]) -> DeleteOutcome {
    let mut outcome = DeleteOutcome::default();
    for (index, key) in keys.iter().enumerate() {
        let result = entries
            .get(index)
            .ok_or_else(|| "missing from job result".to_string())
            .and_then(batch_entry_result);
        match result {
            Ok(()) => outcome.deleted.push(key.clone()),
            Err(reason) => outcome
                .failed
                .push(DeleteFailure::new(key.clone(), &AppError::external(reason))),
        }
    }
    outcome
}

impl DropboxStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Dropbox(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a dropbox profile"));
        };
        let label = profile.backend.bucket_label();
        let ctx = FacadeContext::new(profile, transfer, false);
        let client = ctx.http_client()?;
        info!(root = %label, "Initialized Dropbox storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            label,
        })
    }

    fn path(&self, key: &str) -> String {
        dropbox_path(&self.config.root_path, key)
    }

    fn bearer(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, format!("Bearer {}", self.config.access_token))
    }

    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> AppResult<T> {
        let response = self
            .bearer(self.client.post(format!("{API_BASE}/{endpoint}")))
            .json(&body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::read_json(response).await
    }

    /// Content endpoint call with the argument in the `Dropbox-API-Arg` header.
    async fn content_call(
        &self,
        endpoint: &str,
        arg: Value,
        body: Option<Body>,
        range: Option<String>,
    ) -> AppResult<reqwest::Response> {
        let mut request = self
            .bearer(self.client.post(format!("{CONTENT_BASE}/{endpoint}")))
            .header(API_ARG, api_arg(&arg));
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, OCTET_STREAM).body(body);
        }
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request.send().await.map_err(classify::transport)?;
        classify::ensure_success(response).await
    }

    fn key_of(&self, path: Option<&str>) -> Option<String> {
        path.and_then(|p| key_from_path(&self.config.root_path, p))
    }

    fn entry(&self, file: FileMetadata) -> Option<ObjectEntry> {
        let key = self.key_of(file.path_display.as_deref())?;
        Some(
            ObjectEntry::new(key, file.size)
                .modified(parse_modified(file.server_modified.as_deref()))
                .etag(file.content_hash),
        )
    }

    async fn folder_page(&self, dir: &str, recursive: bool, limit: u32, cursor: Option<&str>) -> AppResult<FolderPage> {
        let result = match cursor {
            Some(cursor) => {
                self.rpc("files/list_folder/continue", json!({ "cursor": cursor }))
                    .await
            }
            None => {
                self.rpc(
                    "files/list_folder",
                    json!({ "path": self.path(dir), "recursive": recursive, "limit": limit }),
                )
                .await
            }
        };
        match result {
            // A directory that does not exist lists as empty.
            Err(e) if e.is_not_found() && cursor.is_none() => Ok(FolderPage {
                entries: Vec::new(),
                cursor: String::new(),
                has_more: false,
            }),
            other => other,
        }
    }

    /// Every file below `dir`, following cursors to the end.
    async fn walk(&self, dir: &str) -> AppResult<Vec<ObjectEntry>> {
        let mut files = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.folder_page(dir, true, 2000, cursor.as_deref()).await?;
            for entry in page.entries {
                if let Metadata::File(file) = entry {
                    files.extend(self.entry(file));
                }
            }
            if !page.has_more {
                return Ok(files);
            }
            cursor = Some(page.cursor);
        }
    }

    async fn upload_session(
        &self,
        local_path: &Path,
        path: &str,
        size: u64,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let response = self
            .content_call(
                "files/upload_session/start",
                json!({ "close": false }),
                Some(Body::from(Vec::new())),
                None,
            )
            .await?;
        let session: SessionStart = classify::read_json(response).await?;

        let mut offset = 0;
        for (part_offset, len) in transfer::part_ranges(size, self.ctx.transfer.part_size_bytes) {
            let body = transfer::file_part_body(local_path, part_offset, len, reporter.clone()).await?;
            self.content_call(
                "files/upload_session/append_v2",
                json!({
                    "cursor": { "session_id": session.session_id, "offset": offset },
                    "close": false,
                }),
                Some(body),
                None,
            )
            .await?;
            offset += len;
        }

        self.content_call(
            "files/upload_session/finish",
            json!({
                "cursor": { "session_id": session.session_id, "offset": offset },
                "commit": { "path": path, "mode": "overwrite", "autorename": false, "mute": true },
            }),
            Some(Body::from(Vec::new())),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete_chunk(&self, keys: Vec<String>) -> AppResult<DeleteOutcome> {
        let entries: Vec<Value> = keys
            .iter()
            .map(|key| json!({ "path": self.path(key) }))
            .collect();
        let mut job: Value = self
            .rpc("files/delete_batch", json!({ "entries": entries }))
            .await?;

        let mut polls = 0;
        loop {
            match job.get(".tag").and_then(Value::as_str) {
                Some("complete") => {
                    let entries = job
                        .get("entries")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(batch_outcome(&keys, &entries));
                }
                Some("failed") => {
                    return Err(AppError::external(format!(
                        "Dropbox delete batch failed: {}",
                        job.get("failed").unwrap_or(&Value::Null)
                    )));
                }
                Some("async_job_id") | Some("in_progress") => {}
                other => {
                    return Err(AppError::malformed(format!(
                        "Unexpected delete_batch status {other:?}"
                    )));
                }
            }
            let job_id = match job.get("async_job_id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => return Err(AppError::malformed("delete_batch returned no job id")),
            };
            polls += 1;
            if polls > MAX_POLLS {
                return Err(AppError::network("Timed out waiting for Dropbox delete batch"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            let mut status: Value = self
                .rpc("files/delete_batch/check", json!({ "async_job_id": job_id }))
                .await?;
            // Keep the job id for the next poll; `check` does not echo it.
            if let Value::Object(map) = &mut status {
                map.insert("async_job_id".to_string(), Value::String(job_id));
            }
            job = status;
        }
    }

    async fn metadata(&self, key: &str) -> AppResult<FileMetadata> {
        let metadata: Metadata = self
            .rpc("files/get_metadata", json!({ "path": self.path(key) }))
            .await?;
        match metadata {
            Metadata::File(file) => Ok(file),
            _ => Err(AppError::not_found(format!("{key} is not a file"))),
        }
    }

    async fn temporary_link(&self, key: &str) -> AppResult<String> {
        let link: TemporaryLink = self
            .rpc(
                "files/get_temporary_link",
                json!({ "path": self.path(clean_key(key)?) }),
            )
            .await?;
        Ok(link.link)
    }
}

#[async_trait]
impl StorageProvider for DropboxStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Dropbox
    }

    fn bucket(&self) -> &str {
        &self.label
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let result: AppResult<Value> = self.rpc("users/get_current_account", Value::Null).await;
        match result {
            Ok(account) => {
                let name = account
                    .pointer("/name/display_name")
                    .and_then(Value::as_str)
                    .unwrap_or("account");
                ConnectionStatus::ok(format!("Connected to Dropbox as {name}"))
            }
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
        let path = self.path(key);
        let reporter = self.ctx.reporter(progress, size);

        if self.ctx.use_multipart(size) {
            self.upload_session(local_path, &path, size, &reporter).await?;
        } else {
            let (body, _) = transfer::file_body(local_path, reporter.clone()).await?;
            self.content_call(
                "files/upload",
                json!({ "path": path, "mode": "overwrite", "autorename": false, "mute": true }),
                Some(body),
                None,
            )
            .await?;
        }
        reporter.finish();
        info!(root = %self.label, key, bytes = size, "Uploaded file");

        let url = if self.ctx.urls.is_public() {
            self.get_public_url(key).await.ok()
        } else {
            None
        };
        Ok(UploadOutcome {
            key: key.to_string(),
            bucket: self.label.clone(),
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
            .content_call(
                "files/download",
                json!({ "path": self.path(clean_key(key)?) }),
                None,
                None,
            )
            .await?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded file");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let result: AppResult<Value> = self
            .rpc("files/delete_v2", json!({ "path": self.path(clean_key(key)?) }))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(key, "Delete of missing file treated as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_in_chunks(keys, DEFAULT_BATCH_LIMIT, |chunk| self.delete_chunk(chunk)).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let dir = pagination::directory_of(&options.prefix).to_string();

        if options.delimiter != "/" {
            let entries = self.walk(&dir).await?;
            let (files, folders) =
                pagination::partition_by_delimiter(entries, &options.prefix, &options.delimiter);
            return Ok(pagination::paginate(files, folders, options));
        }

        let cursor = options.continuation_token.as_deref().filter(|c| !c.is_empty());
        let page = self
            .folder_page(&dir, false, options.page_size(), cursor)
            .await?;
        let next = page.next_cursor();
        let mut files = Vec::new();
        let mut folders = Vec::new();
        for entry in page.entries {
            match entry {
                Metadata::File(file) => {
                    if let Some(entry) = self.entry(file) {
                        if entry.key.starts_with(&options.prefix) {
                            files.push(entry);
                        }
                    }
                }
                Metadata::Folder(folder) => {
                    if let Some(key) = self.key_of(folder.path_display.as_deref()) {
                        if key.starts_with(&options.prefix) {
                            folders.push(FolderEntry::new(key));
                        }
                    }
                }
                Metadata::Other => {}
            }
        }
        Ok(ListResult::from_parts(files, folders, next))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default | UrlPlan::Signed(_) => self.temporary_link(key).await,
        }
    }

    /// Temporary links always live four hours; `expires_in` is ignored.
    async fn get_presigned_url(&self, key: &str, _expires_in: Option<Duration>) -> AppResult<String> {
        self.temporary_link(key).await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let file = self.metadata(key).await?;
        Ok(FileInfo {
            key: self
                .key_of(file.path_display.as_deref())
                .unwrap_or_else(|| key.to_string()),
            size: file.size,
            last_modified: parse_modified(file.server_modified.as_deref()),
            etag: file.content_hash,
            content_type: Some(content_type_for(key)),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        })
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let path = self.path(&info.key);
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .content_call(
                        "files/download",
                        json!({ "path": path }),
                        None,
                        Some(range_header(cap)),
                    )
                    .await?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_keys() {
        assert_eq!(dropbox_path("", ""), "");
        assert_eq!(dropbox_path("", "a/b.png"), "/a/b.png");
        assert_eq!(dropbox_path("Apps/shelf", "a.png"), "/Apps/shelf/a.png");
        assert_eq!(dropbox_path("Apps/shelf", ""), "/Apps/shelf");

        assert_eq!(key_from_path("Apps/shelf", "/apps/Shelf/x/y.txt").as_deref(), Some("x/y.txt"));
        assert_eq!(key_from_path("Apps/shelf", "/Apps/shelfish/y.txt"), None);
        assert_eq!(key_from_path("", "/y.txt").as_deref(), Some("y.txt"));
    }

    #[test]
    fn test_api_arg_is_ascii() {
        let arg = api_arg(&json!({ "path": "/照片/a.png" }));
        assert!(arg.is_ascii());
        assert_eq!(arg, r#"{"path":"/\u7167\u7247/a.png"}"#);
        let back: Value = serde_json::from_str(&arg).unwrap();
        assert_eq!(back["path"], "/照片/a.png");
    }

    #[test]
    fn test_batch_outcome_treats_missing_as_deleted() {
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let entries: Vec<Value> = serde_json::from_str(
            r#"[
                {".tag": "success", "metadata": {".tag": "file", "name": "a"}},
                {".tag": "failure", "failure": {".tag": "path_lookup", "path_lookup": {".tag": "not_found"}}},
                {".tag": "failure", "failure": {".tag": "too_many_write_operations"}}
            ]"#,
        )
        .unwrap();
        let outcome = batch_outcome(&keys, &entries);
        assert_eq!(outcome.deleted, vec!["a", "b"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].key, "c");
    }

    #[test]
    fn test_metadata_tags() {
        let page: FolderPage = serde_json::from_str(
            r#"{"entries": [
                {".tag": "file", "name": "a.txt", "path_display": "/a.txt", "size": 4,
                 "server_modified": "2024-05-01T10:00:00Z", "content_hash": "h"},
                {".tag": "folder", "name": "docs", "path_display": "/docs"},
                {".tag": "deleted", "name": "old", "path_display": "/old"}
            ], "cursor": "AAE", "has_more": false}"#,
        )
        .unwrap();
        assert!(matches!(page.entries[0], Metadata::File(_)));
        assert!(matches!(page.entries[1], Metadata::Folder(_)));
        assert!(matches!(page.entries[2], Metadata::Other));
        assert_eq!(page.next_cursor(), None);
    }

    #[test]
    fn test_cursor_kept_only_while_more_pages() {
        let page: FolderPage =
            serde_json::from_str(r#"{"entries": [], "cursor": "AAF", "has_more": true}"#).unwrap();
        assert_eq!(page.next_cursor().as_deref(), Some("AAF"));
    }

    #[tokio::test]
    async fn test_custom_domain_wins() {
        let mut profile = ProviderConfig::new(BackendConfig::Dropbox(DropboxConfig {
            access_token: "t".into(),
            root_path: "/shelf/".into(),
        }));
        profile.custom_domain = Some("cdn.example.com".into());
        let dropbox =
            DropboxStorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap();
        assert_eq!(
            dropbox.get_public_url("a.png").await.unwrap(),
            "https://cdn.example.com/a.png"
        );
        assert_eq!(dropbox.path("a.png"), "/shelf/a.png");
    }
}
