//! GitHub repository storage provider.
//!
//! Objects are files on one branch. Listing fetches the branch's recursive
//! git tree once per call and emulates the delimiter and cursor
//! client-side. When GitHub truncates the recursive tree, the listing falls
//! back to walking one tree level per request. Uploads go through the contents API with the file streamed
//! as base64 inside the JSON body; overwrites and deletes need the current
//! blob sha, which is looked up first.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, GithubConfig, ProviderConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, ListOptions, ListResult, ObjectEntry,
    PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch;
use crate::classify;
use crate::pagination;
use crate::providers::{FacadeContext, clean_key, content_type_for};
use crate::transfer;
use crate::url::{UrlPlan, encode_key, encode_query};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const JSON_MEDIA: &str = "application/vnd.github+json";
const RAW_MEDIA: &str = "application/vnd.github.raw";

/// GitHub repository storage provider.
#[derive(Debug, Clone)]
pub struct GithubStorageProvider {
    ctx: FacadeContext,
    config: GithubConfig,
    client: Client,
    api_base: String,
    label: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    sha: String,
    #[serde(default)]
    download_url: Option<String>,
}

impl GithubStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Github(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a github profile"));
        };
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let label = profile.backend.bucket_label();
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(repo = %label, branch = %config.branch, "Initialized GitHub storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            api_base,
            label,
        })
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.api_as(method, path, JSON_MEDIA)
    }

    fn api_as(&self, method: Method, path: &str, accept: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base))
            .header(AUTHORIZATION, format!("Bearer {}", self.config.token))
            .header(ACCEPT, accept)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn repo_path(&self) -> String {
        format!("/repos/{}/{}", self.config.owner, self.config.repo)
    }

    fn contents_path(&self, key: &str) -> String {
        format!("{}/contents/{}", self.repo_path(), encode_key(key))
    }

    fn default_url(&self, key: &str) -> String {
        format!(
            "https://raw.githubusercontent.com/{}/{}/{}/{}",
            self.config.owner,
            self.config.repo,
            self.config.branch,
            encode_key(key)
        )
    }

    async fn content(&self, key: &str) -> AppResult<ContentEntry> {
        let path = format!(
            "{}?ref={}",
            self.contents_path(key),
            encode_query(&self.config.branch)
        );
        let response = self
            .api(Method::GET, &path)
            .send()
            .await
            .map_err(classify::transport)?;
        let value: serde_json::Value = classify::read_json(response).await?;
        if value.is_array() {
            return Err(AppError::not_found(format!("{key} is a directory")));
        }
        let entry: ContentEntry = serde_json::from_value(value)
            .map_err(|e| AppError::malformed(format!("Unexpected contents response: {e}")))?;
        if entry.kind != "file" {
            return Err(AppError::not_found(format!("{key} is not a file")));
        }
        Ok(entry)
    }

    /// Blob sha of `key`, or `None` when the file does not exist.
    async fn existing_sha(&self, key: &str) -> AppResult<Option<String>> {
        match self.content(key).await {
            Ok(entry) => Ok(Some(entry.sha)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every blob on the branch.
    async fn tree(&self) -> AppResult<Vec<ObjectEntry>> {
        let branch = encode_query(&self.config.branch);
        let Some(tree) = self.fetch_tree(&branch, true).await? else {
            return Ok(Vec::new());
        };
        if !tree.truncated {
            return Ok(tree
                .tree
                .into_iter()
                .filter(|entry| entry.kind == "blob")
                .map(|entry| ObjectEntry::new(entry.path, entry.size.unwrap_or(0)).etag(entry.sha))
                .collect());
        }
        debug!(repo = %self.label, "Recursive git tree truncated, walking subtrees");
        self.walk_tree(branch).await
    }

    /// Breadth-first walk fetching one non-recursive tree per directory.
    async fn walk_tree(&self, root: String) -> AppResult<Vec<ObjectEntry>> {
        let mut blobs = Vec::new();
        let mut pending = VecDeque::from([(root, String::new())]);
        while let Some((tree_ish, base)) = pending.pop_front() {
            let Some(level) = self.fetch_tree(&tree_ish, false).await? else {
                continue;
            };
            if level.truncated {
                return Err(AppError::new(
                    ErrorKind::ExternalService,
                    format!(
                        "GitHub truncated the tree of '{}' in {}; listing would be incomplete",
                        if base.is_empty() { "/" } else { base.as_str() },
                        self.label
                    ),
                ));
            }
            for entry in level.tree {
                let path = format!("{base}{}", entry.path);
                match (entry.kind.as_str(), entry.sha) {
                    ("blob", sha) => {
                        blobs.push(ObjectEntry::new(path, entry.size.unwrap_or(0)).etag(sha));
                    }
                    ("tree", Some(sha)) => pending.push_back((sha, format!("{path}/"))),
                    _ => {}
                }
            }
        }
        Ok(blobs)
    }

    /// One git tree; `None` for an empty repository, which has no tree yet.
    async fn fetch_tree(&self, tree_ish: &str, recursive: bool) -> AppResult<Option<TreeResponse>> {
        let mut path = format!("{}/git/trees/{tree_ish}", self.repo_path());
        if recursive {
            path.push_str("?recursive=1");
        }
        let response = self
            .api(Method::GET, &path)
            .send()
            .await
            .map_err(classify::transport)?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        classify::read_json(response).await.map(Some)
    }

    fn info_from(&self, entry: ContentEntry) -> FileInfo {
        FileInfo {
            content_type: Some(content_type_for(&entry.path)),
            key: entry.path,
            size: entry.size,
            last_modified: None,
            etag: Some(entry.sha),
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }

    async fn raw(&self, key: &str) -> AppResult<reqwest::Response> {
        let path = format!(
            "{}?ref={}",
            self.contents_path(key),
            encode_query(&self.config.branch)
        );
        self.api_as(Method::GET, &path, RAW_MEDIA)
            .send()
            .await
            .map_err(classify::transport)
    }
}

/// JSON body `{prefix}<base64 of stream>{suffix}`, encoded on the fly.
fn base64_json_body<S>(prefix: String, suffix: String, stream: S) -> Body
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    Body::wrap_stream(base64_json_stream(prefix, suffix, stream))
}

fn base64_json_stream<S>(
    prefix: String,
    suffix: String,
    stream: S,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    enum Stage {
        Prefix,
        Content,
        Done,
    }

    struct State {
        inner: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>,
        carry: Vec<u8>,
        stage: Stage,
        prefix: String,
        suffix: String,
    }

    let state = State {
        inner: Box::pin(stream),
        carry: Vec::new(),
        stage: Stage::Prefix,
        prefix,
        suffix,
    };
    futures::stream::unfold(state, |mut state| async move {
        match state.stage {
            Stage::Prefix => {
                state.stage = Stage::Content;
                let prefix = std::mem::take(&mut state.prefix);
                Some((Ok(Bytes::from(prefix)), state))
            }
            Stage::Content => match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.carry.extend_from_slice(&chunk);
                    let whole = state.carry.len() / 3 * 3;
                    let encoded = STANDARD.encode(&state.carry[..whole]);
                    state.carry.drain(..whole);
                    Some((Ok(Bytes::from(encoded)), state))
                }
                Some(Err(e)) => {
                    state.stage = Stage::Done;
                    Some((Err(e), state))
                }
                None => {
                    let mut tail = STANDARD.encode(&state.carry);
                    tail.push_str(&state.suffix);
                    state.stage = Stage::Done;
                    Some((Ok(Bytes::from(tail)), state))
                }
            },
            Stage::Done => None,
        }
    })
}

/// Length of the base64 encoding of `n` bytes.
fn base64_len(n: u64) -> u64 {
    n.div_ceil(3) * 4
}

#[async_trait]
impl StorageProvider for GithubStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Github
    }

    fn bucket(&self) -> &str {
        &self.label
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let result = match self.api(Method::GET, &self.repo_path()).send().await {
            Ok(response) => classify::ensure_success(response).await.map(|_| ()),
            Err(e) => Err(classify::transport(e)),
        };
        match result {
            Ok(()) => ConnectionStatus::ok(format!("Repository {} is reachable", self.label)),
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
        let sha = self.existing_sha(key).await?;

        let mut head = serde_json::json!({
            "message": format!("Upload {key}"),
            "branch": self.config.branch,
        });
        if let Some(sha) = &sha {
            head["sha"] = serde_json::Value::String(sha.clone());
        }
        // `{"message":..,"branch":..}` becomes `{"message":..,"branch":..,"content":"`.
        let head = head.to_string();
        let prefix = format!("{},\"content\":\"", &head[..head.len() - 1]);
        let suffix = "\"}".to_string();
        let length = prefix.len() as u64 + base64_len(size) + suffix.len() as u64;

        let reporter = self.ctx.reporter(progress, size);
        let stream = transfer::file_range_stream(local_path, 0, size, reporter.clone()).await?;
        let response = self
            .api(Method::PUT, &self.contents_path(key))
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, length)
            .body(base64_json_body(prefix, suffix, stream))
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        reporter.finish();
        info!(repo = %self.label, key, bytes = size, overwrite = sha.is_some(), "Uploaded file");

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
        let response = self.raw(clean_key(key)?).await?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded file");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let key = clean_key(key)?;
        let Some(sha) = self.existing_sha(key).await? else {
            debug!(key, "Delete of missing file treated as success");
            return Ok(());
        };
        let body = serde_json::json!({
            "message": format!("Delete {key}"),
            "sha": sha,
            "branch": self.config.branch,
        });
        let response = self
            .api(Method::DELETE, &self.contents_path(key))
            .json(&body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_each(keys, |key| async move { self.delete_file(&key).await }).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let entries = self.tree().await?;
        let (files, folders) =
            pagination::partition_by_delimiter(entries, &options.prefix, &options.delimiter);
        Ok(pagination::paginate(files, folders, options))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.default_url(clean_key(key)?)),
            UrlPlan::Signed(_) => self.get_presigned_url(key, None).await,
        }
    }

    /// GitHub issues the download token; its lifetime cannot be chosen.
    async fn get_presigned_url(&self, key: &str, _expires_in: Option<Duration>) -> AppResult<String> {
        let entry = self.content(clean_key(key)?).await?;
        entry
            .download_url
            .ok_or_else(|| AppError::malformed(format!("GitHub returned no download URL for {key}")))
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let entry = self.content(clean_key(key)?).await?;
        Ok(self.info_from(entry))
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self.raw(&key).await?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn provider(private: bool) -> GithubStorageProvider {
        let mut profile = ProviderConfig::new(BackendConfig::Github(GithubConfig {
            token: "ghp_x".into(),
            owner: "octo".into(),
            repo: "assets".into(),
            branch: "main".into(),
            api_base: None,
        }));
        profile.private = private;
        GithubStorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_base64_body_matches_one_shot_encoding() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream = base64_json_stream(
            "{\"content\":\"".into(),
            "\"}".into(),
            futures::stream::iter(chunks),
        );
        let bytes: Vec<Bytes> = stream.try_collect().await.unwrap();
        let text = String::from_utf8(bytes.concat()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["content"], STANDARD.encode(&data));
        assert_eq!(base64_len(1000), STANDARD.encode(&data).len() as u64);
    }

    #[tokio::test]
    async fn test_public_url_uses_raw_host() {
        assert_eq!(
            provider(false).get_public_url("img/a b.png").await.unwrap(),
            "https://raw.githubusercontent.com/octo/assets/main/img/a%20b.png"
        );
    }

    #[test]
    fn test_bucket_label() {
        assert_eq!(provider(false).bucket(), "octo/assets");
    }
}
