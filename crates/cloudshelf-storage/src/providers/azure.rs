//! Azure Blob Storage provider.
//!
//! Requests are signed with SharedKey (HMAC-SHA256 over the canonical
//! request under the decoded account key). Listing uses `NextMarker`
//! pagination; deletes are sequential. Files above the multipart threshold
//! are uploaded as blocks and committed with a block list. Signed URLs are
//! read-only service SAS tokens.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use tracing::{debug, info};

use cloudshelf_core::config::provider::{AzureConfig, BackendConfig, ProviderConfig};
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
use crate::progress::ProgressReporter;
use crate::providers::{FacadeContext, clean_key, content_type_for, info_from_headers, parse_http_date, range_header};
use crate::signing;
use crate::transfer;
use crate::url::{UrlPlan, encode_key, encode_query};
use crate::xml;

const API_VERSION: &str = "2021-08-06";
const ACCESS_TIER_HEADER: &str = "x-ms-access-tier";

/// Azure Blob Storage provider.
#[derive(Debug, Clone)]
pub struct AzureStorageProvider {
    ctx: FacadeContext,
    config: AzureConfig,
    client: Client,
    /// Blob service origin plus any path (Azurite puts the account there).
    base: String,
    base_path: String,
}

impl AzureStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Azure(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected an azure profile"));
        };
        let base = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account_name));
        let base_path = Url::parse(&base)
            .map_err(|e| AppError::validation(format!("Invalid Azure endpoint '{base}': {e}")))?
            .path()
            .trim_end_matches('/')
            .to_string();
        account_key(&config)?;
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(account = %config.account_name, container = %config.container, "Initialized Azure storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            base,
            base_path,
        })
    }

    /// Encoded path below the service root: `/container` or `/container/blob`.
    fn path(&self, key: &str) -> String {
        if key.is_empty() {
            format!("/{}", self.config.container)
        } else {
            format!("/{}/{}", self.config.container, encode_key(key))
        }
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}{}", self.base, self.path(key))
    }

    fn string_to_sign(
        &self,
        method: &Method,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
        content_length: u64,
    ) -> String {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };
        let mut ms_headers: Vec<(String, &str)> = headers
            .iter()
            .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-ms-"))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();
        ms_headers.sort();
        let canonical_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let mut resource = format!("/{}{}{}", self.config.account_name, self.base_path, self.path(key));
        let mut params: Vec<(String, &str)> = query
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), *v))
            .collect();
        params.sort();
        for (name, value) in params {
            resource.push_str(&format!("\n{name}:{value}"));
        }

        let length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };
        format!(
            "{}\n\n\n{length}\n{}\n{}\n\n\n\n\n\n\n{canonical_headers}{resource}",
            method.as_str(),
            header("content-md5"),
            header("content-type"),
        )
    }

    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        content_length: u64,
    ) -> AppResult<RequestBuilder> {
        let mut headers: Vec<(&str, String)> = vec![
            ("x-ms-date", signing::http_date(Utc::now())),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        headers.extend(extra_headers.iter().cloned());

        let string_to_sign = self.string_to_sign(&method, key, query, &headers, content_length);
        let signature = signing::base64(&signing::hmac_sha256(&account_key(&self.config)?, string_to_sign.as_bytes())?);

        let mut url = self.blob_url(key);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&crate::url::query_string(query.iter().copied()));
        }
        let mut request = self
            .client
            .request(method, url)
            .header(
                AUTHORIZATION,
                format!("SharedKey {}:{signature}", self.config.account_name),
            )
            .header(CONTENT_LENGTH, content_length);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }

    fn sas_url(&self, key: &str, expires: Duration) -> AppResult<String> {
        let key = clean_key(key)?;
        let expiry = (Utc::now() + chrono::Duration::seconds(expires.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let resource = format!(
            "/blob/{}/{}/{key}",
            self.config.account_name, self.config.container
        );
        // sp, st, se, resource, si, sip, spr, sv, sr, snapshot, ses, rscc, rscd, rsce, rscl, rsct
        let string_to_sign = format!("r\n\n{expiry}\n{resource}\n\n\n\n{API_VERSION}\nb\n\n\n\n\n\n\n");
        let signature = signing::base64(&signing::hmac_sha256(&account_key(&self.config)?, string_to_sign.as_bytes())?);
        Ok(format!(
            "{}?sv={API_VERSION}&se={}&sr=b&sp=r&sig={}",
            self.blob_url(key),
            encode_query(&expiry),
            encode_query(&signature)
        ))
    }

    async fn put_blob(&self, local_path: &Path, key: &str, content_type: &str, reporter: &ProgressReporter) -> AppResult<()> {
        let (body, size) = transfer::file_body(local_path, reporter.clone()).await?;
        let response = self
            .signed(
                Method::PUT,
                key,
                &[],
                &[
                    ("content-type", content_type.to_string()),
                    ("x-ms-blob-type", "BlockBlob".to_string()),
                ],
                size,
            )?
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn put_blocks(
        &self,
        local_path: &Path,
        key: &str,
        size: u64,
        content_type: &str,
        reporter: &ProgressReporter,
    ) -> AppResult<()> {
        let mut block_ids = Vec::new();
        let ranges = transfer::part_ranges(size, self.ctx.transfer.part_size_bytes);
        for (index, (offset, len)) in ranges.into_iter().enumerate() {
            let block_id = block_id(index);
            let body = transfer::file_part_body(local_path, offset, len, reporter.clone()).await?;
            let response = self
                .signed(
                    Method::PUT,
                    key,
                    &[("blockid", block_id.as_str()), ("comp", "block")],
                    &[],
                    len,
                )?
                .body(body)
                .send()
                .await
                .map_err(classify::transport)?;
            classify::ensure_success(response).await?;
            block_ids.push(block_id);
        }

        let body = block_list_body(&block_ids);
        let response = self
            .signed(
                Method::PUT,
                key,
                &[("comp", "blocklist")],
                &[
                    ("content-type", "application/xml".to_string()),
                    ("x-ms-blob-content-type", content_type.to_string()),
                ],
                body.len() as u64,
            )?
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        debug!(key, blocks = block_ids.len(), "Committed block list");
        Ok(())
    }
}

fn account_key(config: &AzureConfig) -> AppResult<Vec<u8>> {
    signing::base64_decode(&config.account_key)
        .map_err(|_| AppError::validation("account_key must be base64"))
}

/// Fixed-width base64 block id; Azure requires equal lengths within a blob.
fn block_id(index: usize) -> String {
    signing::base64(format!("block-{index:08}").as_bytes())
}

fn block_list_body(ids: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in ids {
        body.push_str(&format!("<Latest>{id}</Latest>"));
    }
    body.push_str("</BlockList>");
    body
}

fn parse_listing(body: &str) -> AppResult<ListResult> {
    let root = xml::parse_document(body, "EnumerationResults")?;
    let mut files = Vec::new();
    let mut folders = Vec::new();
    if let Some(blobs) = root.child("Blobs") {
        for blob in blobs.children_named("Blob") {
            let Some(name) = blob.child_text("Name") else {
                continue;
            };
            let prop = |field: &str| blob.find_text(&["Properties", field]);
            files.push(
                ObjectEntry::new(
                    name,
                    prop("Content-Length").and_then(|s| s.parse().ok()).unwrap_or(0),
                )
                .modified(prop("Last-Modified").and_then(parse_http_date))
                .etag(prop("Etag"))
                .storage_class(prop("AccessTier")),
            );
        }
        for prefix in blobs.children_named("BlobPrefix") {
            if let Some(name) = prefix.child_text("Name") {
                folders.push(FolderEntry::new(name));
            }
        }
    }
    let next = root.child_text("NextMarker").map(str::to_string);
    Ok(ListResult::from_parts(files, folders, next))
}

#[async_trait]
impl StorageProvider for AzureStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Azure
    }

    fn bucket(&self) -> &str {
        &self.config.container
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let result = match self.signed(Method::GET, "", &[("restype", "container")], &[], 0) {
            Ok(request) => match request.send().await {
                Ok(response) => classify::ensure_success(response).await.map(|_| ()),
                Err(e) => Err(classify::transport(e)),
            },
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ConnectionStatus::ok(format!("Container {} is reachable", self.config.container)),
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
            self.put_blocks(local_path, key, size, &content_type, &reporter)
                .await?;
        } else {
            self.put_blob(local_path, key, &content_type, &reporter).await?;
        }
        reporter.finish();
        info!(container = %self.config.container, key, bytes = size, "Uploaded blob");

        let url = if self.ctx.urls.is_public() {
            self.get_public_url(key).await.ok()
        } else {
            None
        };
        Ok(UploadOutcome {
            key: key.to_string(),
            bucket: self.config.container.clone(),
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
            .signed(Method::GET, clean_key(key)?, &[], &[], 0)?
            .send()
            .await
            .map_err(classify::transport)?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded blob");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let response = self
            .signed(Method::DELETE, clean_key(key)?, &[], &[], 0)?
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
        let max_results = options.page_size().to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("comp", "list"),
            ("maxresults", max_results.as_str()),
            ("restype", "container"),
        ];
        if !options.prefix.is_empty() {
            query.push(("prefix", options.prefix.as_str()));
        }
        if !options.delimiter.is_empty() {
            query.push(("delimiter", options.delimiter.as_str()));
        }
        if let Some(marker) = options.continuation_token.as_deref().filter(|m| !m.is_empty()) {
            query.push(("marker", marker));
        }
        let response = self
            .signed(Method::GET, "", &query, &[], 0)?
            .send()
            .await
            .map_err(classify::transport)?;
        parse_listing(&classify::read_text(response).await?)
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.blob_url(clean_key(key)?)),
            UrlPlan::Signed(expires) => self.sas_url(key, expires),
        }
    }

    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>) -> AppResult<String> {
        self.sas_url(key, expires_in.unwrap_or(self.ctx.urls.default_expiry()))
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let response = self
            .signed(Method::HEAD, key, &[], &[], 0)?
            .send()
            .await
            .map_err(classify::transport)?;
        let response = classify::ensure_success(response).await?;
        Ok(info_from_headers(key, response.headers(), Some(ACCESS_TIER_HEADER)))
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .signed(Method::GET, &key, &[], &[("x-ms-range", range_header(cap))], 0)?
                    .send()
                    .await
                    .map_err(classify::transport)?;
                transfer::read_capped(response, cap).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(endpoint: Option<&str>, private: bool) -> AzureStorageProvider {
        let mut profile = ProviderConfig::new(BackendConfig::Azure(AzureConfig {
            account_name: "devstoreaccount1".into(),
            account_key: signing::base64(b"not-a-real-key"),
            container: "photos".into(),
            endpoint: endpoint.map(str::to_string),
        }));
        profile.private = private;
        AzureStorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap()
    }

    #[test]
    fn test_string_to_sign_layout() {
        let azure = provider(Some("http://127.0.0.1:10000/devstoreaccount1"), false);
        let sts = azure.string_to_sign(
            &Method::GET,
            "",
            &[("restype", "container"), ("comp", "list")],
            &[("x-ms-version", API_VERSION.into()), ("x-ms-date", "D".into())],
            0,
        );
        assert_eq!(
            sts,
            "GET\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:D\nx-ms-version:2021-08-06\n\
             /devstoreaccount1/devstoreaccount1/photos\ncomp:list\nrestype:container"
        );
    }

    #[test]
    fn test_block_ids_have_equal_length() {
        assert_eq!(block_id(0).len(), block_id(99_999).len());
        assert!(block_list_body(&[block_id(0)]).contains("<Latest>"));
    }

    #[test]
    fn test_parse_listing() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://a.blob.core.windows.net/" ContainerName="photos">
  <Prefix>img/</Prefix><Delimiter>/</Delimiter>
  <Blobs>
    <Blob><Name>img/a.png</Name><Properties>
      <Last-Modified>Wed, 21 Oct 2015 07:28:00 GMT</Last-Modified><Etag>0x8D</Etag>
      <Content-Length>12</Content-Length><AccessTier>Hot</AccessTier></Properties></Blob>
    <BlobPrefix><Name>img/2024/</Name></BlobPrefix>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;
        let page = parse_listing(body).unwrap();
        assert_eq!(page.files[0].key, "img/a.png");
        assert_eq!(page.files[0].size, 12);
        assert_eq!(page.files[0].storage_class, "Hot");
        assert_eq!(page.folders[0].key, "img/2024/");
        assert!(!page.is_truncated);
    }

    #[tokio::test]
    async fn test_urls() {
        assert_eq!(
            provider(None, false).get_public_url("a b.png").await.unwrap(),
            "https://devstoreaccount1.blob.core.windows.net/photos/a%20b.png"
        );
        let sas = provider(None, true).get_public_url("a.png").await.unwrap();
        assert!(sas.contains("?sv=2021-08-06&se="));
        assert!(sas.contains("&sr=b&sp=r&sig="));
    }
}
