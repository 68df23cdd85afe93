//! Tencent COS storage provider.
//!
//! Requests carry a `q-sign-algorithm=sha1` authorization: a sign key
//! derived from the key time, then HMAC-SHA1 over the SHA-1 of the
//! canonical request (method, path, sorted parameters, sorted headers).
//! Signed URLs carry the same string in the query. Listing, batch delete
//! and multipart follow the S3 dialect.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, RANGE};
use reqwest::{Client, Method, RequestBuilder};
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, CosConfig, ProviderConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, ListOptions, ListResult, PreviewContent,
    ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch::{self, DEFAULT_BATCH_LIMIT};
use crate::classify;
use crate::multipart::{self, S3Dialect};
use crate::providers::{FacadeContext, clean_key, content_type_for, info_from_headers, range_header};
use crate::signing;
use crate::transfer;
use crate::url::{UrlPlan, encode_key, encode_query};

/// Lifetime of the authorization attached to ordinary requests.
const REQUEST_SIGN_SECS: i64 = 3600;
/// Clock skew tolerated at the start of the key time.
const CLOCK_SKEW_SECS: i64 = 60;

const STORAGE_CLASS_HEADER: &str = "x-cos-storage-class";

/// Tencent COS storage provider.
#[derive(Debug, Clone)]
pub struct CosStorageProvider {
    ctx: FacadeContext,
    config: CosConfig,
    client: Client,
    host: String,
}

impl CosStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Cos(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected a cos profile"));
        };
        let host = format!("{}.cos.{}.myqcloud.com", config.bucket, config.region);
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(bucket = %config.bucket, region = %config.region, "Initialized COS storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            host,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}/{}", self.host, encode_key(key))
    }

    /// Build the `q-sign-*` authorization string valid from `start` to `end`
    /// (unix seconds).
    fn authorization(
        &self,
        method: &Method,
        key: &str,
        params: &[(&str, &str)],
        headers: &[(&str, &str)],
        start: i64,
        end: i64,
    ) -> AppResult<String> {
        let key_time = format!("{start};{end}");
        let sign_key = hex::encode(signing::hmac_sha1(
            self.config.secret_key.as_bytes(),
            key_time.as_bytes(),
        )?);

        let (param_list, param_string) = canonical_pairs(params);
        let (header_list, header_string) = canonical_pairs(headers);
        let http_string = format!(
            "{}\n/{key}\n{param_string}\n{header_string}\n",
            method.as_str().to_ascii_lowercase()
        );
        let string_to_sign = format!(
            "sha1\n{key_time}\n{}\n",
            signing::sha1_hex(http_string.as_bytes())
        );
        let signature = hex::encode(signing::hmac_sha1(
            sign_key.as_bytes(),
            string_to_sign.as_bytes(),
        )?);

        Ok(format!(
            "q-sign-algorithm=sha1&q-ak={}&q-sign-time={key_time}&q-key-time={key_time}\
             &q-header-list={header_list}&q-url-param-list={param_list}&q-signature={signature}",
            self.config.secret_id
        ))
    }

    fn sign_url(&self, key: &str, expires: Duration) -> AppResult<String> {
        let key = clean_key(key)?;
        let now = Utc::now().timestamp();
        let authorization = self.authorization(
            &Method::GET,
            key,
            &[],
            &[("host", self.host.as_str())],
            now - CLOCK_SKEW_SECS,
            now + expires.as_secs() as i64,
        )?;
        // Values such as the key time contain `;` and must be escaped.
        let query: Vec<String> = authorization
            .split('&')
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => format!("{k}={}", encode_query(v)),
                None => pair.to_string(),
            })
            .collect();
        Ok(format!("{}?{}", self.object_url(key), query.join("&")))
    }

    async fn delete_chunk(&self, keys: Vec<String>) -> AppResult<DeleteOutcome> {
        let body = multipart::delete_body(&keys);
        let response = self
            .signed(
                Method::POST,
                "",
                &[("delete", "")],
                &[
                    ("content-md5", signing::md5_base64(body.as_bytes())),
                    ("content-type", "application/xml".to_string()),
                ],
            )?
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        let body = classify::read_text(response).await?;
        multipart::delete_outcome(&keys, &body)
    }
}

/// Lowercased, encoded, sorted `(list, k=v&k=v)` for parameters or headers.
fn canonical_pairs(pairs: &[(&str, &str)]) -> (String, String) {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (encode_query(&k.to_ascii_lowercase()), encode_query(v)))
        .collect();
    encoded.sort();
    let list = encoded
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    (list, string)
}

impl S3Dialect for CosStorageProvider {
    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
    ) -> AppResult<RequestBuilder> {
        let mut signed_headers: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (*k, v.as_str()))
            .collect();
        signed_headers.push(("host", self.host.as_str()));

        let now = Utc::now().timestamp();
        let authorization = self.authorization(
            &method,
            key,
            query,
            &signed_headers,
            now - CLOCK_SKEW_SECS,
            now + REQUEST_SIGN_SECS,
        )?;

        let mut url = self.object_url(key);
        let query = multipart::request_query(query);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut request = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, authorization);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        Ok(request)
    }
}

#[async_trait]
impl StorageProvider for CosStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Cos
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn test_connection(&self) -> ConnectionStatus {
        let response = match self.signed(Method::HEAD, "", &[], &[]) {
            Ok(request) => request.send().await.map_err(classify::transport),
            Err(e) => Err(e),
        };
        let result = match response {
            Ok(response) => classify::ensure_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => ConnectionStatus::ok(format!("Bucket {} is reachable", self.config.bucket)),
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
            multipart::upload(
                self,
                key,
                local_path,
                size,
                self.ctx.transfer.part_size_bytes,
                &content_type,
                reporter,
            )
            .await?;
        } else {
            let (body, size) = transfer::file_body(local_path, reporter.clone()).await?;
            let response = self
                .signed(Method::PUT, key, &[], &[("content-type", content_type.clone())])?
                .header(CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await
                .map_err(classify::transport)?;
            classify::ensure_success(response).await?;
            reporter.finish();
        }
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
            .signed(Method::GET, clean_key(key)?, &[], &[])?
            .send()
            .await
            .map_err(classify::transport)?;
        let bytes = transfer::write_response(response, local_path, self.ctx.reporter(progress, 0)).await?;
        debug!(key, bytes, "Downloaded object");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let response = self
            .signed(Method::DELETE, clean_key(key)?, &[], &[])?
            .send()
            .await
            .map_err(classify::transport)?;
        classify::ensure_success(response).await?;
        Ok(())
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_in_chunks(keys, DEFAULT_BATCH_LIMIT, |chunk| self.delete_chunk(chunk)).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let max_keys = options.page_size().to_string();
        let mut query: Vec<(&str, &str)> = vec![("max-keys", max_keys.as_str())];
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
            .signed(Method::GET, "", &query, &[])?
            .send()
            .await
            .map_err(classify::transport)?;
        let page = multipart::parse_bucket_listing(&classify::read_text(response).await?)?;
        Ok(ListResult::from_parts(page.files, page.folders, page.next_marker))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => Ok(self.object_url(clean_key(key)?)),
            UrlPlan::Signed(expires) => self.sign_url(key, expires),
        }
    }

    async fn get_presigned_url(&self, key: &str, expires_in: Option<Duration>) -> AppResult<String> {
        self.sign_url(key, expires_in.unwrap_or(self.ctx.urls.default_expiry()))
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let key = clean_key(key)?;
        let response = self
            .signed(Method::HEAD, key, &[], &[])?
            .send()
            .await
            .map_err(classify::transport)?;
        let response = classify::ensure_success(response).await?;
        Ok(info_from_headers(key, response.headers(), Some(STORAGE_CLASS_HEADER)))
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let key = info.key.clone();
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let response = self
                    .signed(Method::GET, &key, &[], &[])?
                    .header(RANGE, range_header(cap))
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

    fn provider(private: bool) -> CosStorageProvider {
        let mut profile = ProviderConfig::new(BackendConfig::Cos(CosConfig {
            secret_id: "AKIDQjz3ltompVjBni5LitkWHFlFpwkn9U5q".into(),
            secret_key: "BQYIM75p8x0iWVFSIgqEKwFprpRSVHlz".into(),
            bucket: "examplebucket-1250000000".into(),
            region: "ap-beijing".into(),
        }));
        profile.private = private;
        CosStorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap()
    }

    #[test]
    fn test_canonical_pairs_sorted_and_encoded() {
        let (list, string) = canonical_pairs(&[
            ("Host", "b.cos.ap-beijing.myqcloud.com"),
            ("Content-Type", "image/png"),
            ("x-cos-meta-a", "a b"),
        ]);
        assert_eq!(list, "content-type;host;x-cos-meta-a");
        assert_eq!(
            string,
            "content-type=image%2Fpng&host=b.cos.ap-beijing.myqcloud.com&x-cos-meta-a=a%20b"
        );
    }

    #[test]
    fn test_authorization_is_deterministic() {
        let cos = provider(false);
        let a = cos
            .authorization(&Method::PUT, "exampleobject", &[], &[("host", "h")], 1557989151, 1557996351)
            .unwrap();
        let b = cos
            .authorization(&Method::PUT, "exampleobject", &[], &[("host", "h")], 1557989151, 1557996351)
            .unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(
            "q-sign-algorithm=sha1&q-ak=AKIDQjz3ltompVjBni5LitkWHFlFpwkn9U5q&q-sign-time=1557989151;1557996351"
        ));
        assert!(a.contains("&q-header-list=host&q-url-param-list=&q-signature="));
    }

    #[tokio::test]
    async fn test_urls() {
        assert_eq!(
            provider(false).get_public_url("a/b.png").await.unwrap(),
            "https://examplebucket-1250000000.cos.ap-beijing.myqcloud.com/a/b.png"
        );
        let url = provider(true).get_public_url("a/b.png").await.unwrap();
        assert!(url.contains("?q-sign-algorithm=sha1&q-ak="));
        assert!(url.contains("q-sign-time="));
        assert!(url.contains("%3B"));
    }
}
