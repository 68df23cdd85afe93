//! Aliyun OSS storage provider.
//!
//! Requests are signed with the OSS V1 scheme (HMAC-SHA1 over verb,
//! `Content-MD5`, `Content-Type`, date, `x-oss-*` headers and the canonical
//! resource). Listing uses marker pagination; batch delete posts up to 1000
//! keys to `?delete`; large uploads use the S3-dialect multipart flow.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, DATE, RANGE};
use reqwest::{Client, Method, RequestBuilder};
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, OssConfig, ProviderConfig};
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

/// Query parameters that are part of the canonical resource.
const SUBRESOURCES: &[&str] = &[
    "acl",
    "delete",
    "location",
    "partNumber",
    "uploadId",
    "uploads",
];

const STORAGE_CLASS_HEADER: &str = "x-oss-storage-class";

/// Aliyun OSS storage provider.
#[derive(Debug, Clone)]
pub struct OssStorageProvider {
    ctx: FacadeContext,
    config: OssConfig,
    client: Client,
    /// Virtual-hosted bucket origin, e.g. `https://photos.oss-cn-hangzhou.aliyuncs.com`.
    origin: String,
}

impl OssStorageProvider {
    /// Create a provider from a normalized profile.
    pub fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Oss(config) = profile.backend.clone() else {
            return Err(AppError::configuration("Expected an oss profile"));
        };
        let origin = bucket_origin(&config);
        let ctx = FacadeContext::new(profile, transfer, true);
        let client = ctx.http_client()?;
        info!(bucket = %config.bucket, origin = %origin, "Initialized OSS storage provider");
        Ok(Self {
            ctx,
            config,
            client,
            origin,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.origin, encode_key(key))
    }

    fn canonical_resource(&self, key: &str, query: &[(&str, &str)]) -> String {
        let mut resource = format!("/{}/{}", self.config.bucket, key);
        let mut sub: Vec<&(&str, &str)> = query
            .iter()
            .filter(|(k, _)| SUBRESOURCES.contains(k))
            .collect();
        sub.sort_by(|a, b| a.0.cmp(b.0));
        if !sub.is_empty() {
            let parts: Vec<String> = sub
                .iter()
                .map(|(k, v)| if v.is_empty() { k.to_string() } else { format!("{k}={v}") })
                .collect();
            resource.push('?');
            resource.push_str(&parts.join("&"));
        }
        resource
    }

    fn signature(&self, string_to_sign: &str) -> AppResult<String> {
        let mac = signing::hmac_sha1(
            self.config.access_key_secret.as_bytes(),
            string_to_sign.as_bytes(),
        )?;
        Ok(signing::base64(&mac))
    }

    fn sign_url(&self, key: &str, expires: Duration) -> AppResult<String> {
        let key = clean_key(key)?;
        let expires_at = Utc::now().timestamp() + expires.as_secs() as i64;
        let string_to_sign = format!(
            "GET\n\n\n{expires_at}\n{}",
            self.canonical_resource(key, &[])
        );
        let signature = self.signature(&string_to_sign)?;
        Ok(format!(
            "{}?OSSAccessKeyId={}&Expires={expires_at}&Signature={}",
            self.object_url(key),
            encode_query(&self.config.access_key_id),
            encode_query(&signature)
        ))
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

impl S3Dialect for OssStorageProvider {
    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
    ) -> AppResult<RequestBuilder> {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .unwrap_or("")
        };
        let mut oss_headers: Vec<(String, &str)> = headers
            .iter()
            .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-oss-"))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim()))
            .collect();
        oss_headers.sort();
        let canonical_headers: String = oss_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let date = signing::http_date(Utc::now());
        let string_to_sign = format!(
            "{}\n{}\n{}\n{date}\n{canonical_headers}{}",
            method.as_str(),
            header("content-md5"),
            header("content-type"),
            self.canonical_resource(key, query)
        );
        let authorization = format!(
            "OSS {}:{}",
            self.config.access_key_id,
            self.signature(&string_to_sign)?
        );

        let mut url = self.object_url(key);
        let query = multipart::request_query(query);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let mut request = self
            .client
            .request(method, url)
            .header(DATE, date)
            .header(AUTHORIZATION, authorization);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        Ok(request)
    }
}

#[async_trait]
impl StorageProvider for OssStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Oss
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

fn bucket_origin(config: &OssConfig) -> String {
    match &config.endpoint {
        Some(endpoint) => match endpoint.split_once("://") {
            Some((scheme, host)) => format!("{scheme}://{}.{host}", config.bucket),
            None => format!("https://{}.{endpoint}", config.bucket),
        },
        None => {
            let region = if config.region.starts_with("oss-") {
                config.region.clone()
            } else {
                format!("oss-{}", config.region)
            };
            format!("https://{}.{region}.aliyuncs.com", config.bucket)
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::CONTENT_TYPE;

    use super::*;

    fn provider(private: bool) -> OssStorageProvider {
        let mut profile = ProviderConfig::new(BackendConfig::Oss(OssConfig {
            access_key_id: "LTAI".into(),
            access_key_secret: "secret".into(),
            bucket: "photos".into(),
            region: "cn-hangzhou".into(),
            endpoint: None,
        }));
        profile.private = private;
        OssStorageProvider::new(profile.normalize().unwrap(), TransferConfig::default()).unwrap()
    }

    #[test]
    fn test_canonical_resource_keeps_only_subresources() {
        let oss = provider(false);
        assert_eq!(
            oss.canonical_resource("a.png", &[("uploadId", "42"), ("partNumber", "1")]),
            "/photos/a.png?partNumber=1&uploadId=42"
        );
        assert_eq!(
            oss.canonical_resource("", &[("prefix", "img/"), ("delete", "")]),
            "/photos/?delete"
        );
    }

    #[tokio::test]
    async fn test_urls() {
        let oss = provider(false);
        assert_eq!(
            oss.get_public_url("img/a b.png").await.unwrap(),
            "https://photos.oss-cn-hangzhou.aliyuncs.com/img/a%20b.png"
        );

        let url = provider(true).get_public_url("img/a.png").await.unwrap();
        assert!(url.starts_with("https://photos.oss-cn-hangzhou.aliyuncs.com/img/a.png?OSSAccessKeyId=LTAI&Expires="));
        assert!(url.contains("&Signature="));
    }

    #[test]
    fn test_signed_request_headers() {
        let oss = provider(false);
        let request = oss
            .signed(Method::PUT, "a.txt", &[], &[("content-type", "text/plain".into())])
            .unwrap()
            .build()
            .unwrap();
        let auth = request.headers()[AUTHORIZATION].to_str().unwrap();
        assert!(auth.starts_with("OSS LTAI:"));
        assert_eq!(request.headers()[CONTENT_TYPE], "text/plain");
        assert!(request.headers().contains_key(DATE));
    }
}
