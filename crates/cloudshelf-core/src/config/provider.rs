//! Provider profile configuration and its normalization.
//!
//! A profile is deserialized from TOML as a flat table whose `type` key
//! selects the backend:
//!
//! ```toml
//! [profiles.photos]
//! type = "oss"
//! access_key_id = "LTAI..."
//! access_key_secret = "..."
//! bucket = "my-photos"
//! region = "oss-cn-hangzhou"
//! custom_domain = "img.example.com"
//! ```
//!
//! Facades are only ever built from the output of [`ProviderConfig::normalize`].

use std::fmt;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppError;
use crate::result::AppResult;
use crate::types::provider::ProviderType;

/// One configured storage profile.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend-specific credentials and addressing.
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Operator-configured domain fronting the bucket/repository.
    #[serde(default)]
    pub custom_domain: Option<String>,
    /// Whether objects must not be addressed through the default public endpoint.
    #[serde(default)]
    pub private: bool,
    /// Explicit HTTP(S)/SOCKS proxy URL for this profile's transport.
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Backend selection, keyed by the `type` field.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// S3-compatible object storage.
    S3(S3Config),
    /// Aliyun OSS.
    Oss(OssConfig),
    /// Tencent COS.
    Cos(CosConfig),
    /// Qiniu Kodo.
    Qiniu(QiniuConfig),
    /// Upyun USS.
    Upyun(UpyunConfig),
    /// GitHub repository.
    Github(GithubConfig),
    /// WebDAV server.
    Webdav(WebdavConfig),
    /// Azure Blob Storage.
    Azure(AzureConfig),
    /// Backblaze B2.
    B2(B2Config),
    /// Dropbox.
    Dropbox(DropboxConfig),
    /// Local filesystem.
    Local(LocalConfig),
}

/// S3-compatible object storage.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct S3Config {
    /// Access key ID.
    #[validate(length(min = 1, message = "access_key_id is required"))]
    pub access_key_id: String,
    /// Secret access key.
    #[validate(length(min = 1, message = "secret_access_key is required"))]
    pub secret_access_key: String,
    /// Optional STS session token.
    #[serde(default)]
    pub session_token: Option<String>,
    /// Bucket name.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// Region; defaults to `us-east-1`.
    #[serde(default = "default_s3_region")]
    pub region: String,
    /// Endpoint URL for non-AWS services (R2, MinIO, Wasabi).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`.
    #[serde(default)]
    pub force_path_style: bool,
    /// Storage class applied to uploads.
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Aliyun OSS.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct OssConfig {
    /// AccessKey ID.
    #[validate(length(min = 1, message = "access_key_id is required"))]
    pub access_key_id: String,
    /// AccessKey secret.
    #[validate(length(min = 1, message = "access_key_secret is required"))]
    pub access_key_secret: String,
    /// Bucket name.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// Region endpoint prefix, e.g. `oss-cn-hangzhou`.
    #[validate(length(min = 1, message = "region is required"))]
    pub region: String,
    /// Endpoint override, e.g. `https://oss-cn-hangzhou-internal.aliyuncs.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Tencent COS.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct CosConfig {
    /// SecretId.
    #[validate(length(min = 1, message = "secret_id is required"))]
    pub secret_id: String,
    /// SecretKey.
    #[validate(length(min = 1, message = "secret_key is required"))]
    pub secret_key: String,
    /// Bucket name including the APPID suffix, e.g. `photos-1250000000`.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// Region, e.g. `ap-guangzhou`.
    #[validate(length(min = 1, message = "region is required"))]
    pub region: String,
}

/// Qiniu Kodo.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct QiniuConfig {
    /// AccessKey.
    #[validate(length(min = 1, message = "access_key is required"))]
    pub access_key: String,
    /// SecretKey.
    #[validate(length(min = 1, message = "secret_key is required"))]
    pub secret_key: String,
    /// Bucket name.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// Region id (`z0`, `z1`, `z2`, `na0`, `as0`, ...); defaults to `z0`.
    #[serde(default = "default_qiniu_region")]
    pub region: String,
    /// Single host serving every Qiniu API; only used for private deployments.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Upyun USS.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct UpyunConfig {
    /// Operator name.
    #[validate(length(min = 1, message = "operator is required"))]
    pub operator: String,
    /// Operator password.
    #[validate(length(min = 1, message = "password is required"))]
    pub password: String,
    /// Service (bucket) name.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// REST API base; defaults to `https://v0.api.upyun.com`.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// GitHub repository.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct GithubConfig {
    /// Personal access token.
    #[validate(length(min = 1, message = "token is required"))]
    pub token: String,
    /// Repository owner (user or organization).
    #[validate(length(min = 1, message = "owner is required"))]
    pub owner: String,
    /// Repository name.
    #[validate(length(min = 1, message = "repo is required"))]
    pub repo: String,
    /// Branch to read and commit to; defaults to `main`.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// REST API base; defaults to `https://api.github.com`.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// WebDAV server.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct WebdavConfig {
    /// Collection URL that acts as the storage root.
    #[validate(length(min = 1, message = "endpoint is required"))]
    pub endpoint: String,
    /// Basic auth user.
    #[validate(length(min = 1, message = "username is required"))]
    pub username: String,
    /// Basic auth password.
    #[serde(default)]
    pub password: String,
}

/// Azure Blob Storage.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct AzureConfig {
    /// Storage account name.
    #[validate(length(min = 1, message = "account_name is required"))]
    pub account_name: String,
    /// Base64 account key.
    #[validate(length(min = 1, message = "account_key is required"))]
    pub account_key: String,
    /// Container name.
    #[validate(length(min = 1, message = "container is required"))]
    pub container: String,
    /// Blob service endpoint override (Azurite, sovereign clouds).
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Backblaze B2 native API.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct B2Config {
    /// Application key ID.
    #[validate(length(min = 1, message = "key_id is required"))]
    pub key_id: String,
    /// Application key.
    #[validate(length(min = 1, message = "application_key is required"))]
    pub application_key: String,
    /// Bucket name.
    #[validate(length(min = 1, message = "bucket is required"))]
    pub bucket: String,
    /// Authorization API base; defaults to `https://api.backblazeb2.com`.
    #[serde(default)]
    pub api_base: Option<String>,
}

/// Dropbox.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct DropboxConfig {
    /// OAuth2 access token.
    #[validate(length(min = 1, message = "access_token is required"))]
    pub access_token: String,
    /// Folder inside the Dropbox that acts as the storage root.
    #[serde(default)]
    pub root_path: String,
}

/// Local filesystem directory.
#[derive(Clone, Serialize, Deserialize, Validate)]
pub struct LocalConfig {
    /// Root directory.
    #[validate(length(min = 1, message = "root_path is required"))]
    pub root_path: String,
}

impl ProviderConfig {
    /// Build a profile with no domain, privacy flag, or proxy.
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            custom_domain: None,
            private: false,
            proxy: None,
        }
    }

    /// The backend type of this profile.
    pub fn provider_type(&self) -> ProviderType {
        self.backend.provider_type()
    }

    /// Trim and validate every field.
    ///
    /// Returns a `Validation` error naming the first problem found; a profile
    /// that fails here must never reach a Facade constructor.
    pub fn normalize(mut self) -> AppResult<Self> {
        let provider = self.provider_type();
        self.backend.trim();
        self.backend.validate_fields()?;

        self.custom_domain = trim_opt(self.custom_domain).map(|d| normalize_base_url(&d));
        self.proxy = trim_opt(self.proxy);

        if provider.requires_custom_domain() && self.custom_domain.is_none() {
            return Err(AppError::validation(format!(
                "custom_domain is required for {provider} profiles"
            )));
        }

        if let Some(proxy) = &self.proxy {
            if !provider.supports_proxy() {
                return Err(AppError::validation(format!(
                    "proxy is not supported for {provider} profiles"
                )));
            }
            let scheme_ok = ["http://", "https://", "socks5://", "socks5h://"]
                .iter()
                .any(|s| proxy.starts_with(s));
            if !scheme_ok {
                return Err(AppError::validation(format!(
                    "proxy must be an http, https, or socks5 URL, got '{proxy}'"
                )));
            }
        }

        Ok(self)
    }
}

impl BackendConfig {
    /// The backend type of this configuration.
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Self::S3(_) => ProviderType::S3,
            Self::Oss(_) => ProviderType::Oss,
            Self::Cos(_) => ProviderType::Cos,
            Self::Qiniu(_) => ProviderType::Qiniu,
            Self::Upyun(_) => ProviderType::Upyun,
            Self::Github(_) => ProviderType::Github,
            Self::Webdav(_) => ProviderType::Webdav,
            Self::Azure(_) => ProviderType::Azure,
            Self::B2(_) => ProviderType::B2,
            Self::Dropbox(_) => ProviderType::Dropbox,
            Self::Local(_) => ProviderType::Local,
        }
    }

    /// Bucket-like identifier reported in upload outcomes.
    pub fn bucket_label(&self) -> String {
        match self {
            Self::S3(c) => c.bucket.clone(),
            Self::Oss(c) => c.bucket.clone(),
            Self::Cos(c) => c.bucket.clone(),
            Self::Qiniu(c) => c.bucket.clone(),
            Self::Upyun(c) => c.bucket.clone(),
            Self::Github(c) => format!("{}/{}", c.owner, c.repo),
            Self::Webdav(c) => c.endpoint.clone(),
            Self::Azure(c) => c.container.clone(),
            Self::B2(c) => c.bucket.clone(),
            Self::Dropbox(c) if c.root_path.is_empty() => "/".to_string(),
            Self::Dropbox(c) => c.root_path.clone(),
            Self::Local(c) => c.root_path.clone(),
        }
    }

    fn trim(&mut self) {
        match self {
            Self::S3(c) => {
                trim(&mut c.access_key_id);
                trim(&mut c.secret_access_key);
                trim(&mut c.bucket);
                trim(&mut c.region);
                if c.region.is_empty() {
                    c.region = default_s3_region();
                }
                c.session_token = trim_opt(c.session_token.take());
                c.endpoint = trim_opt(c.endpoint.take()).map(|e| normalize_base_url(&e));
                c.storage_class = trim_opt(c.storage_class.take());
            }
            Self::Oss(c) => {
                trim(&mut c.access_key_id);
                trim(&mut c.access_key_secret);
                trim(&mut c.bucket);
                trim(&mut c.region);
                c.endpoint = trim_opt(c.endpoint.take()).map(|e| normalize_base_url(&e));
            }
            Self::Cos(c) => {
                trim(&mut c.secret_id);
                trim(&mut c.secret_key);
                trim(&mut c.bucket);
                trim(&mut c.region);
            }
            Self::Qiniu(c) => {
                trim(&mut c.access_key);
                trim(&mut c.secret_key);
                trim(&mut c.bucket);
                trim(&mut c.region);
                if c.region.is_empty() {
                    c.region = default_qiniu_region();
                }
                c.api_base = trim_opt(c.api_base.take()).map(|e| normalize_base_url(&e));
            }
            Self::Upyun(c) => {
                trim(&mut c.operator);
                trim(&mut c.password);
                trim(&mut c.bucket);
                c.api_base = trim_opt(c.api_base.take()).map(|e| normalize_base_url(&e));
            }
            Self::Github(c) => {
                trim(&mut c.token);
                trim(&mut c.owner);
                trim(&mut c.repo);
                trim(&mut c.branch);
                if c.branch.is_empty() {
                    c.branch = default_branch();
                }
                c.api_base = trim_opt(c.api_base.take()).map(|e| normalize_base_url(&e));
            }
            Self::Webdav(c) => {
                trim(&mut c.endpoint);
                trim(&mut c.username);
                c.endpoint = c.endpoint.trim_end_matches('/').to_string();
            }
            Self::Azure(c) => {
                trim(&mut c.account_name);
                trim(&mut c.account_key);
                trim(&mut c.container);
                c.endpoint = trim_opt(c.endpoint.take()).map(|e| normalize_base_url(&e));
            }
            Self::B2(c) => {
                trim(&mut c.key_id);
                trim(&mut c.application_key);
                trim(&mut c.bucket);
                c.api_base = trim_opt(c.api_base.take()).map(|e| normalize_base_url(&e));
            }
            Self::Dropbox(c) => {
                trim(&mut c.access_token);
                c.root_path = c.root_path.trim().trim_matches('/').to_string();
            }
            Self::Local(c) => trim(&mut c.root_path),
        }
    }

    fn validate_fields(&self) -> AppResult<()> {
        let result = match self {
            Self::S3(c) => c.validate(),
            Self::Oss(c) => c.validate(),
            Self::Cos(c) => c.validate(),
            Self::Qiniu(c) => c.validate(),
            Self::Upyun(c) => c.validate(),
            Self::Github(c) => c.validate(),
            Self::Webdav(c) => c.validate(),
            Self::Azure(c) => c.validate(),
            Self::B2(c) => c.validate(),
            Self::Dropbox(c) => c.validate(),
            Self::Local(c) => c.validate(),
        };
        result.map_err(|e| {
            AppError::validation(format!(
                "Invalid {} configuration: {e}",
                self.provider_type()
            ))
        })
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("backend", &self.backend)
            .field("custom_domain", &self.custom_domain)
            .field("private", &self.private)
            .field("proxy", &self.proxy.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("type", &self.provider_type())
            .field("bucket", &self.bucket_label())
            .field("credentials", &"<redacted>")
            .finish()
    }
}

/// Backend configs print only their type name.
macro_rules! redacted_debug {
    ($($ty:ident),+ $(,)?) => {
        $(impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty)).finish_non_exhaustive()
            }
        })+
    };
}

redacted_debug!(
    S3Config,
    OssConfig,
    CosConfig,
    QiniuConfig,
    UpyunConfig,
    GithubConfig,
    WebdavConfig,
    AzureConfig,
    B2Config,
    DropboxConfig,
    LocalConfig,
);

/// Trim surrounding whitespace and any trailing `/`; add `https://` when no
/// scheme is present.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn trim(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

fn trim_opt(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_qiniu_region() -> String {
    "z0".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(bucket: &str) -> ProviderConfig {
        ProviderConfig::new(BackendConfig::S3(S3Config {
            access_key_id: "  AKIA123 ".into(),
            secret_access_key: "secret\n".into(),
            session_token: Some("   ".into()),
            bucket: bucket.into(),
            region: " ".into(),
            endpoint: Some("minio.local:9000/".into()),
            force_path_style: true,
            storage_class: None,
        }))
    }

    #[test]
    fn test_normalize_trims_and_defaults() {
        let config = s3(" photos ").normalize().unwrap();
        let BackendConfig::S3(c) = &config.backend else {
            panic!("expected s3");
        };
        assert_eq!(c.access_key_id, "AKIA123");
        assert_eq!(c.secret_access_key, "secret");
        assert_eq!(c.bucket, "photos");
        assert_eq!(c.region, "us-east-1");
        assert_eq!(c.session_token, None);
        assert_eq!(c.endpoint.as_deref(), Some("https://minio.local:9000"));
    }

    #[test]
    fn test_normalize_rejects_blank_required_field() {
        let err = s3("   ").normalize().unwrap_err();
        assert!(err.message.contains("bucket is required"), "{}", err.message);
    }

    #[test]
    fn test_custom_domain_normalized() {
        let mut config = s3("photos");
        config.custom_domain = Some(" cdn.example.com/ ".into());
        let config = config.normalize().unwrap();
        assert_eq!(config.custom_domain.as_deref(), Some("https://cdn.example.com"));
    }

    #[test]
    fn test_qiniu_requires_custom_domain() {
        let config = ProviderConfig::new(BackendConfig::Qiniu(QiniuConfig {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            bucket: "b".into(),
            region: String::new(),
            api_base: None,
        }));
        let err = config.normalize().unwrap_err();
        assert!(err.message.contains("custom_domain"));
    }

    #[test]
    fn test_proxy_rejected_for_s3() {
        let mut config = s3("photos");
        config.proxy = Some("http://127.0.0.1:7890".into());
        assert!(config.normalize().is_err());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rendered = format!("{:?}", s3("photos"));
        assert!(!rendered.contains("AKIA123"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("photos"));
    }

    #[test]
    fn test_deserialize_tagged_profile() {
        let json = serde_json::json!({
            "type": "github",
            "token": "ghp_x",
            "owner": "octo",
            "repo": "assets",
            "custom_domain": "cdn.jsdelivr.net/gh/octo/assets",
            "proxy": "http://127.0.0.1:7890"
        });
        let config: ProviderConfig = serde_json::from_value(json).unwrap();
        let config = config.normalize().unwrap();
        assert_eq!(config.provider_type(), ProviderType::Github);
        let BackendConfig::Github(c) = &config.backend else {
            panic!("expected github");
        };
        assert_eq!(c.branch, "main");
        assert_eq!(config.backend.bucket_label(), "octo/assets");
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:7890"));
    }
}
