//! Storage provider type enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// The type of storage backend a profile talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// S3-compatible object storage (AWS, R2, MinIO, Wasabi, B2 S3 API).
    S3,
    /// Aliyun Object Storage Service.
    Oss,
    /// Tencent Cloud Object Storage.
    Cos,
    /// Qiniu Kodo.
    Qiniu,
    /// Upyun Storage Service.
    Upyun,
    /// A GitHub repository used as a file store.
    Github,
    /// A WebDAV server.
    Webdav,
    /// Azure Blob Storage.
    Azure,
    /// Backblaze B2 native API.
    B2,
    /// Dropbox.
    Dropbox,
    /// Local filesystem directory.
    Local,
}

impl ProviderType {
    /// Every supported provider type.
    pub const ALL: [ProviderType; 11] = [
        Self::S3,
        Self::Oss,
        Self::Cos,
        Self::Qiniu,
        Self::Upyun,
        Self::Github,
        Self::Webdav,
        Self::Azure,
        Self::B2,
        Self::Dropbox,
        Self::Local,
    ];

    /// Return the provider type as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Oss => "oss",
            Self::Cos => "cos",
            Self::Qiniu => "qiniu",
            Self::Upyun => "upyun",
            Self::Github => "github",
            Self::Webdav => "webdav",
            Self::Azure => "azure",
            Self::B2 => "b2",
            Self::Dropbox => "dropbox",
            Self::Local => "local",
        }
    }

    /// Human-facing product name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::S3 => "S3-compatible",
            Self::Oss => "Aliyun OSS",
            Self::Cos => "Tencent COS",
            Self::Qiniu => "Qiniu Kodo",
            Self::Upyun => "Upyun USS",
            Self::Github => "GitHub",
            Self::Webdav => "WebDAV",
            Self::Azure => "Azure Blob Storage",
            Self::B2 => "Backblaze B2",
            Self::Dropbox => "Dropbox",
            Self::Local => "Local filesystem",
        }
    }

    /// Backends without any default public endpoint.
    pub fn requires_custom_domain(&self) -> bool {
        matches!(self, Self::Qiniu)
    }

    /// Backends whose transport honours an explicit proxy.
    pub fn supports_proxy(&self) -> bool {
        !matches!(self, Self::S3 | Self::Local)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                AppError::validation(format!(
                    "Invalid storage provider type: '{s}'. Expected one of: {}",
                    names.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for t in ProviderType::ALL {
            assert_eq!(t.as_str().parse::<ProviderType>().unwrap(), t);
        }
        assert_eq!(" GitHub ".parse::<ProviderType>().unwrap(), ProviderType::Github);
        assert!("ftp".parse::<ProviderType>().is_err());
    }
}
