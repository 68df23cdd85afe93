//! Object, listing, and operation outcome types shared by every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Storage class reported when a backend has no tier concept.
pub const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

/// A stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEntry {
    /// Forward-slash separated key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modified timestamp, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
    /// Opaque content fingerprint (ETag, sha, content hash).
    pub etag: Option<String>,
    /// Backend tier label.
    pub storage_class: String,
}

impl ObjectEntry {
    /// Entry with only a key and size; other fields take their defaults.
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
            storage_class: DEFAULT_STORAGE_CLASS.to_string(),
        }
    }

    /// Set the last modified timestamp.
    pub fn modified(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_modified = at;
        self
    }

    /// Set the content fingerprint; surrounding quotes are stripped.
    pub fn etag(mut self, etag: Option<impl Into<String>>) -> Self {
        self.etag = etag
            .map(|e| e.into().trim_matches('"').to_string())
            .filter(|e| !e.is_empty());
        self
    }

    /// Set the storage class; blank values keep the default.
    pub fn storage_class(mut self, class: Option<impl Into<String>>) -> Self {
        if let Some(class) = class.map(Into::into).filter(|c| !c.is_empty()) {
            self.storage_class = class;
        }
        self
    }
}

/// A folder-like common prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    /// Prefix ending in the delimiter.
    pub key: String,
    /// Always `true`; kept for the IPC shape.
    pub is_folder: bool,
}

impl FolderEntry {
    /// Build a folder entry, appending `/` when missing.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut key = prefix.into();
        if !key.ends_with('/') {
            key.push('/');
        }
        Self {
            key,
            is_folder: true,
        }
    }
}

/// Listing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Only keys starting with this prefix.
    #[serde(default)]
    pub prefix: String,
    /// Group keys by this separator; empty means a flat recursive listing.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Cursor returned by the previous page.
    #[serde(default)]
    pub continuation_token: Option<String>,
    /// Page size.
    #[serde(default = "default_max_keys")]
    pub max_keys: u32,
}

impl ListOptions {
    /// First page under `prefix` with the default delimiter and page size.
    pub fn under(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Flat recursive listing (no delimiter).
    pub fn recursive(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            delimiter: String::new(),
            ..Self::default()
        }
    }

    /// Same request resumed from `token`.
    pub fn resume(&self, token: Option<String>) -> Self {
        Self {
            continuation_token: token,
            ..self.clone()
        }
    }

    /// Page size clamped to the 1..=1000 range every backend accepts.
    pub fn page_size(&self) -> u32 {
        self.max_keys.clamp(1, 1000)
    }
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            delimiter: default_delimiter(),
            continuation_token: None,
            max_keys: default_max_keys(),
        }
    }
}

fn default_delimiter() -> String {
    "/".to_string()
}

fn default_max_keys() -> u32 {
    1000
}

/// One normalized listing page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    /// Objects on this page.
    pub files: Vec<ObjectEntry>,
    /// Common prefixes on this page.
    pub folders: Vec<FolderEntry>,
    /// Cursor for the next page; `None` on the last page.
    pub next_continuation_token: Option<String>,
    /// Always equal to `next_continuation_token.is_some()`.
    pub is_truncated: bool,
}

impl ListResult {
    /// Build a page, deriving `is_truncated` from the token.
    ///
    /// Empty tokens are treated as absent, so backends that always echo a
    /// marker (or send `""` on the last page) still satisfy the invariant.
    pub fn from_parts(
        files: Vec<ObjectEntry>,
        folders: Vec<FolderEntry>,
        next_token: Option<String>,
    ) -> Self {
        let next_continuation_token = next_token.filter(|t| !t.is_empty());
        Self {
            files,
            folders,
            is_truncated: next_continuation_token.is_some(),
            next_continuation_token,
        }
    }
}

/// Normalized object metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Object key.
    #[serde(rename = "Key")]
    pub key: String,
    /// Size in bytes.
    #[serde(rename = "Size")]
    pub size: u64,
    /// Last modified timestamp.
    #[serde(rename = "LastModified")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Content fingerprint.
    #[serde(rename = "ETag")]
    pub etag: Option<String>,
    /// MIME type.
    #[serde(rename = "ContentType")]
    pub content_type: Option<String>,
    /// Backend tier label.
    #[serde(rename = "StorageClass")]
    pub storage_class: String,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Key the object was stored under.
    pub key: String,
    /// Bucket, container, or repository.
    pub bucket: String,
    /// Address of the object when it is publicly addressable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A key that a batch delete could not remove.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFailure {
    /// The key.
    pub key: String,
    /// Human-readable reason.
    pub error: String,
}

impl DeleteFailure {
    /// Record `key` as failed with `err`'s user message.
    pub fn new(key: impl Into<String>, err: &AppError) -> Self {
        Self {
            key: key.into(),
            error: err.user_message(),
        }
    }
}

/// Aggregated result of a batch delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOutcome {
    /// Keys confirmed deleted.
    pub deleted: Vec<String>,
    /// Keys that could not be deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<DeleteFailure>,
}

impl DeleteOutcome {
    /// Whether every requested key was deleted.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Fold another chunk's outcome into this one.
    pub fn merge(&mut self, other: DeleteOutcome) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

/// Search request options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Restrict the walk to keys under this prefix.
    #[serde(default)]
    pub prefix: String,
    /// Page size used while walking the listing.
    #[serde(default = "default_max_keys")]
    pub page_size: u32,
    /// Stop after this many matches.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            page_size: default_max_keys(),
            limit: None,
        }
    }
}

/// Search result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matching objects in listing order.
    pub files: Vec<ObjectEntry>,
    /// Number of matches.
    pub total: usize,
}

/// Inline preview of an object's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewContent {
    /// Decoded text, or a placeholder for binary content. Absent when too large.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Object size in bytes.
    pub size: u64,
    /// Whether the object exceeded the preview cap.
    pub too_large: bool,
    /// Whether `content` is a placeholder for non-text data.
    #[serde(default)]
    pub binary: bool,
    /// MIME type used to make the text/binary decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Outcome of a connection test. Never an error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the backend is reachable with these credentials.
    pub success: bool,
    /// Success message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// User-facing failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionStatus {
    /// Successful test.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    /// Failed test, described with the error's user message.
    pub fn failed(err: &AppError) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(err.user_message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_result_truncation_follows_token() {
        let page = ListResult::from_parts(vec![], vec![], Some(String::new()));
        assert!(!page.is_truncated);
        assert!(page.next_continuation_token.is_none());

        let page = ListResult::from_parts(vec![], vec![], Some("m".into()));
        assert!(page.is_truncated);
    }

    #[test]
    fn test_object_entry_builders() {
        let entry = ObjectEntry::new("a/b.txt", 3)
            .etag(Some("\"abc\""))
            .storage_class(Some(""));
        assert_eq!(entry.etag.as_deref(), Some("abc"));
        assert_eq!(entry.storage_class, DEFAULT_STORAGE_CLASS);
    }

    #[test]
    fn test_file_info_wire_names() {
        let info = FileInfo {
            key: "k".into(),
            size: 1,
            last_modified: None,
            etag: Some("e".into()),
            content_type: None,
            storage_class: DEFAULT_STORAGE_CLASS.into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["ETag"], "e");
        assert_eq!(json["StorageClass"], "STANDARD");
    }

    #[test]
    fn test_folder_entry_appends_slash() {
        assert_eq!(FolderEntry::new("photos").key, "photos/");
        assert_eq!(FolderEntry::new("photos/").key, "photos/");
    }
}
