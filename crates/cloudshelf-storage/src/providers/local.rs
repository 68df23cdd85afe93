//! Local filesystem storage provider.
//!
//! Keys map to paths under the configured root. Listing walks the directory
//! tree below the prefix's directory, then emulates the delimiter and pages
//! the result client-side. The default "public" address of an object is its
//! `file://` URL; local profiles cannot sign URLs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::{
    ConnectionStatus, DeleteOutcome, FileInfo, ListOptions, ListResult, ObjectEntry,
    PreviewContent, ProgressCallback, ProviderType, UploadOutcome,
};

use crate::batch;
use crate::pagination;
use crate::providers::{FacadeContext, clean_key};
use crate::transfer::{self, FileSink};
use crate::url::{UrlPlan, encode_key};

/// Local filesystem storage provider.
#[derive(Debug, Clone)]
pub struct LocalStorageProvider {
    ctx: FacadeContext,
    /// Root directory for all stored objects.
    root: PathBuf,
    label: String,
}

impl LocalStorageProvider {
    /// Create a provider rooted at the profile's `root_path`, creating the
    /// directory when missing.
    pub async fn new(profile: ProviderConfig, transfer: TransferConfig) -> AppResult<Self> {
        let BackendConfig::Local(config) = &profile.backend else {
            return Err(AppError::configuration("Expected a local profile"));
        };
        let root = PathBuf::from(&config.root_path);
        fs::create_dir_all(&root).await.map_err(|e| {
            AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to create storage root: {}", root.display()),
                e,
            )
        })?;
        info!(root = %root.display(), "Initialized local storage provider");
        let label = profile.backend.bucket_label();
        Ok(Self {
            ctx: FacadeContext::new(profile, transfer, true),
            root,
            label,
        })
    }

    /// Resolve a key to a path within the root.
    fn resolve(&self, key: &str) -> AppResult<PathBuf> {
        let clean = clean_key(key)?;
        if clean.split('/').any(|segment| segment == "..") {
            return Err(AppError::validation(format!(
                "Key '{key}' escapes the storage root"
            )));
        }
        Ok(self.root.join(clean))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Every file below `dir`, as entries keyed relative to the root.
    async fn walk(&self, dir: PathBuf) -> AppResult<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pending = vec![dir];

        while let Some(dir) = pending.pop() {
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(AppError::with_source(
                        ErrorKind::Storage,
                        format!("Failed to list directory: {}", dir.display()),
                        e,
                    ));
                }
            };

            while let Some(entry) = reader.next_entry().await.map_err(|e| {
                AppError::with_source(ErrorKind::Storage, "Failed to read directory entry", e)
            })? {
                let meta = entry.metadata().await.map_err(|e| {
                    AppError::with_source(ErrorKind::Storage, "Failed to get entry metadata", e)
                })?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_of(&path) {
                    entries.push(
                        ObjectEntry::new(key, meta.len())
                            .modified(meta.modified().ok().map(DateTime::<Utc>::from)),
                    );
                }
            }
        }

        Ok(entries)
    }

    fn file_url(&self, key: &str) -> AppResult<String> {
        let path = self.resolve(key)?;
        let absolute = std::path::absolute(&path).unwrap_or(path);
        let text = absolute.to_string_lossy().replace('\\', "/");
        let text = if text.starts_with('/') {
            text
        } else {
            format!("/{text}")
        };
        Ok(format!("file://{}", encode_key(&text)))
    }

    async fn copy_with_progress(
        &self,
        from: &Path,
        to: &Path,
        progress: Option<ProgressCallback>,
    ) -> AppResult<u64> {
        let size = transfer::local_file_size(from).await?;
        let reporter = self.ctx.reporter(progress, size);
        let mut source =
            transfer::file_range_stream(from, 0, size, crate::progress::ProgressReporter::disabled())
                .await?;
        let mut sink = FileSink::create(to, reporter).await?;
        while let Some(chunk) = source.next().await {
            let chunk = chunk
                .map_err(|e| AppError::with_source(ErrorKind::Storage, "Failed to read file", e))?;
            sink.write(&chunk).await?;
        }
        sink.finish().await
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }

    fn bucket(&self) -> &str {
        &self.label
    }

    async fn test_connection(&self) -> ConnectionStatus {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {
                ConnectionStatus::ok(format!("Directory {} is accessible", self.root.display()))
            }
            Ok(_) => ConnectionStatus::failed(&AppError::not_found(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => ConnectionStatus::failed(&AppError::from(e)),
        }
    }

    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        progress: Option<ProgressCallback>,
    ) -> AppResult<UploadOutcome> {
        let target = self.resolve(key)?;
        let bytes = self.copy_with_progress(local_path, &target, progress).await?;
        debug!(key, bytes, "Uploaded file");

        let url = if self.ctx.urls.is_public() {
            self.get_public_url(key).await.ok()
        } else {
            None
        };
        Ok(UploadOutcome {
            key: clean_key(key)?.to_string(),
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
        let source = self.resolve(key)?;
        let bytes = self
            .copy_with_progress(&source, local_path, progress)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    AppError::not_found(format!("Object not found: {key}"))
                } else {
                    e
                }
            })?;
        debug!(key, bytes, "Downloaded file");
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> AppResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to delete file: {key}"),
                e,
            )),
        }
    }

    async fn delete_files(&self, keys: &[String]) -> AppResult<DeleteOutcome> {
        Ok(batch::delete_each(keys, |key| async move { self.delete_file(&key).await }).await)
    }

    async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
        let start = self.root.join(pagination::directory_of(&options.prefix));
        let entries = self.walk(start).await?;
        let (files, folders) =
            pagination::partition_by_delimiter(entries, &options.prefix, &options.delimiter);
        Ok(pagination::paginate(files, folders, options))
    }

    async fn get_public_url(&self, key: &str) -> AppResult<String> {
        match self.ctx.urls.plan(key) {
            UrlPlan::Custom(url) => Ok(url),
            UrlPlan::Default => self.file_url(key),
            UrlPlan::Signed(_) => Err(AppError::not_supported(
                "Local profiles cannot sign URLs; configure custom_domain or clear private",
            )),
        }
    }

    async fn get_presigned_url(&self, key: &str, _expires_in: Option<Duration>) -> AppResult<String> {
        self.get_public_url(key).await
    }

    async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::not_found(format!("Object not found: {key}"))
            } else {
                AppError::with_source(
                    ErrorKind::Storage,
                    format!("Failed to get metadata: {key}"),
                    e,
                )
            }
        })?;
        if !meta.is_file() {
            return Err(AppError::not_found(format!("{key} is a directory")));
        }
        let last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(FileInfo {
            key: clean_key(key)?.to_string(),
            size: meta.len(),
            last_modified,
            etag: last_modified.map(|t| format!("{:x}-{:x}", t.timestamp_millis(), meta.len())),
            content_type: mime_guess::from_path(&path).first().map(|m| m.to_string()),
            storage_class: cloudshelf_core::types::object::DEFAULT_STORAGE_CLASS.to_string(),
        })
    }

    async fn get_file_content(&self, key: &str, max_size: Option<u64>) -> AppResult<PreviewContent> {
        let info = self.get_file_info(key).await?;
        let path = self.resolve(key)?;
        self.ctx
            .preview
            .preview(info, max_size, |cap| async move {
                let file = fs::File::open(&path).await?;
                let mut buffer = Vec::new();
                file.take(cap).read_to_end(&mut buffer).await?;
                Ok(buffer)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use cloudshelf_core::config::provider::LocalConfig;

    use super::*;

    async fn provider(root: &Path) -> LocalStorageProvider {
        let profile = ProviderConfig::new(BackendConfig::Local(LocalConfig {
            root_path: root.to_string_lossy().into_owned(),
        }));
        LocalStorageProvider::new(profile, TransferConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = provider(&dir.path().join("store")).await;
        let source = dir.path().join("hello.txt");
        fs::write(&source, b"hello world").await.unwrap();

        let outcome = store.upload_file(&source, "docs/hello.txt", None).await.unwrap();
        assert_eq!(outcome.key, "docs/hello.txt");
        assert!(outcome.url.unwrap().starts_with("file://"));

        let target = dir.path().join("out/hello.txt");
        store.download_file("docs/hello.txt", &target, None).await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"hello world");

        let info = store.get_file_info("docs/hello.txt").await.unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));

        store.delete_file("docs/hello.txt").await.unwrap();
        store.delete_file("docs/hello.txt").await.unwrap();
        assert!(!store.file_exists("docs/hello.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_with_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = provider(dir.path()).await;
        for key in ["a.txt", "img/1.png", "img/sub/2.png", "z.txt"] {
            let path = dir.path().join(key);
            fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            fs::write(&path, b"x").await.unwrap();
        }

        let page = store.list_files(&ListOptions::default()).await.unwrap();
        let files: Vec<_> = page.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(files, ["a.txt", "z.txt"]);
        assert_eq!(page.folders.len(), 1);
        assert_eq!(page.folders[0].key, "img/");

        let page = store.list_files(&ListOptions::under("img/")).await.unwrap();
        assert_eq!(page.files[0].key, "img/1.png");
        assert_eq!(page.folders[0].key, "img/sub/");

        let page = store.list_files(&ListOptions::recursive("")).await.unwrap();
        assert_eq!(page.files.len(), 4);
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = provider(dir.path()).await;
        let err = store.get_file_info("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_private_profile_cannot_produce_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = ProviderConfig::new(BackendConfig::Local(LocalConfig {
            root_path: dir.path().to_string_lossy().into_owned(),
        }));
        profile.private = true;
        let store = LocalStorageProvider::new(profile, TransferConfig::default())
            .await
            .unwrap();
        let err = store.get_presigned_url("a.txt", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }
}
