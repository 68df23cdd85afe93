//! Upload and download commands.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use tracing::debug;

use cloudshelf_core::AppError;
use cloudshelf_core::error::ErrorKind;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ProgressCallback;

use super::Context;
use crate::output::{self, OutputFormat};

/// Arguments for the upload command
#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Path to the file to upload
    pub file: PathBuf,
    /// Destination key; defaults to the file name
    pub key: Option<String>,
    /// Do not draw a progress line
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for the download command
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Object key
    pub key: String,
    /// Destination path; defaults to the last segment of the key
    pub dest: Option<PathBuf>,
    /// Do not draw a progress line
    #[arg(short, long)]
    pub quiet: bool,
}

/// Upload a local file.
pub async fn upload(args: &UploadArgs, ctx: &Context) -> AppResult<()> {
    let key = match &args.key {
        Some(key) => key.clone(),
        None => args
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::validation(format!(
                    "Cannot derive a key from '{}'; pass one explicitly",
                    args.file.display()
                ))
            })?,
    };

    let (_, provider) = ctx.provider().await?;
    let progress = (!args.quiet && ctx.format == OutputFormat::Table)
        .then(|| output::progress_line(format!("Uploading {key}")));
    let outcome = provider.upload_file(&args.file, &key, progress).await?;

    match ctx.format {
        OutputFormat::Json => output::print_json(&outcome),
        OutputFormat::Table => {
            output::print_success(&format!("Uploaded '{}' to {}", outcome.key, outcome.bucket));
            if let Some(url) = &outcome.url {
                output::print_kv("URL", url);
            }
        }
    }
    Ok(())
}

/// JSON payload of a finished download.
#[derive(Debug, Serialize)]
struct DownloadReport<'a> {
    key: &'a str,
    path: String,
    size: u64,
}

/// Download an object.
pub async fn download(args: &DownloadArgs, ctx: &Context) -> AppResult<()> {
    let dest = match &args.dest {
        Some(dest) => dest.clone(),
        None => default_destination(&args.key)?,
    };

    let (_, provider) = ctx.provider().await?;
    let progress = (!args.quiet && ctx.format == OutputFormat::Table)
        .then(|| output::progress_line(format!("Downloading {}", args.key)));
    let size = download_to(provider.as_ref(), &args.key, &dest, progress).await?;

    match ctx.format {
        OutputFormat::Json => output::print_json(&DownloadReport {
            key: &args.key,
            path: dest.display().to_string(),
            size,
        }),
        OutputFormat::Table => output::print_success(&format!(
            "Downloaded '{}' ({}) to {}",
            args.key,
            output::format_bytes(size),
            dest.display()
        )),
    }
    Ok(())
}

/// Download `key` into a staging file next to `dest` and rename it into
/// place once the body is complete. `dest` is left untouched on failure.
async fn download_to(
    provider: &dyn StorageProvider,
    key: &str,
    dest: &Path,
    progress: Option<ProgressCallback>,
) -> AppResult<u64> {
    let staging = staging_path(dest)?;
    if let Err(e) = provider.download_file(key, &staging, progress).await {
        if tokio::fs::remove_file(&staging).await.is_ok() {
            debug!(path = %staging.display(), "Removed partial download");
        }
        return Err(e);
    }

    let local_error = |action: &str, e: std::io::Error| {
        AppError::with_source(
            ErrorKind::Storage,
            format!("Failed to {action} {}", dest.display()),
            e,
        )
    };
    tokio::fs::rename(&staging, dest)
        .await
        .map_err(|e| local_error("move download to", e))?;
    let metadata = tokio::fs::metadata(dest)
        .await
        .map_err(|e| local_error("stat", e))?;
    Ok(metadata.len())
}

fn staging_path(dest: &Path) -> AppResult<PathBuf> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            AppError::validation(format!("'{}' is not a file path", dest.display()))
        })?;
    Ok(dest.with_file_name(format!(".{name}.part")))
}

fn default_destination(key: &str) -> AppResult<PathBuf> {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(|name| Path::new(name).to_path_buf())
        .ok_or_else(|| {
            AppError::validation(format!("Cannot derive a file name from '{key}'; pass a destination"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudshelf_core::config::provider::{BackendConfig, LocalConfig, ProviderConfig};
    use cloudshelf_core::config::transfer::TransferConfig;
    use cloudshelf_storage::providers::LocalStorageProvider;

    #[test]
    fn test_default_destination() {
        assert_eq!(default_destination("photos/2024/a.png").unwrap(), PathBuf::from("a.png"));
        assert_eq!(default_destination("notes.txt").unwrap(), PathBuf::from("notes.txt"));
        assert!(default_destination("photos/..").is_err());
        assert!(default_destination("").is_err());
    }

    #[test]
    fn test_staging_path_is_a_hidden_sibling() {
        assert_eq!(
            staging_path(Path::new("out/a.png")).unwrap(),
            PathBuf::from("out/.a.png.part")
        );
        assert!(staging_path(Path::new("..")).is_err());
    }

    async fn local_provider(root: &Path) -> LocalStorageProvider {
        let profile = ProviderConfig::new(BackendConfig::Local(LocalConfig {
            root_path: root.display().to_string(),
        }));
        LocalStorageProvider::new(profile, TransferConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_download_keeps_existing_destination() {
        let bucket = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        let provider = local_provider(bucket.path()).await;
        let dest = local.path().join("important.txt");
        tokio::fs::write(&dest, b"keep me").await.unwrap();

        let err = download_to(&provider, "missing.txt", &dest, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"keep me");
        assert!(!staging_path(&dest).unwrap().exists());
    }

    #[tokio::test]
    async fn test_download_replaces_destination() {
        let bucket = tempfile::tempdir().unwrap();
        let local = tempfile::tempdir().unwrap();
        tokio::fs::write(bucket.path().join("notes.txt"), b"fresh copy")
            .await
            .unwrap();
        let provider = local_provider(bucket.path()).await;
        let dest = local.path().join("nested/notes.txt");

        let size = download_to(&provider, "notes.txt", &dest, None).await.unwrap();
        assert_eq!(size, 10);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"fresh copy");
        assert!(!staging_path(&dest).unwrap().exists());
    }

    #[test]
    fn test_download_report_fields() {
        let report = DownloadReport {
            key: "a/b.txt",
            path: "b.txt".into(),
            size: 3,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["key"], "a/b.txt");
        assert_eq!(value["path"], "b.txt");
        assert_eq!(value["size"], 3);
    }
}
