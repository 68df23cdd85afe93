//! Streaming between local files and HTTP bodies, with progress.

use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Body, Response};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;

use crate::classify;
use crate::progress::ProgressReporter;
use crate::signing::Sha1Stream;

/// Size of a local file, failing with `NotFound` when it does not exist.
pub async fn local_file_size(path: &Path) -> AppResult<u64> {
    let metadata = fs::metadata(path).await.map_err(|e| open_error(path, e))?;
    if !metadata.is_file() {
        return Err(AppError::validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(metadata.len())
}

/// Stream `len` bytes of `path` starting at `offset`, advancing `reporter`
/// as chunks are consumed.
pub async fn file_range_stream(
    path: &Path,
    offset: u64,
    len: u64,
    reporter: ProgressReporter,
) -> AppResult<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static> {
    let mut file = File::open(path).await.map_err(|e| open_error(path, e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Storage, "Failed to seek in file", e))?;
    }
    Ok(ReaderStream::new(file.take(len)).inspect_ok(move |chunk| {
        reporter.advance(chunk.len() as u64);
    }))
}

/// Request body streaming the whole file.
pub async fn file_body(path: &Path, reporter: ProgressReporter) -> AppResult<(Body, u64)> {
    let size = local_file_size(path).await?;
    let stream = file_range_stream(path, 0, size, reporter).await?;
    Ok((Body::wrap_stream(stream), size))
}

/// Request body streaming one part of a file.
pub async fn file_part_body(
    path: &Path,
    offset: u64,
    len: u64,
    reporter: ProgressReporter,
) -> AppResult<Body> {
    let stream = file_range_stream(path, offset, len, reporter).await?;
    Ok(Body::wrap_stream(stream))
}

/// Hex SHA-1 of a file range, computed by streaming it.
pub async fn sha1_of_range(path: &Path, offset: u64, len: u64) -> AppResult<String> {
    let mut stream = file_range_stream(path, offset, len, ProgressReporter::disabled()).await?;
    let mut hasher = Sha1Stream::default();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| AppError::with_source(ErrorKind::Storage, "Failed to read file", e))?;
        hasher.update(&chunk);
    }
    Ok(hasher.finish_hex())
}

/// Byte ranges `(offset, len)` covering `size` in parts of `part_size`.
pub fn part_ranges(size: u64, part_size: u64) -> Vec<(u64, u64)> {
    let part_size = part_size.max(1);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = part_size.min(size - offset);
        ranges.push((offset, len));
        offset += len;
    }
    if ranges.is_empty() {
        ranges.push((0, 0));
    }
    ranges
}

/// Local file sink for downloads. The destination's parent directories are
/// created; a failed download leaves the partial file in place.
pub struct FileSink {
    file: File,
    path: std::path::PathBuf,
    written: u64,
    reporter: ProgressReporter,
}

impl FileSink {
    /// Create (truncate) the destination file.
    pub async fn create(path: &Path, reporter: ProgressReporter) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                AppError::with_source(
                    ErrorKind::Storage,
                    format!("Failed to create directory {}", parent.display()),
                    e,
                )
            })?;
        }
        let file = File::create(path).await.map_err(|e| {
            AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to create {}", path.display()),
                e,
            )
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            written: 0,
            reporter,
        })
    }

    /// Append a chunk.
    pub async fn write(&mut self, chunk: &[u8]) -> AppResult<()> {
        self.file.write_all(chunk).await.map_err(|e| {
            AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to write {}", self.path.display()),
                e,
            )
        })?;
        self.written += chunk.len() as u64;
        self.reporter.advance(chunk.len() as u64);
        Ok(())
    }

    /// Flush, emit the final progress report, and return the byte count.
    pub async fn finish(mut self) -> AppResult<u64> {
        self.file.flush().await.map_err(|e| {
            AppError::with_source(
                ErrorKind::Storage,
                format!("Failed to flush {}", self.path.display()),
                e,
            )
        })?;
        self.reporter.finish();
        debug!(path = %self.path.display(), bytes = self.written, "Download written");
        Ok(self.written)
    }
}

/// Stream a successful response body into `path`.
pub async fn write_response(
    response: Response,
    path: &Path,
    reporter: ProgressReporter,
) -> AppResult<u64> {
    let response = classify::ensure_success(response).await?;
    if let Some(total) = response.content_length() {
        reporter.set_total(total);
    }
    let mut sink = FileSink::create(path, reporter).await?;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify::transport)?;
        sink.write(&chunk).await?;
    }
    sink.finish().await
}

/// Collect at most `cap` bytes of a successful response body.
pub async fn read_capped(response: Response, cap: u64) -> AppResult<Vec<u8>> {
    let response = classify::ensure_success(response).await?;
    let mut buffer = Vec::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(classify::transport)?;
        if (buffer.len() + chunk.len()) as u64 > cap {
            return Err(AppError::payload_too_large(format!(
                "Object body exceeds the preview limit of {cap} bytes"
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn open_error(path: &Path, err: std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::not_found(format!("Local file not found: {}", path.display()))
    } else {
        AppError::with_source(
            ErrorKind::Storage,
            format!("Failed to open {}", path.display()),
            err,
        )
    }
}
