//! S3-dialect request helpers shared by the OSS and COS Facades: multipart
//! upload, `ListBucketResult` parsing, and batch delete bodies.
//!
//! Multipart uploads initiate with `POST ?uploads`, send each part with
//! `PUT ?partNumber=N&uploadId=ID`, then `POST ?uploadId=ID` with the part
//! ETags. A failed part aborts the upload so no orphaned parts are billed.

use std::path::Path;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Method, RequestBuilder};
use tracing::{debug, warn};

use chrono::{DateTime, Utc};

use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::{DeleteFailure, DeleteOutcome, FolderEntry, ObjectEntry};

use crate::classify;
use crate::progress::ProgressReporter;
use crate::transfer;
use crate::url::encode_query;
use crate::xml::{self, Element};

/// A backend that can sign S3-dialect object requests.
pub trait S3Dialect: Send + Sync {
    /// Signed request for `key` with the given query parameters and extra
    /// headers. Parameters with an empty value are sent as bare flags.
    fn signed(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
    ) -> AppResult<RequestBuilder>;
}

/// Query string for an S3-dialect request; empty values become bare flags
/// (`?uploads`, `?delete`).
pub fn request_query(query: &[(&str, &str)]) -> String {
    query
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                encode_query(k)
            } else {
                format!("{}={}", encode_query(k), encode_query(v))
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// One uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub number: u32,
    /// ETag returned for the part.
    pub etag: String,
}

/// Upload `path` to `key` in parts of `part_size` bytes.
pub async fn upload<T: S3Dialect + ?Sized>(
    target: &T,
    key: &str,
    path: &Path,
    size: u64,
    part_size: u64,
    content_type: &str,
    reporter: ProgressReporter,
) -> AppResult<()> {
    let response = target
        .signed(
            Method::POST,
            key,
            &[("uploads", "")],
            &[("content-type", content_type.to_string())],
        )?
        .send()
        .await
        .map_err(classify::transport)?;
    let upload_id = parse_upload_id(&classify::read_text(response).await?)?;
    debug!(key, upload_id = %upload_id, size, "Initiated multipart upload");

    match upload_parts(target, key, &upload_id, path, size, part_size, reporter).await {
        Ok(parts) => complete(target, key, &upload_id, &parts).await,
        Err(e) => {
            abort(target, key, &upload_id).await;
            Err(e)
        }
    }
}

async fn upload_parts<T: S3Dialect + ?Sized>(
    target: &T,
    key: &str,
    upload_id: &str,
    path: &Path,
    size: u64,
    part_size: u64,
    reporter: ProgressReporter,
) -> AppResult<Vec<CompletedPart>> {
    let mut parts = Vec::new();
    for (index, (offset, len)) in transfer::part_ranges(size, part_size).into_iter().enumerate() {
        let number = index as u32 + 1;
        let number_text = number.to_string();
        let body = transfer::file_part_body(path, offset, len, reporter.clone()).await?;
        let response = target
            .signed(
                Method::PUT,
                key,
                &[("partNumber", number_text.as_str()), ("uploadId", upload_id)],
                &[],
            )?
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(classify::transport)?;
        let response = classify::ensure_success(response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| AppError::malformed(format!("Part {number} response has no ETag")))?;
        parts.push(CompletedPart { number, etag });
    }
    reporter.finish();
    Ok(parts)
}

async fn complete<T: S3Dialect + ?Sized>(
    target: &T,
    key: &str,
    upload_id: &str,
    parts: &[CompletedPart],
) -> AppResult<()> {
    let body = complete_body(parts);
    let response = target
        .signed(
            Method::POST,
            key,
            &[("uploadId", upload_id)],
            &[("content-type", "application/xml".to_string())],
        )?
        .header(CONTENT_TYPE, "application/xml")
        .body(body)
        .send()
        .await
        .map_err(classify::transport)?;
    let body = classify::read_text(response).await?;
    // A 200 can still carry an <Error> document.
    if body.contains("<Error>") {
        return Err(classify::http_status(500, &body));
    }
    debug!(key, parts = parts.len(), "Completed multipart upload");
    Ok(())
}

async fn abort<T: S3Dialect + ?Sized>(target: &T, key: &str, upload_id: &str) {
    let result = match target.signed(Method::DELETE, key, &[("uploadId", upload_id)], &[]) {
        Ok(request) => request.send().await.map_err(classify::transport),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(key, upload_id, error = %e, "Failed to abort multipart upload");
    }
}

/// Extract `UploadId` from an `InitiateMultipartUploadResult` document.
pub fn parse_upload_id(body: &str) -> AppResult<String> {
    let root = xml::parse_document(body, "InitiateMultipartUploadResult")?;
    root.child_text("UploadId")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::malformed("InitiateMultipartUploadResult has no UploadId"))
}

/// `CompleteMultipartUpload` request body.
pub fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.number,
            xml::escape(&part.etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Parse a `DeleteResult` (quiet=false) into deleted keys and `(key, message)` errors.
pub fn parse_delete_result(body: &str) -> AppResult<(Vec<String>, Vec<(String, String)>)> {
    let root: Element = xml::parse_document(body, "DeleteResult")?;
    let deleted = root
        .children_named("Deleted")
        .filter_map(|d| d.child_text("Key"))
        .map(str::to_string)
        .collect();
    let errors = root
        .children_named("Error")
        .filter_map(|e| {
            let key = e.child_text("Key")?.to_string();
            let message = match (e.child_text("Code"), e.child_text("Message")) {
                (Some(code), Some(msg)) => format!("{code}: {msg}"),
                (Some(code), None) => code.to_string(),
                (None, Some(msg)) => msg.to_string(),
                (None, None) => "delete failed".to_string(),
            };
            Some((key, message))
        })
        .collect();
    Ok((deleted, errors))
}

/// `Delete` request body for a batch of keys, non-quiet.
pub fn delete_body(keys: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Delete><Quiet>false</Quiet>");
    for key in keys {
        body.push_str(&format!("<Object><Key>{}</Key></Object>", xml::escape(key)));
    }
    body.push_str("</Delete>");
    body
}

/// Fold a `DeleteResult` into an outcome covering every requested key.
/// Keys the service neither confirmed nor rejected are reported as failed.
pub fn delete_outcome(requested: &[String], body: &str) -> AppResult<DeleteOutcome> {
    let (deleted, errors) = parse_delete_result(body)?;
    let mut outcome = DeleteOutcome {
        deleted,
        failed: errors
            .into_iter()
            .map(|(key, error)| DeleteFailure { key, error })
            .collect(),
    };
    for key in requested {
        let seen = outcome.deleted.contains(key) || outcome.failed.iter().any(|f| &f.key == key);
        if !seen {
            outcome.failed.push(DeleteFailure {
                key: key.clone(),
                error: "Deletion was not confirmed by the service".to_string(),
            });
        }
    }
    Ok(outcome)
}

/// One parsed `ListBucketResult` page (marker pagination).
#[derive(Debug, Clone, Default)]
pub struct BucketPage {
    /// Objects on the page.
    pub files: Vec<ObjectEntry>,
    /// Common prefixes on the page.
    pub folders: Vec<FolderEntry>,
    /// Marker for the next request, present only when truncated.
    pub next_marker: Option<String>,
}

/// Parse a marker-paginated `ListBucketResult`. When the service reports a
/// truncated page without `NextMarker`, the last key or prefix on the page
/// is the marker.
pub fn parse_bucket_listing(body: &str) -> AppResult<BucketPage> {
    let root = xml::parse_document(body, "ListBucketResult")?;

    let files: Vec<ObjectEntry> = root
        .children_named("Contents")
        .filter_map(|item| {
            let key = item.child_text("Key")?;
            let size = item
                .child_text("Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(
                ObjectEntry::new(key, size)
                    .modified(item.child_text("LastModified").and_then(parse_timestamp))
                    .etag(item.child_text("ETag"))
                    .storage_class(item.child_text("StorageClass")),
            )
        })
        .collect();
    let folders: Vec<FolderEntry> = root
        .children_named("CommonPrefixes")
        .filter_map(|p| p.child_text("Prefix"))
        .filter(|p| !p.is_empty())
        .map(FolderEntry::new)
        .collect();

    let truncated = root
        .child_text("IsTruncated")
        .is_some_and(|t| t.eq_ignore_ascii_case("true"));
    let next_marker = if truncated {
        root.child_text("NextMarker")
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let last_file = files.last().map(|f| f.key.as_str());
                let last_folder = folders.last().map(|f| f.key.as_str());
                last_file.max(last_folder).map(str::to_string)
            })
    } else {
        None
    };

    Ok(BucketPage {
        files,
        folders,
        next_marker,
    })
}

/// Parse an ISO 8601 / RFC 3339 timestamp.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
