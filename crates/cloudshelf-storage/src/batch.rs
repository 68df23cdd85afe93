//! Batch delete chunking and aggregation.
//!
//! A chunk (or single key) that fails never aborts the rest of the batch.
//! Every requested key ends up in exactly one of `deleted` or `failed`.

use std::future::Future;

use tracing::{debug, warn};

use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::{DeleteFailure, DeleteOutcome};

/// Batch limit shared by S3, OSS, COS, Qiniu and Dropbox.
pub const DEFAULT_BATCH_LIMIT: usize = 1000;

/// Run `op` once per chunk of at most `limit` keys, sequentially.
///
/// `op` returns the outcome for its chunk (it may itself report per-key
/// failures). When `op` fails outright, every key of that chunk is recorded
/// as failed with the chunk's error and the next chunk still runs.
pub async fn delete_in_chunks<F, Fut>(keys: &[String], limit: usize, mut op: F) -> DeleteOutcome
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = AppResult<DeleteOutcome>>,
{
    let limit = limit.max(1);
    let mut outcome = DeleteOutcome::default();

    for (index, chunk) in keys.chunks(limit).enumerate() {
        debug!(chunk = index, size = chunk.len(), "Deleting chunk");
        match op(chunk.to_vec()).await {
            Ok(result) => outcome.merge(result),
            Err(e) => {
                warn!(chunk = index, size = chunk.len(), error = %e, "Delete chunk failed");
                outcome
                    .failed
                    .extend(chunk.iter().map(|key| DeleteFailure::new(key.clone(), &e)));
            }
        }
    }

    log_partial(keys.len(), &outcome);
    outcome
}

/// Delete keys one by one for backends without a batch endpoint.
pub async fn delete_each<F, Fut>(keys: &[String], mut op: F) -> DeleteOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut outcome = DeleteOutcome::default();
    for key in keys {
        match op(key.clone()).await {
            Ok(()) => outcome.deleted.push(key.clone()),
            Err(e) => {
                warn!(key = %key, error = %e, "Delete failed");
                outcome.failed.push(DeleteFailure::new(key.clone(), &e));
            }
        }
    }
    log_partial(keys.len(), &outcome);
    outcome
}

fn log_partial(requested: usize, outcome: &DeleteOutcome) {
    if !outcome.is_complete() {
        warn!(
            requested,
            deleted = outcome.deleted.len(),
            failed = outcome.failed.len(),
            "Batch delete partially failed"
        );
    }
}
