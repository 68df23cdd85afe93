//! Shared helpers for storage integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;

use cloudshelf_core::types::{ProgressCallback, TransferProgress};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().expect("Mock server has no address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Mock server failed");
    });
    format!("http://{addr}")
}

/// Write `content` to `name` inside `dir` and return the path.
pub async fn fixture(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.expect("Failed to create fixture dir");
    }
    tokio::fs::write(&path, content).await.expect("Failed to write fixture");
    path
}

/// Progress callback that records every report.
pub fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let callback: ProgressCallback = Arc::new(move |p: TransferProgress| {
        sink.lock().expect("poisoned").push(p);
    });
    (callback, reports)
}

/// Percent-decode a request path.
pub fn decode(path: &str) -> String {
    percent_encoding::percent_decode_str(path)
        .decode_utf8_lossy()
        .into_owned()
}
