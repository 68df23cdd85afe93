//! Upyun provider deletes against an in-process mock of the REST API.

mod helpers;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::delete;

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, UpyunConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::error::ErrorKind;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_storage::factory;

type Shared = Arc<Mutex<BTreeSet<String>>>;

async fn remove(State(keys): State<Shared>, Path(key): Path<String>, headers: HeaderMap) -> StatusCode {
    let signed = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("UPYUN op:"));
    if !signed || key.starts_with("locked/") {
        return StatusCode::FORBIDDEN;
    }
    if keys.lock().unwrap().remove(&key) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn provider() -> (Arc<dyn StorageProvider>, Shared) {
    let state: Shared = Arc::default();
    let router = Router::new()
        .route("/pics/{*key}", delete(remove))
        .with_state(Arc::clone(&state));
    let base = helpers::serve(router).await;

    let profile = ProviderConfig::new(BackendConfig::Upyun(UpyunConfig {
        operator: "op".into(),
        password: "secret".into(),
        bucket: "pics".into(),
        api_base: Some(base),
    }));
    let provider = factory::build(profile, TransferConfig::default())
        .await
        .expect("Failed to build upyun provider");
    (provider, state)
}

#[tokio::test]
async fn test_delete_missing_key_succeeds() {
    let (upyun, state) = provider().await;
    state.lock().unwrap().insert("a/1.png".into());

    upyun.delete_file("a/1.png").await.unwrap();
    upyun.delete_file("a/1.png").await.unwrap();
    assert!(state.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_reports_only_real_failures() {
    let (upyun, state) = provider().await;
    state.lock().unwrap().insert("a/1.png".into());

    let keys = ["a/1.png", "a/gone.png", "locked/2.png"].map(String::from);
    let outcome = upyun.delete_files(&keys).await.unwrap();
    assert_eq!(outcome.deleted, ["a/1.png", "a/gone.png"]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].key, "locked/2.png");

    let err = upyun.delete_file("locked/2.png").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);
}
