//! Qiniu provider against an in-process mock of the rs/rsf management API.

mod helpers;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde_json::{Value, json};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, QiniuConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ListOptions;
use cloudshelf_storage::factory;

#[derive(Default)]
struct Kodo {
    keys: BTreeSet<String>,
    /// Number of operations in each `/batch` call.
    batches: Vec<usize>,
}

type Shared = Arc<Mutex<Kodo>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("QBox ak:"))
}

fn key_of_entry(entry: &str) -> String {
    let decoded = URL_SAFE.decode(entry).expect("entry is base64url");
    let text = String::from_utf8(decoded).expect("entry is utf-8");
    text.strip_prefix("photos:").expect("entry names the bucket").to_string()
}

async fn batch(State(kodo): State<Shared>, headers: HeaderMap, body: String) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad token" }))).into_response();
    }
    let mut kodo = kodo.lock().unwrap();
    let ops: Vec<&str> = body.split('&').collect();
    kodo.batches.push(ops.len());

    let mut failures = 0;
    let results: Vec<Value> = ops
        .iter()
        .map(|op| {
            let entry = op
                .strip_prefix("op=/delete/")
                .expect("only deletes are batched");
            let key = key_of_entry(entry);
            if key.starts_with("locked") {
                failures += 1;
                json!({ "code": 403, "data": { "error": "permission denied" } })
            } else if kodo.keys.remove(&key) {
                json!({ "code": 200 })
            } else {
                json!({ "code": 612, "data": { "error": "no such file or directory" } })
            }
        })
        .collect();
    let status = if failures == 0 {
        StatusCode::OK
    } else {
        StatusCode::from_u16(298).unwrap()
    };
    (status, Json(Value::Array(results))).into_response()
}

async fn list(State(kodo): State<Shared>, Query(query): Query<BTreeMap<String, String>>) -> Json<Value> {
    let kodo = kodo.lock().unwrap();
    let limit: usize = query["limit"].parse().unwrap();
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let marker = query.get("marker").cloned().unwrap_or_default();
    let matching: Vec<&String> = kodo
        .keys
        .iter()
        .filter(|k| k.starts_with(&prefix) && k.as_str() > marker.as_str())
        .collect();
    let page: Vec<Value> = matching
        .iter()
        .take(limit)
        .map(|k| json!({ "key": k, "fsize": 1, "hash": "h", "putTime": 17_000_000_000_000_000i64, "type": 1 }))
        .collect();
    let marker = if matching.len() > limit {
        matching[limit - 1].clone()
    } else {
        String::new()
    };
    Json(json!({ "marker": marker, "items": page }))
}

async fn stat(State(kodo): State<Shared>, Path(entry): Path<String>) -> Response {
    let key = key_of_entry(&entry);
    if kodo.lock().unwrap().keys.contains(&key) {
        Json(json!({ "fsize": 1, "hash": "h", "mimeType": "text/plain", "putTime": 17_000_000_000_000_000i64 }))
            .into_response()
    } else {
        (
            StatusCode::from_u16(612).unwrap(),
            Json(json!({ "error": "no such file or directory" })),
        )
            .into_response()
    }
}

async fn delete(State(kodo): State<Shared>, Path(entry): Path<String>) -> Response {
    if kodo.lock().unwrap().keys.remove(&key_of_entry(&entry)) {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::from_u16(612).unwrap(),
            Json(json!({ "error": "no such file or directory" })),
        )
            .into_response()
    }
}

async fn provider() -> (Arc<dyn StorageProvider>, Shared) {
    let state: Shared = Arc::default();
    let router = Router::new()
        .route("/batch", post(batch))
        .route("/list", get(list))
        .route("/stat/{entry}", get(stat))
        .route("/delete/{entry}", post(delete))
        .with_state(Arc::clone(&state));
    let base = helpers::serve(router).await;

    let mut profile = ProviderConfig::new(BackendConfig::Qiniu(QiniuConfig {
        access_key: "ak".into(),
        secret_key: "sk".into(),
        bucket: "photos".into(),
        region: "z0".into(),
        api_base: Some(base),
    }));
    profile.custom_domain = Some("img.example.com".into());
    let provider = factory::build(profile, TransferConfig::default())
        .await
        .expect("Failed to build qiniu provider");
    (provider, state)
}

#[tokio::test]
async fn test_batch_delete_in_chunks_of_1000() {
    let (qiniu, state) = provider().await;
    let keys: Vec<String> = (0..2500)
        .map(|i| match i {
            1234 => "locked/file.txt".to_string(),
            _ => format!("obj/{i:04}.txt"),
        })
        .collect();
    {
        let mut state = state.lock().unwrap();
        // Every other key exists; missing keys count as deleted.
        state.keys.extend(keys.iter().step_by(2).cloned());
    }

    let outcome = qiniu.delete_files(&keys).await.unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.batches, vec![1000, 1000, 500]);
    assert_eq!(outcome.deleted.len(), 2499);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].key, "locked/file.txt");
    assert_eq!(
        state.keys.iter().collect::<Vec<_>>(),
        vec!["locked/file.txt"]
    );
}

#[tokio::test]
async fn test_marker_paging_and_stat() {
    let (qiniu, state) = provider().await;
    {
        let mut state = state.lock().unwrap();
        for i in 0..5 {
            state.keys.insert(format!("a/{i}.png"));
        }
    }

    let mut options = ListOptions::recursive("a/");
    options.max_keys = 2;
    let mut seen = Vec::new();
    loop {
        let page = qiniu.list_files(&options).await.unwrap();
        seen.extend(page.files.iter().map(|f| f.key.clone()));
        match page.next_continuation_token {
            Some(token) => options = options.resume(Some(token)),
            None => break,
        }
    }
    assert_eq!(seen, vec!["a/0.png", "a/1.png", "a/2.png", "a/3.png", "a/4.png"]);

    assert!(qiniu.file_exists("a/0.png").await.unwrap());
    assert!(!qiniu.file_exists("a/9.png").await.unwrap());
    qiniu.delete_file("a/9.png").await.unwrap();
    qiniu.delete_file("a/0.png").await.unwrap();
    assert!(!qiniu.file_exists("a/0.png").await.unwrap());

    assert_eq!(
        qiniu.get_public_url("a/0.png").await.unwrap(),
        "https://img.example.com/a/0.png"
    );
}
