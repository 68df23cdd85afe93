//! Backblaze B2 provider against an in-process mock of the native API.

mod helpers;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};

use cloudshelf_core::config::provider::{B2Config, BackendConfig, ProviderConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ListOptions;
use cloudshelf_storage::factory;
use cloudshelf_storage::signing;

#[derive(Default)]
struct Bucket {
    base: String,
    authorizations: AtomicUsize,
    /// file name → versions (file id, content), newest last.
    files: Mutex<BTreeMap<String, Vec<(String, Vec<u8>)>>>,
    /// large file id → (name, parts by number).
    large: Mutex<BTreeMap<String, (String, BTreeMap<u32, Vec<u8>>)>>,
    next_id: AtomicUsize,
}

type Shared = Arc<Bucket>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn error(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "status": status.as_u16(), "code": code, "message": code }))).into_response()
}

impl Bucket {
    fn new_id(&self) -> String {
        format!("4_z{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn store(&self, name: String, content: Vec<u8>) {
        let id = self.new_id();
        self.files
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .push((id, content));
    }

    fn file_json(name: &str, id: &str, content: &[u8]) -> Value {
        json!({
            "fileName": name,
            "fileId": id,
            "action": "upload",
            "contentLength": content.len(),
            "contentSha1": signing::sha1_hex(content),
            "contentType": "text/plain",
            "uploadTimestamp": 1_700_000_000_000i64,
        })
    }

    fn list_names(&self, body: &Value) -> Value {
        let prefix = body["prefix"].as_str().unwrap_or("");
        let delimiter = body["delimiter"].as_str().unwrap_or("");
        let start = body["startFileName"].as_str().unwrap_or("");
        let max = body["maxFileCount"].as_u64().unwrap_or(100) as usize;

        let files = self.files.lock().unwrap();
        let mut entries: Vec<(String, Value)> = Vec::new();
        let mut folders = BTreeSet::new();
        for (name, versions) in files.iter() {
            let Some(rest) = name.strip_prefix(prefix) else {
                continue;
            };
            let (id, content) = versions.last().unwrap();
            match (!delimiter.is_empty()).then(|| rest.find(delimiter)).flatten() {
                Some(pos) => {
                    let folder = format!("{prefix}{}", &rest[..pos + delimiter.len()]);
                    if folders.insert(folder.clone()) {
                        entries.push((folder.clone(), json!({ "fileName": folder, "action": "folder" })));
                    }
                }
                None => entries.push((name.clone(), Self::file_json(name, id, content))),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let remaining: Vec<&(String, Value)> =
            entries.iter().filter(|(name, _)| name.as_str() >= start).collect();
        let page: Vec<Value> = remaining.iter().take(max).map(|(_, v)| v.clone()).collect();
        let next = remaining.get(max).map(|(name, _)| name.clone());
        json!({ "files": page, "nextFileName": next })
    }
}

async fn authorize(State(bucket): State<Shared>, headers: HeaderMap) -> Response {
    // "kid:key" in basic auth.
    if header(&headers, "authorization") != "Basic a2lkOmtleQ==" {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token");
    }
    bucket.authorizations.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "accountId": "acct",
        "authorizationToken": "tok",
        "apiUrl": bucket.base,
        "downloadUrl": bucket.base,
        "allowed": { "bucketId": "bkt", "bucketName": "photos" },
    }))
    .into_response()
}

async fn api(
    State(bucket): State<Shared>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if header(&headers, "authorization") != "tok" {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token");
    }
    match operation.as_str() {
        "b2_list_file_names" => Json(bucket.list_names(&body)).into_response(),
        "b2_list_file_versions" => {
            let prefix = body["prefix"].as_str().unwrap_or("");
            let start_name = body["startFileName"].as_str().unwrap_or("");
            let start_id = body["startFileId"].as_str();
            let max = body["maxFileCount"].as_u64().unwrap_or(100) as usize;
            let files = bucket.files.lock().unwrap();
            let all: Vec<(&String, &String, &Vec<u8>)> = files
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .flat_map(|(name, versions)| versions.iter().map(move |(id, c)| (name, id, c)))
                .collect();
            let begin = all
                .iter()
                .position(|(name, id, _)| match start_id {
                    Some(start_id) => name.as_str() == start_name && id.as_str() == start_id,
                    None => name.as_str() >= start_name,
                })
                .unwrap_or(all.len());
            let end = (begin + max).min(all.len());
            let page: Vec<Value> = all[begin..end]
                .iter()
                .map(|(name, id, content)| Bucket::file_json(name, id, content))
                .collect();
            let next = all.get(end);
            Json(json!({
                "files": page,
                "nextFileName": next.map(|(name, _, _)| name),
                "nextFileId": next.map(|(_, id, _)| id),
            }))
            .into_response()
        }
        "b2_delete_file_version" => {
            let name = body["fileName"].as_str().unwrap_or("");
            let id = body["fileId"].as_str().unwrap_or("");
            let mut files = bucket.files.lock().unwrap();
            let Some(versions) = files.get_mut(name) else {
                return error(StatusCode::BAD_REQUEST, "file_not_present");
            };
            versions.retain(|(v, _)| v != id);
            if versions.is_empty() {
                files.remove(name);
            }
            Json(json!({ "fileName": name, "fileId": id })).into_response()
        }
        "b2_get_upload_url" => Json(json!({
            "uploadUrl": format!("{}/upload", bucket.base),
            "authorizationToken": "up",
        }))
        .into_response(),
        "b2_start_large_file" => {
            let id = bucket.new_id();
            let name = body["fileName"].as_str().unwrap_or("").to_string();
            bucket
                .large
                .lock()
                .unwrap()
                .insert(id.clone(), (name, BTreeMap::new()));
            Json(json!({ "fileId": id })).into_response()
        }
        "b2_get_upload_part_url" => Json(json!({
            "uploadUrl": format!("{}/upload_part/{}", bucket.base, body["fileId"].as_str().unwrap_or("")),
            "authorizationToken": "up",
        }))
        .into_response(),
        "b2_finish_large_file" => {
            let id = body["fileId"].as_str().unwrap_or("");
            let Some((name, parts)) = bucket.large.lock().unwrap().remove(id) else {
                return error(StatusCode::BAD_REQUEST, "bad_request");
            };
            let expected: Vec<String> = parts.values().map(|p| signing::sha1_hex(p)).collect();
            if body["partSha1Array"] != json!(expected) {
                return error(StatusCode::BAD_REQUEST, "bad_request");
            }
            bucket.store(name, parts.into_values().flatten().collect());
            Json(json!({ "fileId": id })).into_response()
        }
        "b2_get_download_authorization" => {
            Json(json!({ "authorizationToken": "dl", "fileNamePrefix": body["fileNamePrefix"] }))
                .into_response()
        }
        _ => error(StatusCode::BAD_REQUEST, "bad_request"),
    }
}

async fn upload(State(bucket): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    if header(&headers, "authorization") != "up"
        || header(&headers, "x-bz-content-sha1") != signing::sha1_hex(&body)
    {
        return error(StatusCode::BAD_REQUEST, "bad_request");
    }
    let name = helpers::decode(header(&headers, "x-bz-file-name"));
    bucket.store(name, body.to_vec());
    StatusCode::OK.into_response()
}

async fn upload_part(
    State(bucket): State<Shared>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if header(&headers, "x-bz-content-sha1") != signing::sha1_hex(&body) {
        return error(StatusCode::BAD_REQUEST, "bad_request");
    }
    let number: u32 = header(&headers, "x-bz-part-number").parse().unwrap_or(0);
    match bucket.large.lock().unwrap().get_mut(&file_id) {
        Some((_, parts)) => {
            parts.insert(number, body.to_vec());
            StatusCode::OK.into_response()
        }
        None => error(StatusCode::BAD_REQUEST, "bad_request"),
    }
}

async fn download(State(bucket): State<Shared>, Path(key): Path<String>) -> Response {
    let files = bucket.files.lock().unwrap();
    match files.get(&key).and_then(|v| v.last()) {
        Some((_, content)) => (StatusCode::OK, content.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "not_found"),
    }
}

async fn provider(transfer: TransferConfig) -> (Arc<dyn StorageProvider>, Shared) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let bucket = Arc::new(Bucket {
        base: base.clone(),
        ..Bucket::default()
    });
    let router = Router::new()
        .route("/b2api/v2/b2_authorize_account", get(authorize))
        .route("/b2api/v2/{operation}", post(api))
        .route("/upload", post(upload))
        .route("/upload_part/{file_id}", post(upload_part))
        .route("/file/photos/{*key}", get(download))
        .with_state(Arc::clone(&bucket));
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let profile = ProviderConfig::new(BackendConfig::B2(B2Config {
        key_id: "kid".into(),
        application_key: "key".into(),
        bucket: "photos".into(),
        api_base: Some(base),
    }));
    let provider = factory::build(profile, transfer).await.unwrap();
    (provider, bucket)
}

#[tokio::test]
async fn test_upload_list_and_authorize_once() {
    let (b2, bucket) = provider(TransferConfig::default()).await;
    let scratch = tempfile::tempdir().unwrap();
    for key in ["a.txt", "img/1.png", "img/2.png", "img/raw/3.dng", "z.txt"] {
        let path = helpers::fixture(scratch.path(), "f", key.as_bytes()).await;
        b2.upload_file(&path, key, None).await.unwrap();
    }

    let mut options = ListOptions::default();
    options.max_keys = 2;
    let mut seen = Vec::new();
    loop {
        let page = b2.list_files(&options).await.unwrap();
        seen.extend(page.files.iter().map(|f| f.key.clone()));
        seen.extend(page.folders.iter().map(|f| f.key.clone()));
        match page.next_continuation_token {
            Some(token) => options = options.resume(Some(token)),
            None => break,
        }
    }
    assert_eq!(seen, vec!["a.txt", "img/", "z.txt"]);

    let img = b2.list_files(&ListOptions::under("img/")).await.unwrap();
    assert_eq!(img.files.len(), 2);
    assert_eq!(img.folders[0].key, "img/raw/");

    let info = b2.get_file_info("img/1.png").await.unwrap();
    assert_eq!(info.size, "img/1.png".len() as u64);
    assert_eq!(info.etag, Some(signing::sha1_hex(b"img/1.png")));

    assert_eq!(bucket.authorizations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_large_file_parts() {
    let transfer = TransferConfig {
        multipart_threshold_bytes: 10,
        part_size_bytes: 8,
        ..TransferConfig::default()
    };
    let (b2, bucket) = provider(transfer).await;
    let scratch = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..30u8).collect();
    let path = helpers::fixture(scratch.path(), "big.bin", &content).await;

    let (callback, reports) = helpers::recorder();
    b2.upload_file(&path, "big.bin", Some(callback)).await.unwrap();

    let files = bucket.files.lock().unwrap();
    assert_eq!(files["big.bin"].last().unwrap().1, content);
    assert_eq!(reports.lock().unwrap().last().unwrap().transferred, 30);
}

#[tokio::test]
async fn test_delete_removes_every_version() {
    let (b2, bucket) = provider(TransferConfig::default()).await;
    bucket.store("doc.txt".into(), b"v1".to_vec());
    bucket.store("doc.txt".into(), b"v2".to_vec());
    bucket.store("doc.txt.bak".into(), b"other".to_vec());

    let outcome = b2
        .delete_files(&["doc.txt".to_string(), "never.txt".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.deleted.len(), 2);
    assert!(!b2.file_exists("doc.txt").await.unwrap());
    assert!(b2.file_exists("doc.txt.bak").await.unwrap());
}

#[tokio::test]
async fn test_delete_follows_version_pages() {
    let (b2, bucket) = provider(TransferConfig::default()).await;
    for i in 0..250 {
        bucket.store("busy.log".into(), format!("v{i}").into_bytes());
    }
    bucket.store("busy.log.1".into(), b"rotated".to_vec());

    b2.delete_file("busy.log").await.unwrap();
    assert!(!bucket.files.lock().unwrap().contains_key("busy.log"));
    assert!(!b2.file_exists("busy.log").await.unwrap());
    assert!(b2.file_exists("busy.log.1").await.unwrap());
}

#[tokio::test]
async fn test_urls_and_download() {
    let (b2, bucket) = provider(TransferConfig::default()).await;
    bucket.store("a b.txt".into(), b"hello".to_vec());

    let public = b2.get_public_url("a b.txt").await.unwrap();
    assert_eq!(public, format!("{}/file/photos/a%20b.txt", bucket.base));

    let signed = b2
        .get_presigned_url("a b.txt", Some(std::time::Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(signed, format!("{public}?Authorization=dl"));

    let preview = b2.get_file_content("a b.txt", None).await.unwrap();
    assert_eq!(preview.content.as_deref(), Some("hello"));

    let scratch = tempfile::tempdir().unwrap();
    let target = scratch.path().join("a.txt");
    b2.download_file("a b.txt", &target, None).await.unwrap();
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"hello");
}
