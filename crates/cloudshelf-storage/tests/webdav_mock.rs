//! WebDAV provider against an in-process mock server.

mod helpers;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};

use cloudshelf_core::config::provider::{BackendConfig, ProviderConfig, WebdavConfig};
use cloudshelf_core::config::transfer::TransferConfig;
use cloudshelf_core::traits::StorageProvider;
use cloudshelf_core::types::ListOptions;
use cloudshelf_storage::factory;

const ROOT: &str = "/dav";

#[derive(Default)]
struct Dav {
    files: BTreeMap<String, Vec<u8>>,
    collections: BTreeSet<String>,
}

type Shared = Arc<Mutex<Dav>>;

fn key_of(uri: &Uri) -> String {
    let path = helpers::decode(uri.path());
    path.strip_prefix(ROOT)
        .unwrap_or(&path)
        .trim_matches('/')
        .to_string()
}

fn response_xml(key: &str, collection: bool, size: usize) -> String {
    let href = if key.is_empty() {
        format!("{ROOT}/")
    } else if collection {
        format!("{ROOT}/{key}/")
    } else {
        format!("{ROOT}/{key}")
    };
    let props = if collection {
        "<D:resourcetype><D:collection/></D:resourcetype>".to_string()
    } else {
        format!(
            "<D:resourcetype/><D:getcontentlength>{size}</D:getcontentlength>\
             <D:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</D:getlastmodified>\
             <D:getetag>\"{size}\"</D:getetag>"
        )
    };
    format!(
        "<D:response><D:href>{href}</D:href><D:propstat><D:prop>{props}</D:prop>\
         <D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>"
    )
}

fn propfind(dav: &Dav, key: &str, depth: &str) -> Response {
    if let Some(content) = dav.files.get(key) {
        let body = response_xml(key, false, content.len());
        return multistatus(body);
    }
    let prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
    let exists = key.is_empty()
        || dav.collections.contains(key)
        || dav.files.keys().any(|k| k.starts_with(&prefix));
    if !exists {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut body = response_xml(key, true, 0);
    if depth == "1" {
        let mut dirs = BTreeSet::new();
        for (file, content) in dav.files.range(prefix.clone()..) {
            let Some(rest) = file.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(format!("{prefix}{dir}"));
                }
                None => body.push_str(&response_xml(file, false, content.len())),
            }
        }
        for dir in dirs {
            body.push_str(&response_xml(&dir, true, 0));
        }
    }
    multistatus(body)
}

fn multistatus(inner: String) -> Response {
    (
        StatusCode::MULTI_STATUS,
        [("content-type", "application/xml; charset=utf-8")],
        format!("<?xml version=\"1.0\"?><D:multistatus xmlns:D=\"DAV:\">{inner}</D:multistatus>"),
    )
        .into_response()
}

async fn handle(
    State(dav): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = key_of(&uri);
    let mut dav = dav.lock().unwrap();
    match method.as_str() {
        "PROPFIND" => {
            let depth = headers
                .get("depth")
                .and_then(|d| d.to_str().ok())
                .unwrap_or("1");
            propfind(&dav, &key, depth)
        }
        "MKCOL" => {
            if dav.collections.insert(key) {
                StatusCode::CREATED.into_response()
            } else {
                StatusCode::METHOD_NOT_ALLOWED.into_response()
            }
        }
        "PUT" => {
            dav.files.insert(key, body.to_vec());
            StatusCode::CREATED.into_response()
        }
        "GET" => match dav.files.get(&key) {
            Some(content) => {
                let end = headers
                    .get("range")
                    .and_then(|r| r.to_str().ok())
                    .and_then(|r| r.strip_prefix("bytes=0-"))
                    .and_then(|n| n.parse::<usize>().ok())
                    .map(|last| (last + 1).min(content.len()))
                    .unwrap_or(content.len());
                (StatusCode::OK, content[..end].to_vec()).into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        },
        "DELETE" => match dav.files.remove(&key) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn provider() -> (Arc<dyn StorageProvider>, Shared) {
    let state: Shared = Arc::default();
    let router = Router::new()
        .route(ROOT, any(handle))
        .route(&format!("{ROOT}/"), any(handle))
        .route(&format!("{ROOT}/{{*path}}"), any(handle))
        .with_state(Arc::clone(&state));
    let base = helpers::serve(router).await;
    (connect(&base, TransferConfig::default()).await, state)
}

async fn connect(base: &str, transfer: TransferConfig) -> Arc<dyn StorageProvider> {
    let profile = ProviderConfig::new(BackendConfig::Webdav(WebdavConfig {
        endpoint: format!("{base}{ROOT}"),
        username: "alice".into(),
        password: "secret".into(),
    }));
    factory::build(profile, transfer)
        .await
        .expect("Failed to build webdav provider")
}

/// Eight 1 KiB chunks, 300 ms apart.
async fn trickle() -> Response {
    let chunks = futures::stream::unfold(0u8, |i| async move {
        if i == 8 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from(vec![i; 1024])), i + 1))
    });
    Body::from_stream(chunks).into_response()
}

#[tokio::test]
async fn test_upload_creates_parent_collections() {
    let (dav, state) = provider().await;
    let scratch = tempfile::tempdir().unwrap();
    let path = helpers::fixture(scratch.path(), "note.txt", b"hello webdav").await;

    let outcome = dav.upload_file(&path, "docs/2024/note.txt", None).await.unwrap();
    assert_eq!(outcome.key, "docs/2024/note.txt");
    assert!(outcome.url.unwrap().ends_with("/dav/docs/2024/note.txt"));

    let state = state.lock().unwrap();
    assert!(state.collections.contains("docs"));
    assert!(state.collections.contains("docs/2024"));
    assert_eq!(state.files["docs/2024/note.txt"], b"hello webdav");
}

#[tokio::test]
async fn test_listing_pages_and_folders() {
    let (dav, state) = provider().await;
    {
        let mut state = state.lock().unwrap();
        for i in 0..7 {
            state.files.insert(format!("img/{i}.png"), vec![0; i]);
        }
        state.files.insert("img/raw/a.dng".into(), vec![1]);
        state.files.insert("top.txt".into(), vec![2]);
    }

    let root = dav.list_files(&ListOptions::default()).await.unwrap();
    assert_eq!(root.files.len(), 1);
    assert_eq!(root.folders[0].key, "img/");

    let mut options = ListOptions::under("img/");
    options.max_keys = 3;
    let mut keys = Vec::new();
    loop {
        let page = dav.list_files(&options).await.unwrap();
        keys.extend(page.files.iter().map(|f| f.key.clone()));
        keys.extend(page.folders.iter().map(|f| f.key.clone()));
        match page.next_continuation_token {
            Some(token) => options = options.resume(Some(token)),
            None => break,
        }
    }
    assert_eq!(keys.len(), 8);
    assert_eq!(keys.iter().collect::<BTreeSet<_>>().len(), 8);
    assert!(keys.contains(&"img/raw/".to_string()));

    let all = dav.list_files(&ListOptions::recursive("img/")).await.unwrap();
    assert_eq!(all.files.len(), 8);
}

#[tokio::test]
async fn test_info_preview_and_delete() {
    let (dav, state) = provider().await;
    state
        .lock()
        .unwrap()
        .files
        .insert("readme.md".into(), b"# Title\nbody".to_vec());

    let info = dav.get_file_info("readme.md").await.unwrap();
    assert_eq!(info.size, 12);
    assert_eq!(info.etag.as_deref(), Some("12"));

    let preview = dav.get_file_content("readme.md", None).await.unwrap();
    assert_eq!(preview.content.as_deref(), Some("# Title\nbody"));

    let capped = dav.get_file_content("readme.md", Some(4)).await.unwrap();
    assert!(capped.too_large);

    let outcome = dav
        .delete_files(&["readme.md".to_string(), "missing.md".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.deleted.len(), 2);
    assert!(!dav.file_exists("readme.md").await.unwrap());
}

#[tokio::test]
async fn test_missing_directory_lists_empty() {
    let (dav, _state) = provider().await;
    let page = dav.list_files(&ListOptions::under("nothing/here/")).await.unwrap();
    assert!(page.files.is_empty());
    assert!(page.folders.is_empty());
    assert!(dav.test_connection().await.success);
}

#[tokio::test]
async fn test_slow_download_outlives_idle_timeout() {
    let router = Router::new().route(&format!("{ROOT}/{{*path}}"), get(trickle));
    let base = helpers::serve(router).await;
    let transfer = TransferConfig {
        request_timeout_secs: 1,
        ..TransferConfig::default()
    };
    let dav = connect(&base, transfer).await;

    let scratch = tempfile::tempdir().unwrap();
    let dest = scratch.path().join("slow.bin");
    dav.download_file("slow.bin", &dest, None).await.unwrap();

    let content = tokio::fs::read(&dest).await.unwrap();
    assert_eq!(content.len(), 8 * 1024);
    assert_eq!(content[8 * 1024 - 1], 7);
}
