//! Client-side key search.
//!
//! Search walks the full listing one page at a time and keeps keys whose
//! text contains the term, ignoring case. Cost is linear in the number of
//! objects under the prefix.

use std::collections::HashSet;

use tracing::debug;

use crate::error::AppError;
use crate::result::AppResult;
use crate::traits::StorageProvider;
use crate::types::{ListOptions, SearchOptions, SearchResult};

/// Whether `key` contains `term`, case-insensitively. An empty term matches
/// every key.
pub fn key_matches(key: &str, term: &str) -> bool {
    term.is_empty() || key.to_lowercase().contains(&term.to_lowercase())
}

/// Walk every page of a flat listing under `options.prefix` and collect
/// matching objects in listing order. The term is matched as given,
/// surrounding whitespace included.
pub async fn search_listing<P>(
    provider: &P,
    term: &str,
    options: &SearchOptions,
) -> AppResult<SearchResult>
where
    P: StorageProvider + ?Sized,
{
    let term = term.to_lowercase();
    let mut request = ListOptions::recursive(options.prefix.clone());
    request.max_keys = options.page_size;

    let mut seen_tokens = HashSet::new();
    let mut files = Vec::new();
    let mut pages = 0usize;

    loop {
        let page = provider.list_files(&request).await?;
        pages += 1;

        for entry in page.files {
            if key_matches(&entry.key, &term) {
                files.push(entry);
                if options.limit.is_some_and(|limit| files.len() >= limit) {
                    return Ok(finish(files, pages));
                }
            }
        }

        match page.next_continuation_token {
            Some(token) => {
                if !seen_tokens.insert(token.clone()) {
                    return Err(AppError::malformed(format!(
                        "Listing returned continuation token '{token}' twice"
                    )));
                }
                request = request.resume(Some(token));
            }
            None => return Ok(finish(files, pages)),
        }
    }
}

fn finish(files: Vec<crate::types::ObjectEntry>, pages: usize) -> SearchResult {
    debug!(matches = files.len(), pages, "Search finished");
    SearchResult {
        total: files.len(),
        files,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::types::{
        ConnectionStatus, DeleteOutcome, FileInfo, ListResult, ObjectEntry, PreviewContent,
        ProgressCallback, ProviderType, UploadOutcome,
    };

    /// In-memory listing served two keys per page.
    #[derive(Debug)]
    struct PagedKeys {
        keys: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl PagedKeys {
        fn new(keys: Vec<&'static str>) -> Self {
            Self {
                keys,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageProvider for PagedKeys {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Local
        }

        fn bucket(&self) -> &str {
            "memory"
        }

        async fn test_connection(&self) -> ConnectionStatus {
            ConnectionStatus::ok("ok")
        }

        async fn upload_file(
            &self,
            _local_path: &Path,
            _key: &str,
            _progress: Option<ProgressCallback>,
        ) -> AppResult<UploadOutcome> {
            Err(AppError::not_supported("read-only"))
        }

        async fn download_file(
            &self,
            _key: &str,
            _local_path: &Path,
            _progress: Option<ProgressCallback>,
        ) -> AppResult<()> {
            Err(AppError::not_supported("read-only"))
        }

        async fn delete_file(&self, _key: &str) -> AppResult<()> {
            Err(AppError::not_supported("read-only"))
        }

        async fn delete_files(&self, _keys: &[String]) -> AppResult<DeleteOutcome> {
            Err(AppError::not_supported("read-only"))
        }

        async fn list_files(&self, options: &ListOptions) -> AppResult<ListResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start: usize = options
                .continuation_token
                .as_deref()
                .map(|t| t.parse().unwrap())
                .unwrap_or(0);
            let end = (start + 2).min(self.keys.len());
            let files = self.keys[start..end]
                .iter()
                .map(|k| ObjectEntry::new(*k, 1))
                .collect();
            let next = (end < self.keys.len()).then(|| end.to_string());
            Ok(ListResult::from_parts(files, vec![], next))
        }

        async fn get_public_url(&self, key: &str) -> AppResult<String> {
            Ok(format!("memory://{key}"))
        }

        async fn get_presigned_url(
            &self,
            key: &str,
            _expires_in: Option<Duration>,
        ) -> AppResult<String> {
            self.get_public_url(key).await
        }

        async fn get_file_info(&self, key: &str) -> AppResult<FileInfo> {
            Err(AppError::not_found(key.to_string()))
        }

        async fn get_file_content(
            &self,
            key: &str,
            _max_size: Option<u64>,
        ) -> AppResult<PreviewContent> {
            Err(AppError::not_found(key.to_string()))
        }
    }

    #[test]
    fn test_key_matches_case_insensitive() {
        assert!(key_matches("README.txt", "readme"));
        assert!(key_matches("my-readme.md", "readme"));
        assert!(key_matches("a/readme", "ReadMe"));
        assert!(!key_matches("read.me", "readme"));
        assert!(key_matches("anything", ""));
    }

    #[tokio::test]
    async fn test_search_walks_every_page() {
        let provider = PagedKeys::new(vec![
            "README.txt",
            "docs/guide.md",
            "my-readme.md",
            "read.me",
            "a/readme",
        ]);
        let result = provider
            .search_files("readme", &SearchOptions::default())
            .await
            .unwrap();
        let keys: Vec<_> = result.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["README.txt", "my-readme.md", "a/readme"]);
        assert_eq!(result.total, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_search_keeps_surrounding_whitespace() {
        let provider = PagedKeys::new(vec!["README.txt", "my readme.md", "notes/readme"]);
        let result = provider
            .search_files(" readme", &SearchOptions::default())
            .await
            .unwrap();
        let keys: Vec<_> = result.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["my readme.md"]);
    }

    #[tokio::test]
    async fn test_search_stops_at_limit() {
        let provider = PagedKeys::new(vec!["readme-1", "x", "readme-2", "readme-3", "y"]);
        let options = SearchOptions {
            limit: Some(2),
            ..SearchOptions::default()
        };
        let result = provider.search_files("README", &options).await.unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_file_exists_maps_not_found_to_false() {
        let provider = PagedKeys::new(vec![]);
        assert!(!provider.file_exists("gone.txt").await.unwrap());
    }
}
