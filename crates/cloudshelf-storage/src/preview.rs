//! Size-gated content preview.

use std::future::Future;

use tracing::debug;

use cloudshelf_core::result::AppResult;
use cloudshelf_core::types::{FileInfo, PreviewContent};

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "log", "csv", "tsv", "json", "jsonc", "xml", "yaml", "yml", "toml",
    "ini", "conf", "cfg", "env", "js", "mjs", "cjs", "ts", "jsx", "tsx", "css", "scss", "less",
    "html", "htm", "svg",
];

/// Enforces the preview size cap and the text-like content allow-list.
#[derive(Debug, Clone, Copy)]
pub struct PreviewGate {
    max_bytes: u64,
}

impl PreviewGate {
    /// Gate with a default cap in bytes.
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Effective cap for one request.
    pub fn limit(&self, max_size: Option<u64>) -> u64 {
        max_size.unwrap_or(self.max_bytes)
    }

    /// `Some(tooLarge)` when `size` exceeds the cap.
    pub fn check_size(&self, size: u64, max_size: Option<u64>) -> Option<PreviewContent> {
        (size > self.limit(max_size)).then(|| PreviewContent {
            content: None,
            size,
            too_large: true,
            binary: false,
            content_type: None,
        })
    }

    /// Whether the object should be decoded as text.
    pub fn is_text_like(content_type: Option<&str>, key: &str) -> bool {
        let declared = content_type
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|ct| !ct.is_empty() && !is_generic(ct));

        if let Some(ct) = declared {
            return is_text_mime(&ct);
        }

        let extension = key
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        if extension
            .as_deref()
            .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext))
        {
            return true;
        }
        mime_guess::from_path(key)
            .first()
            .is_some_and(|mime| is_text_mime(mime.essence_str()))
    }

    /// Build the preview from fetched bytes.
    pub fn render(bytes: &[u8], size: u64, content_type: Option<String>) -> PreviewContent {
        PreviewContent {
            content: Some(String::from_utf8_lossy(bytes).into_owned()),
            size,
            too_large: false,
            binary: false,
            content_type,
        }
    }

    /// Placeholder for content that is not text.
    pub fn placeholder(size: u64, content_type: Option<String>) -> PreviewContent {
        let label = content_type.as_deref().unwrap_or("unknown type");
        PreviewContent {
            content: Some(format!(
                "Binary file ({label}, {size} bytes); inline preview is not available"
            )),
            size,
            too_large: false,
            binary: true,
            content_type,
        }
    }

    /// Full preview flow over already-fetched metadata. `fetch` is only
    /// called for text-like objects within the cap, with the cap as argument.
    pub async fn preview<F, Fut>(
        &self,
        info: FileInfo,
        max_size: Option<u64>,
        fetch: F,
    ) -> AppResult<PreviewContent>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = AppResult<Vec<u8>>>,
    {
        if let Some(mut too_large) = self.check_size(info.size, max_size) {
            debug!(key = %info.key, size = info.size, "Preview skipped: object too large");
            too_large.content_type = info.content_type;
            return Ok(too_large);
        }

        let content_type = info
            .content_type
            .clone()
            .or_else(|| mime_guess::from_path(&info.key).first().map(|m| m.to_string()));

        if !Self::is_text_like(info.content_type.as_deref(), &info.key) {
            return Ok(Self::placeholder(info.size, content_type));
        }

        if info.size == 0 {
            return Ok(Self::render(&[], 0, content_type));
        }
        let bytes = fetch(self.limit(max_size)).await?;
        Ok(Self::render(&bytes, info.size, content_type))
    }
}

fn is_generic(content_type: &str) -> bool {
    matches!(
        content_type,
        "application/octet-stream" | "binary/octet-stream" | "application/unknown"
    )
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("json")
        || mime.ends_with("+xml")
        || mime == "application/xml"
        || mime.contains("javascript")
        || mime.contains("ecmascript")
        || mime == "application/x-sh"
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn info(key: &str, size: u64, content_type: Option<&str>) -> FileInfo {
        FileInfo {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
            content_type: content_type.map(str::to_string),
            storage_class: "STANDARD".into(),
        }
    }

    #[test]
    fn test_text_like_detection() {
        assert!(PreviewGate::is_text_like(Some("text/plain; charset=utf-8"), "x"));
        assert!(PreviewGate::is_text_like(Some("application/json"), "x"));
        assert!(PreviewGate::is_text_like(Some("application/vnd.api+json"), "x"));
        assert!(PreviewGate::is_text_like(Some("image/svg+xml"), "x"));
        assert!(PreviewGate::is_text_like(Some("application/javascript"), "x"));
        assert!(!PreviewGate::is_text_like(Some("image/png"), "notes.txt"));
        assert!(PreviewGate::is_text_like(Some("application/octet-stream"), "a/notes.md"));
        assert!(PreviewGate::is_text_like(None, "style.css"));
        assert!(!PreviewGate::is_text_like(None, "photo.jpg"));
        assert!(!PreviewGate::is_text_like(None, "no-extension"));
    }

    #[tokio::test]
    async fn test_oversized_object_is_not_fetched() {
        let gate = PreviewGate::new(1024 * 1024);
        let fetched = AtomicBool::new(false);
        let preview = gate
            .preview(info("a.txt", 1025, Some("text/plain")), Some(1024), |_| async {
                fetched.store(true, Ordering::SeqCst);
                Ok(vec![])
            })
            .await
            .unwrap();
        assert!(preview.too_large);
        assert_eq!(preview.size, 1025);
        assert!(preview.content.is_none());
        assert!(!fetched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_object_at_cap_is_returned() {
        let gate = PreviewGate::new(1024 * 1024);
        let body = vec![b'a'; 1024];
        let preview = gate
            .preview(info("a.txt", 1024, None), Some(1024), |cap| {
                assert_eq!(cap, 1024);
                let body = body.clone();
                async move { Ok(body) }
            })
            .await
            .unwrap();
        assert!(!preview.too_large);
        assert_eq!(preview.content.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_binary_gets_placeholder() {
        let gate = PreviewGate::new(1024);
        let preview = gate
            .preview(info("p.png", 10, Some("image/png")), None, |_| async {
                Ok(vec![0u8; 10])
            })
            .await
            .unwrap();
        assert!(preview.binary);
        assert!(preview.content.unwrap().contains("image/png"));
    }
}
