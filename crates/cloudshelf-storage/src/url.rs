//! Object URL resolution.
//!
//! Resolution order per call: a configured custom domain always wins, then
//! the backend's default public endpoint for non-private profiles, then a
//! time-limited signed URL.

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use cloudshelf_core::config::provider::ProviderConfig;

/// Everything except RFC 3986 unreserved characters and `/`.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Strict set for query-string values (also encodes `/`).
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a key, keeping path separators.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

/// Percent-encode a query component.
pub fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE_SET).to_string()
}

/// Build `k=v&k=v` from pairs, encoding both sides.
pub fn query_string<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", encode_query(k), encode_query(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// What a Facade must do to produce a URL for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPlan {
    /// Final URL on the custom domain.
    Custom(String),
    /// Use the backend's default public endpoint.
    Default,
    /// Sign a URL with this lifetime.
    Signed(Duration),
}

/// Per-profile URL resolution policy.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    custom_domain: Option<String>,
    private: bool,
    has_default_endpoint: bool,
    default_expiry: Duration,
}

impl UrlResolver {
    /// Resolver for a normalized profile.
    pub fn new(profile: &ProviderConfig, has_default_endpoint: bool, default_expiry: Duration) -> Self {
        Self {
            custom_domain: profile.custom_domain.clone(),
            private: profile.private,
            has_default_endpoint,
            default_expiry,
        }
    }

    /// Decide how to address `key` with the default signed lifetime.
    pub fn plan(&self, key: &str) -> UrlPlan {
        self.plan_with(key, None)
    }

    /// Decide how to address `key`, signing with `expires` when signing is needed.
    pub fn plan_with(&self, key: &str, expires: Option<Duration>) -> UrlPlan {
        if let Some(domain) = &self.custom_domain {
            return UrlPlan::Custom(format!("{domain}/{}", encode_key(key.trim_start_matches('/'))));
        }
        if self.has_default_endpoint && !self.private {
            return UrlPlan::Default;
        }
        UrlPlan::Signed(expires.unwrap_or(self.default_expiry))
    }

    /// Default lifetime for signed URLs.
    pub fn default_expiry(&self) -> Duration {
        self.default_expiry
    }

    /// Whether uploads should report a URL: only when the object is publicly
    /// addressable without a signature.
    pub fn is_public(&self) -> bool {
        self.custom_domain.is_some() || (self.has_default_endpoint && !self.private)
    }
}
