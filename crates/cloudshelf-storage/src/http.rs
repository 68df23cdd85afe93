//! HTTP transport construction.
//!
//! Every REST Facade owns its own `reqwest::Client`. The proxy is an explicit
//! per-profile parameter: a profile without one gets `no_proxy()`, so
//! `HTTP_PROXY`/`HTTPS_PROXY` in the process environment never apply and
//! one profile's proxy can never leak into another's client.

use std::time::Duration;

use reqwest::{Client, Proxy};
use tracing::debug;

use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;

/// User agent sent by every REST Facade.
pub const USER_AGENT: &str = concat!("cloudshelf/", env!("CARGO_PKG_VERSION"));

/// Connect deadline for every transport.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client with an explicit proxy (or none) and an idle timeout.
///
/// `idle_timeout` bounds the gap between reads, not the whole exchange, so
/// a large body keeps streaming for as long as bytes keep arriving.
pub fn build_client(proxy: Option<&str>, idle_timeout: Duration) -> AppResult<Client> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(idle_timeout);

    builder = match proxy {
        Some(url) => {
            let proxy = Proxy::all(url).map_err(|e| {
                AppError::with_source(
                    ErrorKind::Configuration,
                    format!("Invalid proxy URL '{url}'"),
                    e,
                )
            })?;
            debug!(proxy = url, "Using explicit proxy");
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder.build().map_err(|e| {
        AppError::with_source(ErrorKind::Configuration, "Failed to build HTTP client", e)
    })
}
