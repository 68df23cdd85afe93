//! Central error classification.
//!
//! Every Facade funnels raw backend failures through this module: HTTP status
//! plus vendor error code decide the [`ErrorKind`], and the vendor's own
//! wording (pulled out of JSON, XML, or plain-text bodies) becomes the
//! message. Transport failures are always `Network`.

use reqwest::Response;
use serde::de::DeserializeOwned;
use tracing::debug;

use cloudshelf_core::error::{AppError, ErrorKind};
use cloudshelf_core::result::AppResult;

use crate::xml::Element;

const MAX_MESSAGE_LEN: usize = 300;

/// Classify a transport-level failure.
pub fn transport(err: reqwest::Error) -> AppError {
    let message = if err.is_timeout() {
        "Request timed out".to_string()
    } else if err.is_connect() {
        "Could not connect to the storage service (check the endpoint or proxy)".to_string()
    } else if err.is_decode() {
        return AppError::with_source(
            ErrorKind::MalformedResponse,
            "Could not decode the response body",
            err,
        );
    } else {
        format!("Request failed: {err}")
    };
    AppError::with_source(ErrorKind::Network, message, err)
}

/// Map an HTTP status and optional vendor code to an error kind.
pub fn kind_for(status: u16, code: Option<&str>) -> ErrorKind {
    if let Some(kind) = code.and_then(kind_for_code) {
        return kind;
    }
    match status {
        401 => ErrorKind::Authentication,
        403 => ErrorKind::Authorization,
        404 | 612 | 631 => ErrorKind::NotFound,
        407 | 408 | 502 | 503 | 504 => ErrorKind::Network,
        413 => ErrorKind::PayloadTooLarge,
        _ => ErrorKind::ExternalService,
    }
}

fn kind_for_code(code: &str) -> Option<ErrorKind> {
    let code = code.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| code.contains(n));

    if any(&[
        "nosuchkey",
        "nosuchbucket",
        "notfound",
        "not_found",
        "no such file",
        "no such bucket",
    ]) {
        Some(ErrorKind::NotFound)
    } else if any(&[
        "invalidaccesskeyid",
        "signaturedoesnotmatch",
        "invalidtoken",
        "expiredtoken",
        "authenticationfailed",
        "invalidauthenticationinfo",
        "bad_auth_token",
        "expired_auth_token",
        "invalid_access_token",
        "expired_access_token",
        "bad credentials",
        "bad token",
    ]) {
        Some(ErrorKind::Authentication)
    } else if any(&[
        "accessdenied",
        "access_denied",
        "allaccessdisabled",
        "authorizationfailure",
        "authorizationpermissionmismatch",
        "insufficient_scope",
    ]) {
        Some(ErrorKind::Authorization)
    } else if any(&["entitytoolarge", "too_large", "request_too_large"]) {
        Some(ErrorKind::PayloadTooLarge)
    } else {
        None
    }
}

/// Build an error from a failed HTTP exchange.
pub fn http_status(status: u16, body: &str) -> AppError {
    if looks_like_html(body) {
        let kind = match kind_for(status, None) {
            ErrorKind::ExternalService => ErrorKind::MalformedResponse,
            other => other,
        };
        return AppError::new(kind, format!("HTTP {status}: received an HTML page"));
    }

    let (code, message) = vendor_message(body);
    let kind = kind_for(status, code.as_deref());
    let message = match (code, message) {
        (Some(code), Some(message)) if !message.contains(&code) => format!("{code}: {message}"),
        (_, Some(message)) => message,
        (Some(code), None) => code,
        (None, None) => format!("HTTP {status}"),
    };
    AppError::new(kind, truncate(&message))
}

/// Pull a vendor error code and message out of a JSON or XML error body.
pub fn vendor_message(body: &str) -> (Option<String>, Option<String>) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, None);
    }

    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let text = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
            let code = text("code")
                .or_else(|| text("error_summary"))
                .or_else(|| value.get("error").and_then(|e| e.get(".tag")).and_then(|t| t.as_str()).map(str::to_string));
            let message = text("message")
                .or_else(|| text("error_description"))
                .or_else(|| text("error"))
                .or_else(|| text("error_summary"))
                .or_else(|| text("msg"));
            // Qiniu reports its condition only in `error`.
            let code = code.or_else(|| text("error"));
            return (code, message);
        }
    }

    if trimmed.starts_with('<') {
        if let Ok(root) = Element::parse(trimmed) {
            let code = root.child_text("Code").map(str::to_string);
            let message = root
                .child_text("Message")
                .map(str::to_string)
                .filter(|m| !m.is_empty());
            return (code, message);
        }
    }

    (None, Some(trimmed.to_string()))
}

/// Return the response unchanged when its status is 2xx, else the classified error.
pub async fn ensure_success(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %truncate(&body), "Backend returned an error");
    Err(http_status(status.as_u16(), &body))
}

/// Read a successful response body as text.
pub async fn read_text(response: Response) -> AppResult<String> {
    let response = ensure_success(response).await?;
    response.text().await.map_err(transport)
}

/// Read a successful response body as JSON.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> AppResult<T> {
    let body = read_text(response).await?;
    parse_json(&body)
}

/// Parse JSON, reporting HTML and schema mismatches as malformed responses.
pub fn parse_json<T: DeserializeOwned>(body: &str) -> AppResult<T> {
    if looks_like_html(body) {
        return Err(AppError::malformed(
            "Expected JSON but received an HTML page",
        ));
    }
    serde_json::from_str(body).map_err(|e| {
        AppError::with_source(
            ErrorKind::MalformedResponse,
            format!("Unexpected JSON from the storage service: {e}"),
            e,
        )
    })
}

/// Whether a body is an HTML page rather than structured data.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body
        .trim_start()
        .chars()
        .take(64)
        .collect::<String>()
        .to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
