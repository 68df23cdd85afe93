//! Digest, HMAC, and encoding helpers shared by the request signers.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use cloudshelf_core::error::AppError;
use cloudshelf_core::result::AppResult;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA1 of `data` under `key`.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> AppResult<Vec<u8>> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| AppError::internal(format!("HMAC-SHA1 key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> AppResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AppError::internal(format!("HMAC-SHA256 key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Lowercase hex SHA-1.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Lowercase hex MD5.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Base64 of the raw MD5 digest, as used by `Content-MD5`.
pub fn md5_base64(data: &[u8]) -> String {
    STANDARD.encode(Md5::digest(data))
}

/// Standard base64.
pub fn base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// URL-safe base64 with padding, as Qiniu expects.
pub fn base64_url(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// Decode standard base64.
pub fn base64_decode(text: &str) -> AppResult<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| AppError::validation(format!("Invalid base64 value: {e}")))
}

/// Incremental SHA-1 for streamed payloads.
#[derive(Default)]
pub struct Sha1Stream(Sha1);

impl Sha1Stream {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    /// Lowercase hex digest.
    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// RFC 1123 date, as used by `Date`/`x-ms-date` headers.
pub fn http_date(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
