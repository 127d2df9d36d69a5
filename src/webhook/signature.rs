// src/webhook/signature.rs
//! WebSub notification signatures: `X-Hub-Signature-256: sha256=<hex>` or
//! the legacy `X-Hub-Signature: sha1=<hex>`, HMAC over the raw body.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::IngestError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub const HEADER_SHA256: &str = "x-hub-signature-256";
pub const HEADER_SHA1: &str = "x-hub-signature";

fn key_error(e: hmac::digest::InvalidLength) -> IngestError {
    IngestError::Auth(format!("hmac key: {e}"))
}

/// `sha256=<hex>` for `body` under `secret`.
pub fn sign_sha256(secret: &str, body: &[u8]) -> Result<String, IngestError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(key_error)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// `sha1=<hex>` for `body` under `secret`.
pub fn sign_sha1(secret: &str, body: &[u8]) -> Result<String, IngestError> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).map_err(key_error)?;
    mac.update(body);
    Ok(format!("sha1={}", hex::encode(mac.finalize().into_bytes())))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Check the signature headers against `body`. Comparison is constant-time
/// (`Mac::verify_slice`). The SHA-256 header wins when both are present.
pub fn verify(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), IngestError> {
    if let Some(value) = header(headers, HEADER_SHA256) {
        let expected = decode(value, "sha256=")?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(key_error)?;
        mac.update(body);
        return mac
            .verify_slice(&expected)
            .map_err(|_| IngestError::Auth("signature mismatch".into()));
    }
    if let Some(value) = header(headers, HEADER_SHA1) {
        let expected = decode(value, "sha1=")?;
        let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).map_err(key_error)?;
        mac.update(body);
        return mac
            .verify_slice(&expected)
            .map_err(|_| IngestError::Auth("signature mismatch".into()));
    }
    Err(IngestError::Auth("signature header missing".into()))
}

fn decode(value: &str, prefix: &str) -> Result<Vec<u8>, IngestError> {
    let hex_part = value
        .strip_prefix(prefix)
        .ok_or_else(|| IngestError::Auth(format!("signature must start with {prefix}")))?;
    hex::decode(hex_part).map_err(|_| IngestError::Auth("signature is not hex".into()))
}
