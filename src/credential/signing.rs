//! Shared HMAC and encoding helpers for the provider signature schemes.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{DriveError, DriveResult};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters stay as they are.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');
const URI_PATH: &AsciiSet = &URI_COMPONENT.remove(b'/');

fn sha1_mac(key: &[u8], data: &[u8]) -> DriveResult<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|e| DriveError::Storage(format!("hmac key: {}", e)))?;
    mac.update(data);
    Ok(mac)
}

fn sha256_mac(key: &[u8], data: &[u8]) -> DriveResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| DriveError::Storage(format!("hmac key: {}", e)))?;
    mac.update(data);
    Ok(mac)
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> DriveResult<Vec<u8>> {
    Ok(sha1_mac(key, data)?.finalize().into_bytes().to_vec())
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> DriveResult<Vec<u8>> {
    Ok(sha256_mac(key, data)?.finalize().into_bytes().to_vec())
}

/// Constant-time comparison of an HMAC-SHA1 against `expected`.
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], expected: &[u8]) -> DriveResult<bool> {
    Ok(sha1_mac(key, data)?.verify_slice(expected).is_ok())
}

/// Constant-time comparison of an HMAC-SHA256 against `expected`.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> DriveResult<bool> {
    Ok(sha256_mac(key, data)?.verify_slice(expected).is_ok())
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn b64_decode(text: &str) -> Option<Vec<u8>> {
    STANDARD.decode(text.trim()).ok()
}

pub fn urlsafe_b64(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

pub fn urlsafe_b64_decode(text: &str) -> Option<Vec<u8>> {
    URL_SAFE.decode(text.trim()).ok()
}

/// Percent-encode one URI component, `/` included.
pub fn uri_encode(text: &str) -> String {
    utf8_percent_encode(text, URI_COMPONENT).to_string()
}

/// Percent-encode an object path, keeping `/` separators.
pub fn uri_encode_path(text: &str) -> String {
    utf8_percent_encode(text, URI_PATH).to_string()
}

/// Per-session token handed to clients of lookup-verified backends and
/// presented back on completion.
pub fn callback_token(secret: &str, session_id: &str) -> DriveResult<String> {
    Ok(hex::encode(hmac_sha256(secret.as_bytes(), session_id.as_bytes())?))
}

pub fn verify_callback_token(secret: &str, session_id: &str, presented: &str) -> DriveResult<bool> {
    match hex::decode(presented.trim()) {
        Ok(bytes) => verify_hmac_sha256(secret.as_bytes(), session_id.as_bytes(), &bytes),
        Err(_) => Ok(false),
    }
}
