//! Qiniu Kodo: upload tokens for form POST and `QBox` signed callbacks.

use async_trait::async_trait;
use log::warn;
use serde_json::json;
use std::collections::BTreeMap;

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::signing::{hmac_sha1, urlsafe_b64, urlsafe_b64_decode, verify_hmac_sha1};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};

const DEFAULT_UPLOAD_HOST: &str = "https://upload.qiniup.com";
const RS_HOST: &str = "https://rs.qbox.me";
const FORM_TYPE: &str = "application/x-www-form-urlencoded";
/// Qiniu's "no such file or directory" status on management calls.
const STATUS_NO_SUCH_ENTRY: u16 = 612;

/// `ak:sign:encodedPutPolicy`
pub fn upload_token(policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<String> {
    let put_policy = json!({
        "scope": format!("{}:{}", policy.bucket, target.backend_key),
        "deadline": target.expires_at.timestamp(),
        "fsizeLimit": target.declared_size,
        "callbackUrl": target.callback_url,
        "callbackBody": "key=$(key)&fsize=$(fsize)&hash=$(etag)",
        "callbackBodyType": FORM_TYPE,
    });
    let encoded = urlsafe_b64(put_policy.to_string().as_bytes());
    let sign = urlsafe_b64(&hmac_sha1(policy.secret.as_bytes(), encoded.as_bytes())?);
    Ok(format!("{}:{}:{}", policy.access_key, sign, encoded))
}

/// `QBox ak:sign` over `path[?query]\nbody`, as Qiniu signs its callbacks.
pub fn sign_request(policy: &StoragePolicy, path_and_query: &str, body: &[u8]) -> DriveResult<String> {
    let mut data = format!("{}\n", path_and_query).into_bytes();
    data.extend_from_slice(body);
    let sign = urlsafe_b64(&hmac_sha1(policy.secret.as_bytes(), &data)?);
    Ok(format!("QBox {}:{}", policy.access_key, sign))
}

pub struct QiniuDriver {
    http: reqwest::Client,
}

impl QiniuDriver {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BackendDriver for QiniuDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Qiniu
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let mut fields = BTreeMap::new();
        fields.insert("token".to_string(), upload_token(policy, target)?);
        fields.insert("key".to_string(), target.backend_key.clone());
        let url = if policy.endpoint.is_empty() { DEFAULT_UPLOAD_HOST.to_string() } else { policy.endpoint.clone() };
        Ok(IssuedCredential::new(ProviderCredential::FormPost { url, fields }))
    }

    async fn verify_callback(
        &self,
        policy: &StoragePolicy,
        _pending: &PendingUpload,
        request: &CallbackRequest,
    ) -> DriveResult<CompletionReport> {
        let credentials = request
            .header("authorization")
            .and_then(|value| value.strip_prefix("QBox "))
            .ok_or_else(|| DriveError::SignatureInvalid("missing QBox authorization".to_string()))?;
        let (access_key, sign) = credentials
            .split_once(':')
            .ok_or_else(|| DriveError::SignatureInvalid("malformed QBox authorization".to_string()))?;
        if access_key != policy.access_key {
            return Err(DriveError::SignatureInvalid("unknown access key".to_string()));
        }
        // The body only takes part in the signature for form bodies.
        let is_form = request.header("content-type").map_or(false, |ct| ct.starts_with(FORM_TYPE));
        if !is_form {
            return Err(DriveError::SignatureInvalid("callback body must be form encoded".to_string()));
        }

        let expected = urlsafe_b64_decode(sign)
            .ok_or_else(|| DriveError::SignatureInvalid("signature is not base64".to_string()))?;
        let mut data = format!("{}\n", request.path_and_query()).into_bytes();
        data.extend_from_slice(&request.body);
        if !verify_hmac_sha1(policy.secret.as_bytes(), &data, &expected)? {
            return Err(DriveError::SignatureInvalid("QBox signature mismatch".to_string()));
        }

        let form = request.form();
        let key = form
            .get("key")
            .cloned()
            .ok_or_else(|| DriveError::InvalidRequest("callback body has no key".to_string()))?;
        let size = form
            .get("fsize")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| DriveError::InvalidRequest("callback body has no fsize".to_string()))?;
        Ok(CompletionReport { key, size, content_hash: form.get("hash").cloned() })
    }

    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        let entry = urlsafe_b64(format!("{}:{}", policy.bucket, key).as_bytes());
        let path = format!("/delete/{}", entry);
        let authorization = sign_request(policy, &path, b"")?;
        let response = self
            .http
            .post(format!("{}{}", RS_HOST, path))
            .header("Authorization", authorization)
            .header("Content-Type", FORM_TYPE)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == STATUS_NO_SUCH_ENTRY {
            Ok(())
        } else {
            warn!("Qiniu delete of {} returned {}", key, status);
            Err(DriveError::BackendUnavailable(format!("qiniu delete returned {}", status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn policy() -> StoragePolicy {
        let mut policy = StoragePolicy::local(4, "kodo");
        policy.kind = BackendKind::Qiniu;
        policy.bucket = "files".into();
        policy.access_key = "ak".into();
        policy.secret = "sk".into();
        policy
    }

    #[test]
    fn test_upload_token_shape() {
        let target = UploadTarget {
            session_id: "s".into(),
            backend_key: "1/a.txt".into(),
            file_name: "a.txt".into(),
            declared_size: 10,
            expires_at: Utc::now() + Duration::hours(1),
            callback_url: "https://drive.example/callback/qiniu/4/s".into(),
            public_base_url: "https://drive.example".into(),
        };
        let token = upload_token(&policy(), &target).unwrap();
        let parts: Vec<&str> = token.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ak");

        let decoded = urlsafe_b64_decode(parts[2]).unwrap();
        let put_policy: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(put_policy["scope"], "files:1/a.txt");
        assert_eq!(put_policy["callbackUrl"], target.callback_url);
    }

    #[test]
    fn test_sign_request_covers_body() {
        let a = sign_request(&policy(), "/callback/qiniu/4/s", b"key=a").unwrap();
        let b = sign_request(&policy(), "/callback/qiniu/4/s", b"key=b").unwrap();
        assert!(a.starts_with("QBox ak:"));
        assert_ne!(a, b);
    }
}
