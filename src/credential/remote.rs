//! Remote storage nodes: another server speaking a small HMAC-signed HTTP
//! protocol. Clients PUT to the node, the node calls back when done.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::signing::{hmac_sha256, uri_encode_path, urlsafe_b64, urlsafe_b64_decode, verify_hmac_sha256};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};

fn signed_content(method: &str, path: &str, body: &[u8], expires: i64) -> Vec<u8> {
    let mut data = format!("{}\n{}\n", method, path).into_bytes();
    data.extend_from_slice(body);
    data.extend_from_slice(format!(":{}", expires).as_bytes());
    data
}

/// `urlsafe_b64(HMAC-SHA256(secret, "METHOD\npath\nbody:expires"))`
pub fn remote_sign(secret: &str, method: &str, path: &str, body: &[u8], expires: i64) -> DriveResult<String> {
    Ok(urlsafe_b64(&hmac_sha256(secret.as_bytes(), &signed_content(method, path, body, expires))?))
}

/// Value of the `Authorization` header both sides send.
pub fn bearer(secret: &str, method: &str, path: &str, body: &[u8], expires: i64) -> DriveResult<String> {
    Ok(format!("Bearer {}:{}", remote_sign(secret, method, path, body, expires)?, expires))
}

#[derive(Deserialize)]
struct RemoteCallbackBody {
    key: String,
    size: u64,
    #[serde(default)]
    md5: Option<String>,
}

pub struct RemoteDriver {
    http: reqwest::Client,
}

impl RemoteDriver {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BackendDriver for RemoteDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let path = format!("/upload/{}", uri_encode_path(&target.backend_key));
        let expires = target.expires_at.timestamp();
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), bearer(&policy.secret, "PUT", &path, b"", expires)?);
        headers.insert("X-Callback-Url".to_string(), target.callback_url.clone());
        Ok(IssuedCredential::new(ProviderCredential::SignedUrl {
            url: format!("{}{}", policy.endpoint.trim_end_matches('/'), path),
            method: "PUT".to_string(),
            headers,
            callback_token: None,
        }))
    }

    async fn verify_callback(
        &self,
        policy: &StoragePolicy,
        _pending: &PendingUpload,
        request: &CallbackRequest,
    ) -> DriveResult<CompletionReport> {
        let credentials = request
            .header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| DriveError::SignatureInvalid("missing bearer signature".to_string()))?;
        let (sign, expires) = credentials
            .rsplit_once(':')
            .ok_or_else(|| DriveError::SignatureInvalid("malformed bearer signature".to_string()))?;
        let expires: i64 = expires
            .parse()
            .map_err(|_| DriveError::SignatureInvalid("malformed signature expiry".to_string()))?;
        if expires < Utc::now().timestamp() {
            return Err(DriveError::SignatureInvalid("signature expired".to_string()));
        }

        let expected = urlsafe_b64_decode(sign)
            .ok_or_else(|| DriveError::SignatureInvalid("signature is not base64".to_string()))?;
        let data = signed_content("POST", &request.path, &request.body, expires);
        if !verify_hmac_sha256(policy.secret.as_bytes(), &data, &expected)? {
            return Err(DriveError::SignatureInvalid("remote signature mismatch".to_string()));
        }

        let body: RemoteCallbackBody = serde_json::from_slice(&request.body)
            .map_err(|e| DriveError::InvalidRequest(format!("malformed remote callback body: {}", e)))?;
        Ok(CompletionReport { key: body.key, size: body.size, content_hash: body.md5 })
    }

    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        let path = format!("/delete/{}", uri_encode_path(key));
        let expires = Utc::now().timestamp() + 60;
        let response = self
            .http
            .delete(format!("{}{}", policy.endpoint.trim_end_matches('/'), path))
            .header("Authorization", bearer(&policy.secret, "DELETE", &path, b"", expires)?)
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            warn!("Remote node delete of {} returned {}", key, response.status());
            Err(DriveError::BackendUnavailable(format!("remote node delete returned {}", response.status())))
        }
    }
}
