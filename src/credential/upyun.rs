//! UPYUN USS: form API uploads and `UPYUN` signed notify callbacks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::StatusCode;
use serde_json::json;
use std::collections::BTreeMap;

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::signing::{b64, b64_decode, hmac_sha1, md5_hex, uri_encode_path, verify_hmac_sha1};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};

const DEFAULT_API_HOST: &str = "https://v0.api.upyun.com";

pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `UPYUN operator:sign` where sign is HMAC-SHA1 keyed with md5(secret)
/// over the `&`-joined non-empty parts.
pub fn authorization(policy: &StoragePolicy, parts: &[&str]) -> DriveResult<String> {
    let data = parts.iter().filter(|p| !p.is_empty()).copied().collect::<Vec<_>>().join("&");
    let key = md5_hex(policy.secret.as_bytes());
    let sign = b64(&hmac_sha1(key.as_bytes(), data.as_bytes())?);
    Ok(format!("UPYUN {}:{}", policy.access_key, sign))
}

fn api_host(policy: &StoragePolicy) -> &str {
    if policy.endpoint.is_empty() {
        DEFAULT_API_HOST
    } else {
        policy.endpoint.trim_end_matches('/')
    }
}

pub struct UpyunDriver {
    http: reqwest::Client,
}

impl UpyunDriver {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BackendDriver for UpyunDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Upyun
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let date = http_date(Utc::now());
        let document = json!({
            "bucket": policy.bucket,
            "save-key": format!("/{}", target.backend_key),
            "expiration": target.expires_at.timestamp(),
            "date": date,
            "content-length-range": format!("0,{}", target.declared_size),
            "notify-url": target.callback_url,
        });
        let encoded = b64(document.to_string().as_bytes());
        let uri = format!("/{}", policy.bucket);

        let mut fields = BTreeMap::new();
        fields.insert("authorization".to_string(), authorization(policy, &["POST", &uri, &date, &encoded])?);
        fields.insert("policy".to_string(), encoded);
        Ok(IssuedCredential::new(ProviderCredential::FormPost {
            url: format!("{}{}", api_host(policy), uri),
            fields,
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
            .and_then(|value| value.strip_prefix("UPYUN "))
            .ok_or_else(|| DriveError::SignatureInvalid("missing UPYUN authorization".to_string()))?;
        let (operator, sign) = credentials
            .split_once(':')
            .ok_or_else(|| DriveError::SignatureInvalid("malformed UPYUN authorization".to_string()))?;
        if operator != policy.access_key {
            return Err(DriveError::SignatureInvalid("unknown operator".to_string()));
        }

        let date = request.header("date").unwrap_or_default();
        let content_md5 = request
            .header("content-md5")
            .ok_or_else(|| DriveError::SignatureInvalid("missing Content-MD5".to_string()))?;
        if !content_md5.eq_ignore_ascii_case(&md5_hex(&request.body)) {
            return Err(DriveError::SignatureInvalid("Content-MD5 does not match body".to_string()));
        }

        let expected = b64_decode(sign).ok_or_else(|| DriveError::SignatureInvalid("signature is not base64".to_string()))?;
        let path = request.path_and_query();
        let data = ["POST", path.as_str(), date, content_md5]
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("&");
        let key = md5_hex(policy.secret.as_bytes());
        if !verify_hmac_sha1(key.as_bytes(), data.as_bytes(), &expected)? {
            return Err(DriveError::SignatureInvalid("UPYUN signature mismatch".to_string()));
        }

        let form = request.form();
        if form.get("code").map(String::as_str) != Some("200") {
            return Err(DriveError::InvalidRequest(format!(
                "upload reported failure: {}",
                form.get("message").cloned().unwrap_or_default()
            )));
        }
        let key = form
            .get("url")
            .map(|url| url.trim_start_matches('/').to_string())
            .ok_or_else(|| DriveError::InvalidRequest("notify body has no url".to_string()))?;
        let size = form
            .get("file_size")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| DriveError::InvalidRequest("notify body has no file_size".to_string()))?;
        Ok(CompletionReport { key, size, content_hash: None })
    }

    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        let date = http_date(Utc::now());
        let uri = format!("/{}/{}", policy.bucket, uri_encode_path(key));
        let response = self
            .http
            .delete(format!("{}{}", api_host(policy), uri))
            .header("Date", &date)
            .header("Authorization", authorization(policy, &["DELETE", &uri, &date])?)
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            warn!("UPYUN delete of {} returned {}", key, response.status());
            Err(DriveError::BackendUnavailable(format!("upyun delete returned {}", response.status())))
        }
    }
}
