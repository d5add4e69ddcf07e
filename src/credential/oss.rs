//! Aliyun OSS: signed form POST with an upload callback, callbacks signed
//! with the provider's RSA key (MD5withRSA).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use percent_encoding::percent_decode_str;
use reqwest::StatusCode;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::signing::{b64, b64_decode, hmac_sha1, uri_encode_path};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};

/// Public keys are only ever fetched from Aliyun's own host.
const TRUSTED_KEY_HOSTS: [&str; 2] = ["http://gosspublic.alicdn.com/", "https://gosspublic.alicdn.com/"];
const PUB_KEY_HEADER: &str = "x-oss-pub-key-url";

/// ASN.1 DigestInfo prefix for an MD5 hash.
const MD5_DIGEST_INFO: [u8; 18] = [
    0x30, 0x20, 0x30, 0x0c, 0x06, 0x08, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x02, 0x05, 0x05, 0x00, 0x04, 0x10,
];

/// Source of the PEM public keys OSS names in its callbacks.
#[async_trait]
pub trait PublicKeyFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> DriveResult<String>;
}

/// Downloads keys over HTTP and keeps them for the life of the process.
pub struct HttpKeyFetcher {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, String>>,
}

impl HttpKeyFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http, cache: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl PublicKeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, url: &str) -> DriveResult<String> {
        if let Some(pem) = self.cache.lock().map_err(|_| DriveError::Storage("key cache poisoned".to_string()))?.get(url) {
            return Ok(pem.clone());
        }
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DriveError::BackendUnavailable(format!("public key fetch returned {}", response.status())));
        }
        let pem = response.text().await?;
        debug!("Fetched OSS public key from {}", url);
        self.cache
            .lock()
            .map_err(|_| DriveError::Storage("key cache poisoned".to_string()))?
            .insert(url.to_string(), pem.clone());
        Ok(pem)
    }
}

/// Serves one fixed key regardless of URL.
pub struct StaticKeyFetcher {
    pem: String,
}

impl StaticKeyFetcher {
    pub fn new(pem: impl Into<String>) -> Self {
        Self { pem: pem.into() }
    }
}

#[async_trait]
impl PublicKeyFetcher for StaticKeyFetcher {
    async fn fetch(&self, _url: &str) -> DriveResult<String> {
        Ok(self.pem.clone())
    }
}

/// DigestInfo-wrapped MD5 of what OSS signs: the decoded path, the query
/// string if any, a newline, then the body.
pub fn callback_digest(request: &CallbackRequest) -> Vec<u8> {
    let mut data = percent_decode_str(&request.path).decode_utf8_lossy().into_owned().into_bytes();
    if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
        data.push(b'?');
        data.extend_from_slice(query.as_bytes());
    }
    data.push(b'\n');
    data.extend_from_slice(&request.body);

    let mut digest = MD5_DIGEST_INFO.to_vec();
    digest.extend_from_slice(&md5::compute(&data).0);
    digest
}

fn bucket_base(policy: &StoragePolicy) -> DriveResult<String> {
    let endpoint = url::Url::parse(&policy.endpoint)
        .map_err(|e| DriveError::BackendUnavailable(format!("bad oss endpoint '{}': {}", policy.endpoint, e)))?;
    let host = endpoint
        .host_str()
        .ok_or_else(|| DriveError::BackendUnavailable(format!("oss endpoint '{}' has no host", policy.endpoint)))?;
    Ok(format!("{}://{}.{}", endpoint.scheme(), policy.bucket, host))
}

fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Deserialize)]
struct OssCallbackBody {
    key: String,
    size: u64,
    #[serde(default)]
    etag: Option<String>,
}

pub struct OssDriver {
    http: reqwest::Client,
    keys: Arc<dyn PublicKeyFetcher>,
}

impl OssDriver {
    pub fn new(http: reqwest::Client, keys: Arc<dyn PublicKeyFetcher>) -> Self {
        Self { http, keys }
    }
}

#[async_trait]
impl BackendDriver for OssDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Oss
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let document = json!({
            "expiration": target.expires_at.format("%Y-%m-%dT%H:%M:%S.000Z").to_string(),
            "conditions": [
                { "bucket": policy.bucket },
                ["content-length-range", 0, target.declared_size],
                ["eq", "$key", target.backend_key],
            ],
        });
        let encoded_policy = b64(document.to_string().as_bytes());
        let signature = b64(&hmac_sha1(policy.secret.as_bytes(), encoded_policy.as_bytes())?);
        let callback = json!({
            "callbackUrl": target.callback_url,
            "callbackBody": "{\"key\":\"${object}\",\"size\":${size},\"etag\":\"${etag}\"}",
            "callbackBodyType": "application/json",
        });

        let mut fields = BTreeMap::new();
        fields.insert("OSSAccessKeyId".to_string(), policy.access_key.clone());
        fields.insert("policy".to_string(), encoded_policy);
        fields.insert("Signature".to_string(), signature);
        fields.insert("key".to_string(), target.backend_key.clone());
        fields.insert("callback".to_string(), b64(callback.to_string().as_bytes()));
        fields.insert("success_action_status".to_string(), "200".to_string());
        Ok(IssuedCredential::new(ProviderCredential::FormPost { url: bucket_base(policy)?, fields }))
    }

    async fn verify_callback(
        &self,
        _policy: &StoragePolicy,
        _pending: &PendingUpload,
        request: &CallbackRequest,
    ) -> DriveResult<CompletionReport> {
        let signature = request
            .header("authorization")
            .and_then(b64_decode)
            .ok_or_else(|| DriveError::SignatureInvalid("missing OSS callback signature".to_string()))?;
        let key_url = request
            .header(PUB_KEY_HEADER)
            .and_then(b64_decode)
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| DriveError::SignatureInvalid("missing public key url".to_string()))?;
        if !TRUSTED_KEY_HOSTS.iter().any(|prefix| key_url.starts_with(prefix)) {
            return Err(DriveError::SignatureInvalid(format!("untrusted public key url {}", key_url)));
        }

        let pem = self.keys.fetch(&key_url).await?;
        let public_key = RsaPublicKey::from_public_key_pem(pem.trim())
            .map_err(|e| DriveError::SignatureInvalid(format!("unusable public key: {}", e)))?;
        public_key
            .verify(Pkcs1v15Sign::new_unprefixed(), &callback_digest(request), &signature)
            .map_err(|_| DriveError::SignatureInvalid("OSS signature mismatch".to_string()))?;

        let body: OssCallbackBody = serde_json::from_slice(&request.body)
            .map_err(|e| DriveError::InvalidRequest(format!("malformed OSS callback body: {}", e)))?;
        Ok(CompletionReport {
            key: body.key,
            size: body.size,
            content_hash: body.etag.map(|etag| etag.trim_matches('"').to_lowercase()),
        })
    }

    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        let date = http_date(Utc::now());
        let to_sign = format!("DELETE\n\n\n{}\n/{}/{}", date, policy.bucket, key);
        let signature = b64(&hmac_sha1(policy.secret.as_bytes(), to_sign.as_bytes())?);
        let response = self
            .http
            .delete(format!("{}/{}", bucket_base(policy)?, uri_encode_path(key)))
            .header("Date", date)
            .header("Authorization", format!("OSS {}:{}", policy.access_key, signature))
            .send()
            .await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            warn!("OSS delete of {} returned {}", key, response.status());
            Err(DriveError::BackendUnavailable(format!("oss delete returned {}", response.status())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Duration;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    fn policy() -> StoragePolicy {
        let mut policy = StoragePolicy::local(3, "oss");
        policy.kind = BackendKind::Oss;
        policy.endpoint = "https://oss-cn-hangzhou.aliyuncs.com".into();
        policy.bucket = "media".into();
        policy.access_key = "ak".into();
        policy.secret = "sk".into();
        policy
    }

    fn pending() -> PendingUpload {
        let now = Utc::now();
        PendingUpload {
            session_id: "s1".into(),
            owner_id: 1,
            target_parent_id: 1,
            target_name: "a.txt".into(),
            policy_id: 3,
            backend_key: "1/a.txt".into(),
            reserved_bytes: 5,
            chunk_total: None,
            remote_session_url: None,
            status: crate::ingest::state::UploadStatus::AwaitingCallback,
            issued_at: now,
            expires_at: now + Duration::hours(1),
            updated_at: now,
            committed_file_id: None,
        }
    }

    fn signed_request(private: &RsaPrivateKey, body: &'static [u8]) -> CallbackRequest {
        let request = CallbackRequest::new("/callback/oss/3/s1", None, Bytes::from_static(body))
            .with_header(PUB_KEY_HEADER, &b64(b"https://gosspublic.alicdn.com/callback_pub_key_v1.pem"));
        let signature = private.sign(Pkcs1v15Sign::new_unprefixed(), &callback_digest(&request)).unwrap();
        request.with_header("authorization", &b64(&signature))
    }

    #[tokio::test]
    async fn test_rsa_callback_verification() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = private.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
        let driver = OssDriver::new(reqwest::Client::new(), Arc::new(StaticKeyFetcher::new(pem)));

        let request = signed_request(&private, br#"{"key":"1/a.txt","size":5,"etag":"\"ABC\""}"#);
        let report = driver.verify_callback(&policy(), &pending(), &request).await.unwrap();
        assert_eq!(report.key, "1/a.txt");
        assert_eq!(report.size, 5);
        assert_eq!(report.content_hash.as_deref(), Some("abc"));

        // Same signature, different body.
        let mut tampered = request.clone();
        tampered.body = Bytes::from_static(br#"{"key":"1/a.txt","size":1,"etag":"\"ABC\""}"#);
        assert!(matches!(
            driver.verify_callback(&policy(), &pending(), &tampered).await,
            Err(DriveError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_untrusted_key_url_is_rejected() {
        let driver = OssDriver::new(reqwest::Client::new(), Arc::new(StaticKeyFetcher::new("unused")));
        let request = CallbackRequest::new("/callback/oss/3/s1", None, Bytes::new())
            .with_header("authorization", &b64(b"sig"))
            .with_header(PUB_KEY_HEADER, &b64(b"https://evil.example/key.pem"));
        assert!(matches!(
            driver.verify_callback(&policy(), &pending(), &request).await,
            Err(DriveError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_form_post_targets_bucket_host() {
        assert_eq!(bucket_base(&policy()).unwrap(), "https://media.oss-cn-hangzhou.aliyuncs.com");
    }
}
