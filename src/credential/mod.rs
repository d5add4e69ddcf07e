//! Upload credentials and the per-backend drivers that mint and verify them.
//!
//! Every backend kind has exactly one `BackendDriver`. Drivers are pure
//! protocol adapters: they sign credentials, authenticate completion
//! callbacks and talk to the provider for cleanup. Session bookkeeping stays
//! in the issuer and the coordinator.

pub mod issuer;
pub mod signing;
pub mod local;
pub mod s3;
pub mod oss;
pub mod qiniu;
pub mod upyun;
pub mod onedrive;
pub mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::callback::{CallbackRequest, CompletionReport};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};
use crate::tree::FileView;

/// What the client needs to move bytes to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProviderCredential {
    /// Chunks go through this server.
    LocalChunk {
        session_id: String,
        chunk_size: u64,
        /// Chunks go to `{chunk_url}/{index}?total=N`.
        chunk_url: String,
        finalize_url: String,
    },
    /// Multipart form POST straight to the provider.
    FormPost {
        url: String,
        fields: BTreeMap<String, String>,
    },
    /// Pre-signed request straight to the provider.
    SignedUrl {
        url: String,
        method: String,
        headers: BTreeMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        callback_token: Option<String>,
    },
    /// Resumable upload session opened on the provider.
    Session {
        upload_url: String,
        callback_token: String,
    },
}

/// Everything a driver needs to know about the upload it is authorizing.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub session_id: String,
    pub backend_key: String,
    pub file_name: String,
    pub declared_size: u64,
    pub expires_at: DateTime<Utc>,
    /// Absolute URL the provider calls when the upload completes.
    pub callback_url: String,
    /// Base URL of this server, for endpoints the client calls directly.
    pub public_base_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCredential {
    pub credential: ProviderCredential,
    /// Provider-side session to cancel if the upload is abandoned.
    pub remote_session_url: Option<String>,
}

impl IssuedCredential {
    pub fn new(credential: ProviderCredential) -> Self {
        Self { credential, remote_session_url: None }
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential>;

    /// Authenticate a completion callback and extract what the provider
    /// reports. Must not touch any state.
    async fn verify_callback(
        &self,
        policy: &StoragePolicy,
        pending: &PendingUpload,
        request: &CallbackRequest,
    ) -> DriveResult<CompletionReport>;

    /// Best-effort cancellation of a provider-side upload session.
    async fn cancel_session(&self, _policy: &StoragePolicy, _pending: &PendingUpload) -> DriveResult<()> {
        Ok(())
    }

    /// Remove stored bytes. Deleting a missing object succeeds.
    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()>;

    /// Response body returned to the provider after a successful commit.
    fn callback_ack(&self, file: &FileView) -> serde_json::Value {
        serde_json::json!({ "code": 0, "data": file })
    }
}

/// One driver per backend kind.
#[derive(Default)]
pub struct DriverSet {
    drivers: HashMap<BackendKind, Arc<dyn BackendDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.register(driver);
        self
    }

    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn get(&self, kind: BackendKind) -> DriveResult<Arc<dyn BackendDriver>> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DriveError::BackendUnavailable(format!("no driver registered for {}", kind)))
    }

    /// All drivers wired for production use.
    pub fn standard(
        objects: Arc<dyn crate::storage::ObjectStore>,
        http: reqwest::Client,
        key_fetcher: Arc<dyn oss::PublicKeyFetcher>,
        drive: Arc<dyn onedrive::RemoteDrive>,
    ) -> Self {
        DriverSet::new()
            .with(Arc::new(local::LocalDriver::new(objects)))
            .with(Arc::new(s3::S3Driver::new(http.clone())))
            .with(Arc::new(oss::OssDriver::new(http.clone(), key_fetcher)))
            .with(Arc::new(qiniu::QiniuDriver::new(http.clone())))
            .with(Arc::new(upyun::UpyunDriver::new(http.clone())))
            .with(Arc::new(onedrive::OneDriveDriver::new(drive)))
            .with(Arc::new(remote::RemoteDriver::new(http)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_serialization() {
        let credential = ProviderCredential::LocalChunk {
            session_id: "abc".into(),
            chunk_size: 8,
            chunk_url: "http://h/upload/chunk/abc".into(),
            finalize_url: "http://h/upload/finalize/abc".into(),
        };
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["type"], "local_chunk");
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["chunkSize"], 8);
    }

    #[test]
    fn test_unregistered_driver() {
        let drivers = DriverSet::new();
        assert!(matches!(drivers.get(BackendKind::S3), Err(DriveError::BackendUnavailable(_))));
    }
}
