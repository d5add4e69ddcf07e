//! OneDrive: resumable upload sessions opened through Microsoft Graph.
//! Completion is confirmed by looking the item up, not by a signature.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::s3::TOKEN_HEADER;
use crate::credential::signing::{callback_token, uri_encode_path, verify_callback_token};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};

const GRAPH_DRIVE: &str = "https://graph.microsoft.com/v1.0/me/drive";

/// The slice of the Graph drive API the driver needs.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Open an upload session for `path` and return its upload URL.
    async fn create_upload_session(&self, policy: &StoragePolicy, path: &str) -> DriveResult<String>;

    /// Size of the item at `path`, `None` if it does not exist.
    async fn item_size(&self, policy: &StoragePolicy, path: &str) -> DriveResult<Option<u64>>;

    async fn delete_item(&self, policy: &StoragePolicy, path: &str) -> DriveResult<()>;

    async fn cancel_upload_session(&self, policy: &StoragePolicy, upload_url: &str) -> DriveResult<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
}

#[derive(Deserialize)]
struct DriveItem {
    size: u64,
}

/// Microsoft Graph over HTTP. The policy's access key is the bearer token.
pub struct GraphDrive {
    http: reqwest::Client,
}

impl GraphDrive {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn item_url(policy: &StoragePolicy, path: &str) -> String {
        let base = if policy.endpoint.is_empty() { GRAPH_DRIVE } else { policy.endpoint.trim_end_matches('/') };
        format!("{}/root:/{}", base, uri_encode_path(path))
    }
}

#[async_trait]
impl RemoteDrive for GraphDrive {
    async fn create_upload_session(&self, policy: &StoragePolicy, path: &str) -> DriveResult<String> {
        let response = self
            .http
            .post(format!("{}:/createUploadSession", Self::item_url(policy, path)))
            .bearer_auth(&policy.access_key)
            .json(&json!({ "item": { "@microsoft.graph.conflictBehavior": "fail" } }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DriveError::BackendUnavailable(format!("createUploadSession returned {}", response.status())));
        }
        Ok(response.json::<UploadSessionResponse>().await?.upload_url)
    }

    async fn item_size(&self, policy: &StoragePolicy, path: &str) -> DriveResult<Option<u64>> {
        let response = self.http.get(Self::item_url(policy, path)).bearer_auth(&policy.access_key).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<DriveItem>().await?.size)),
            status => Err(DriveError::BackendUnavailable(format!("drive item lookup returned {}", status))),
        }
    }

    async fn delete_item(&self, policy: &StoragePolicy, path: &str) -> DriveResult<()> {
        let response = self.http.delete(Self::item_url(policy, path)).bearer_auth(&policy.access_key).send().await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(DriveError::BackendUnavailable(format!("drive item delete returned {}", response.status())))
        }
    }

    async fn cancel_upload_session(&self, _policy: &StoragePolicy, upload_url: &str) -> DriveResult<()> {
        // Upload URLs are pre-authorized; no bearer token.
        let response = self.http.delete(upload_url).send().await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(DriveError::BackendUnavailable(format!("upload session cancel returned {}", response.status())));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockDriveState {
    items: HashMap<String, u64>,
    sessions: Vec<String>,
    cancelled: Vec<String>,
}

/// In-memory drive for tests.
#[derive(Default)]
pub struct MockRemoteDrive {
    state: Mutex<MockDriveState>,
}

impl MockRemoteDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DriveResult<std::sync::MutexGuard<'_, MockDriveState>> {
        self.state.lock().map_err(|_| DriveError::Storage("mock drive lock poisoned".to_string()))
    }

    /// Pretend the client finished uploading `size` bytes to `path`.
    pub fn put_item(&self, path: &str, size: u64) {
        if let Ok(mut state) = self.lock() {
            state.items.insert(path.to_string(), size);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().map(|state| state.items.contains_key(path)).unwrap_or(false)
    }

    pub fn cancelled_sessions(&self) -> Vec<String> {
        self.lock().map(|state| state.cancelled.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl RemoteDrive for MockRemoteDrive {
    async fn create_upload_session(&self, _policy: &StoragePolicy, path: &str) -> DriveResult<String> {
        let mut state = self.lock()?;
        let url = format!("https://upload.mock/{}/{}", state.sessions.len(), path);
        state.sessions.push(url.clone());
        Ok(url)
    }

    async fn item_size(&self, _policy: &StoragePolicy, path: &str) -> DriveResult<Option<u64>> {
        Ok(self.lock()?.items.get(path).copied())
    }

    async fn delete_item(&self, _policy: &StoragePolicy, path: &str) -> DriveResult<()> {
        self.lock()?.items.remove(path);
        Ok(())
    }

    async fn cancel_upload_session(&self, _policy: &StoragePolicy, upload_url: &str) -> DriveResult<()> {
        self.lock()?.cancelled.push(upload_url.to_string());
        Ok(())
    }
}

pub struct OneDriveDriver {
    drive: Arc<dyn RemoteDrive>,
}

impl OneDriveDriver {
    pub fn new(drive: Arc<dyn RemoteDrive>) -> Self {
        Self { drive }
    }
}

#[async_trait]
impl BackendDriver for OneDriveDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::OneDrive
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let upload_url = self.drive.create_upload_session(policy, &target.backend_key).await?;
        debug!("Opened OneDrive upload session for {}", target.backend_key);
        Ok(IssuedCredential {
            credential: ProviderCredential::Session {
                upload_url: upload_url.clone(),
                callback_token: callback_token(&policy.secret, &target.session_id)?,
            },
            remote_session_url: Some(upload_url),
        })
    }

    async fn verify_callback(
        &self,
        policy: &StoragePolicy,
        pending: &PendingUpload,
        request: &CallbackRequest,
    ) -> DriveResult<CompletionReport> {
        let token = request
            .header(TOKEN_HEADER)
            .ok_or_else(|| DriveError::SignatureInvalid("missing callback token".to_string()))?;
        if !verify_callback_token(&policy.secret, &pending.session_id, token)? {
            return Err(DriveError::SignatureInvalid("callback token mismatch".to_string()));
        }
        let size = self
            .drive
            .item_size(policy, &pending.backend_key)
            .await?
            .ok_or_else(|| DriveError::NotFound(format!("drive item {} was never uploaded", pending.backend_key)))?;
        Ok(CompletionReport { key: pending.backend_key.clone(), size, content_hash: None })
    }

    async fn cancel_session(&self, policy: &StoragePolicy, pending: &PendingUpload) -> DriveResult<()> {
        match &pending.remote_session_url {
            Some(url) => self.drive.cancel_upload_session(policy, url).await,
            None => Ok(()),
        }
    }

    async fn delete_object(&self, policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        self.drive.delete_item(policy, key).await.map_err(|e| {
            warn!("OneDrive delete of {} failed: {}", key, e);
            e
        })
    }
}
