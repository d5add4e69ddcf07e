use async_trait::async_trait;
use std::sync::Arc;

use crate::callback::{CallbackRequest, CompletionReport};
use crate::credential::{BackendDriver, IssuedCredential, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::metadata::PendingUpload;
use crate::policy::{BackendKind, StoragePolicy};
use crate::storage::ObjectStore;

/// Bytes flow through this server in chunks and land in the object store.
pub struct LocalDriver {
    objects: Arc<dyn ObjectStore>,
}

impl LocalDriver {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }
}

#[async_trait]
impl BackendDriver for LocalDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
        let base = target.public_base_url.trim_end_matches('/');
        Ok(IssuedCredential::new(ProviderCredential::LocalChunk {
            session_id: target.session_id.clone(),
            chunk_size: policy.chunk_size,
            chunk_url: format!("{}/upload/chunk/{}", base, target.session_id),
            finalize_url: format!("{}/upload/finalize/{}", base, target.session_id),
        }))
    }

    async fn verify_callback(
        &self,
        _policy: &StoragePolicy,
        _pending: &PendingUpload,
        _request: &CallbackRequest,
    ) -> DriveResult<CompletionReport> {
        Err(DriveError::SignatureInvalid("local uploads complete through finalize".to_string()))
    }

    async fn delete_object(&self, _policy: &StoragePolicy, key: &str) -> DriveResult<()> {
        self.objects.delete(key).await
    }
}
