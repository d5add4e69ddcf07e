//! Turns an upload request into a pending upload plus the credential the
//! client uses to move its bytes.

use chrono::{Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::credential::{DriverSet, ProviderCredential, UploadTarget};
use crate::error::{DriveError, DriveResult};
use crate::ingest::state::{UploadEvent, UploadStatus};
use crate::metadata::{FileRecord, MetadataStorage, PendingUpload, UserId};
use crate::policy::StoragePolicy;
use crate::quota::QuotaLedger;
use crate::tree::path::validate_name;

/// What the client receives for a successful upload request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedUpload {
    #[serde(skip)]
    pub pending: PendingUpload,
    pub session_id: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub credential: ProviderCredential,
}

pub struct CredentialIssuer {
    store: Arc<dyn MetadataStorage>,
    quota: Arc<QuotaLedger>,
    drivers: Arc<DriverSet>,
    public_base_url: String,
}

impl CredentialIssuer {
    pub fn new(
        store: Arc<dyn MetadataStorage>,
        quota: Arc<QuotaLedger>,
        drivers: Arc<DriverSet>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            quota,
            drivers,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn callback_url(&self, policy: &StoragePolicy, session_id: &str) -> String {
        format!("{}/callback/{}/{}/{}", self.public_base_url, policy.kind, policy.id, session_id)
    }

    /// Validate, reserve quota, open the pending upload and mint the
    /// credential. Anything that fails after the reservation gives it back.
    pub async fn issue(
        &self,
        user_id: UserId,
        policy: Arc<StoragePolicy>,
        parent: &FileRecord,
        name: &str,
        declared_size: u64,
    ) -> DriveResult<IssuedUpload> {
        if !self.quota.policy_allowed(user_id, policy.id)? {
            return Err(DriveError::PolicyNotFound(policy.id));
        }
        if !parent.is_dir() || parent.owner_id != user_id {
            return Err(DriveError::NotFound(format!("directory {}", parent.id)));
        }
        policy.check_size(declared_size)?;
        validate_name(name)?;
        policy.naming.check(name)?;
        let driver = self.drivers.get(policy.kind)?;

        let now = Utc::now();
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let expires_at = now + Duration::seconds(policy.upload_window_secs as i64);
        let backend_key = policy.render_key(user_id, &session_id, name, now);

        self.quota.reserve(user_id, &session_id, declared_size, now)?;

        let mut pending = PendingUpload {
            session_id: session_id.clone(),
            owner_id: user_id,
            target_parent_id: parent.id,
            target_name: name.to_string(),
            policy_id: policy.id,
            backend_key: backend_key.clone(),
            reserved_bytes: declared_size,
            chunk_total: None,
            remote_session_url: None,
            status: UploadStatus::Issued,
            issued_at: now,
            expires_at,
            updated_at: now,
            committed_file_id: None,
        };
        if let Err(e) = self.store.open_pending(&pending) {
            self.quota.release(&session_id)?;
            return Err(e);
        }

        let target = UploadTarget {
            session_id: session_id.clone(),
            backend_key,
            file_name: name.to_string(),
            declared_size,
            expires_at,
            callback_url: self.callback_url(&policy, &session_id),
            public_base_url: self.public_base_url.clone(),
        };
        let issued = match driver.issue_credential(&policy, &target).await {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Driver {} failed to issue credentials for {}: {}", policy.kind, session_id, e);
                self.store.abort_pending(&session_id, Utc::now())?;
                return Err(e);
            }
        };

        if !policy.kind.is_local() {
            let next = pending.status.apply(UploadEvent::CredentialsIssued)?;
            if !self.store.transition_pending(&session_id, pending.status, next, now)? {
                // Someone aborted the row while the provider was being asked.
                warn!("Session {} left {} before its credentials were handed out", session_id, pending.status);
                pending.remote_session_url = issued.remote_session_url.clone();
                if let Err(e) = driver.cancel_session(&policy, &pending).await {
                    warn!("Could not cancel provider session for {}: {}", session_id, e);
                }
                self.store.abort_pending(&session_id, Utc::now())?;
                return Err(DriveError::SessionNotFound(session_id));
            }
            pending.status = next;
        }
        if let Some(url) = &issued.remote_session_url {
            self.store.attach_remote_session(&session_id, url)?;
            pending.remote_session_url = Some(url.clone());
        }

        info!(
            "Issued {} upload {} for user {}: '{}' ({} bytes)",
            policy.kind, session_id, user_id, name, declared_size
        );
        Ok(IssuedUpload {
            session_id,
            expires_at,
            credential: issued.credential,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackRequest, CompletionReport};
    use crate::credential::local::LocalDriver;
    use crate::credential::qiniu::QiniuDriver;
    use crate::credential::{BackendDriver, IssuedCredential};
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::metadata::Group;
    use crate::policy::BackendKind;
    use crate::storage::mock_store::MockObjectStore;

    struct Fixture {
        store: Arc<dyn MetadataStorage>,
        issuer: CredentialIssuer,
        root: FileRecord,
    }

    fn fixture(quota: u64) -> Fixture {
        let store: Arc<dyn MetadataStorage> = Arc::new(MockMetadataStore::new());
        let ledger = Arc::new(QuotaLedger::new(store.clone(), 1));
        ledger
            .set_group(&Group { id: 1, name: "default".into(), max_storage: quota, policy_ids: vec![1, 2] })
            .unwrap();
        ledger.ensure_user(7).unwrap();
        let drivers = DriverSet::new()
            .with(Arc::new(LocalDriver::new(Arc::new(MockObjectStore::new()))))
            .with(Arc::new(QiniuDriver::new(reqwest::Client::new())));
        let issuer = CredentialIssuer::new(store.clone(), ledger, Arc::new(drivers), "http://drive.test/");
        let root = store.root_dir(7).unwrap();
        Fixture { store, issuer, root }
    }

    fn qiniu_policy() -> Arc<StoragePolicy> {
        let mut policy = StoragePolicy::local(2, "kodo");
        policy.kind = BackendKind::Qiniu;
        policy.bucket = "b".into();
        policy.access_key = "ak".into();
        policy.secret = "sk".into();
        Arc::new(policy)
    }

    #[tokio::test]
    async fn test_local_issue_stays_issued() {
        let f = fixture(100);
        let issued = f
            .issuer
            .issue(7, Arc::new(StoragePolicy::local(1, "local")), &f.root, "a.txt", 10)
            .await
            .unwrap();
        assert_eq!(issued.pending.status, UploadStatus::Issued);
        assert!(matches!(issued.credential, ProviderCredential::LocalChunk { .. }));
        assert_eq!(f.store.quota_usage(7).unwrap().reserved, 10);
    }

    #[tokio::test]
    async fn test_remote_issue_awaits_callback() {
        let f = fixture(100);
        let issued = f.issuer.issue(7, qiniu_policy(), &f.root, "a.txt", 10).await.unwrap();
        let stored = f.store.get_pending(&issued.session_id).unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::AwaitingCallback);
        assert_eq!(
            f.issuer.callback_url(&qiniu_policy(), &issued.session_id),
            format!("http://drive.test/callback/qiniu/2/{}", issued.session_id)
        );
    }

    /// Qiniu driver whose issuance races with an abort of the session.
    struct AbortingDriver {
        store: Arc<dyn MetadataStorage>,
        inner: QiniuDriver,
    }

    #[async_trait::async_trait]
    impl BackendDriver for AbortingDriver {
        fn kind(&self) -> BackendKind {
            BackendKind::Qiniu
        }

        async fn issue_credential(&self, policy: &StoragePolicy, target: &UploadTarget) -> DriveResult<IssuedCredential> {
            let issued = self.inner.issue_credential(policy, target).await?;
            self.store.abort_pending(&target.session_id, Utc::now())?;
            Ok(issued)
        }

        async fn verify_callback(
            &self,
            policy: &StoragePolicy,
            pending: &PendingUpload,
            request: &CallbackRequest,
        ) -> DriveResult<CompletionReport> {
            self.inner.verify_callback(policy, pending, request).await
        }

        async fn delete_object(&self, _policy: &StoragePolicy, _key: &str) -> DriveResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_aborted_during_issue_is_not_handed_out() {
        let f = fixture(100);
        let ledger = Arc::new(QuotaLedger::new(f.store.clone(), 1));
        let driver = AbortingDriver { store: f.store.clone(), inner: QiniuDriver::new(reqwest::Client::new()) };
        let issuer = CredentialIssuer::new(
            f.store.clone(),
            ledger,
            Arc::new(DriverSet::new().with(Arc::new(driver))),
            "http://drive.test",
        );

        let err = issuer.issue(7, qiniu_policy(), &f.root, "a.txt", 10).await.unwrap_err();
        assert!(matches!(err, DriveError::SessionNotFound(_)));
        assert_eq!(f.store.quota_usage(7).unwrap().reserved, 0);

        // Nothing live holds the slot.
        f.issuer.issue(7, qiniu_policy(), &f.root, "a.txt", 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejections_leave_nothing_reserved() {
        let f = fixture(100);
        let local = Arc::new(StoragePolicy::local(1, "local"));

        let err = f.issuer.issue(7, local.clone(), &f.root, "big.bin", 101).await.unwrap_err();
        assert!(matches!(err, DriveError::QuotaExceeded { required: 101, available: 100 }));

        let err = f.issuer.issue(7, local.clone(), &f.root, "a/b", 1).await.unwrap_err();
        assert!(matches!(err, DriveError::NamingRejected(_)));

        let err = f.issuer.issue(7, Arc::new(StoragePolicy::local(9, "other")), &f.root, "a.txt", 1).await.unwrap_err();
        assert!(matches!(err, DriveError::PolicyNotFound(9)));

        // A second live session for the same slot.
        f.issuer.issue(7, local.clone(), &f.root, "a.txt", 10).await.unwrap();
        let err = f.issuer.issue(7, local, &f.root, "a.txt", 10).await.unwrap_err();
        assert!(matches!(err, DriveError::Conflict(_)));

        assert_eq!(f.store.quota_usage(7).unwrap().reserved, 10);
    }
}
