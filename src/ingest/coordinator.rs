//! Drives an upload session from credential issuance to a committed file.
//!
//! All work on one session is serialized through a per-session async lock,
//! so a chunk, a finalize, a callback, a cancel and the sweeper never act on
//! the same session at once. The store's compare-and-set transitions guard
//! against anything that slips past the lock.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

use crate::callback::{CallbackRequest, CallbackVerifier, Verification};
use crate::chunk::{ChunkAck, ChunkAssembler};
use crate::credential::issuer::{CredentialIssuer, IssuedUpload};
use crate::credential::DriverSet;
use crate::error::{DriveError, DriveResult};
use crate::ingest::state::{UploadEvent, UploadStatus};
use crate::metadata::{AbortOutcome, CommitOutcome, CommitRequest, FileId, FileRecord, MetadataStorage, PendingUpload, UserId};
use crate::policy::registry::PolicyRegistry;
use crate::policy::{PolicyId, StoragePolicy};
use crate::quota::QuotaLedger;
use crate::storage::ObjectStore;
use crate::tree::{FileView, VirtualTree};

#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> DriveResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .map_err(|_| DriveError::Storage("session lock table poisoned".to_string()))?;
            // Drop locks nobody holds or waits for.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id.to_string()).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}

pub struct IngestionCoordinator {
    store: Arc<dyn MetadataStorage>,
    registry: Arc<PolicyRegistry>,
    tree: Arc<VirtualTree>,
    quota: Arc<QuotaLedger>,
    issuer: CredentialIssuer,
    verifier: CallbackVerifier,
    assembler: Arc<ChunkAssembler>,
    objects: Arc<dyn ObjectStore>,
    drivers: Arc<DriverSet>,
    locks: SessionLocks,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStorage>,
        registry: Arc<PolicyRegistry>,
        quota: Arc<QuotaLedger>,
        drivers: Arc<DriverSet>,
        objects: Arc<dyn ObjectStore>,
        assembler: Arc<ChunkAssembler>,
        public_base_url: &str,
    ) -> Self {
        Self {
            tree: Arc::new(VirtualTree::new(store.clone())),
            issuer: CredentialIssuer::new(store.clone(), quota.clone(), drivers.clone(), public_base_url),
            verifier: CallbackVerifier::new(store.clone(), registry.clone(), drivers.clone()),
            store,
            registry,
            quota,
            assembler,
            objects,
            drivers,
            locks: SessionLocks::default(),
        }
    }

    pub fn tree(&self) -> &VirtualTree {
        &self.tree
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Authorize an upload of `declared_size` bytes to `path`.
    pub async fn issue(&self, user_id: UserId, policy_id: PolicyId, path: &str, declared_size: u64) -> DriveResult<IssuedUpload> {
        let policy = self.registry.resolve(policy_id)?;
        self.quota.ensure_user(user_id)?;
        let (parent, name) = self.tree.resolve_parent(user_id, path)?;
        self.issuer.issue(user_id, policy, &parent, name, declared_size).await
    }

    /// Live session owned by `user_id`. Someone else's session is reported
    /// as missing.
    fn owned_session(&self, user_id: UserId, session_id: &str) -> DriveResult<PendingUpload> {
        self.store
            .get_pending(session_id)?
            .filter(|pending| pending.owner_id == user_id)
            .ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))
    }

    fn local_policy(&self, pending: &PendingUpload) -> DriveResult<Arc<StoragePolicy>> {
        let policy = self.registry.resolve(pending.policy_id)?;
        if !policy.kind.is_local() {
            return Err(DriveError::InvalidRequest(format!(
                "session {} uploads straight to {}",
                pending.session_id, policy.kind
            )));
        }
        Ok(policy)
    }

    pub async fn put_chunk(&self, user_id: UserId, session_id: &str, index: u32, total: u32, data: Bytes) -> DriveResult<ChunkAck> {
        let _guard = self.locks.acquire(session_id).await?;
        let pending = self.owned_session(user_id, session_id)?;
        let policy = self.local_policy(&pending)?;
        self.write_chunk(&pending, &policy, index, total, data, policy.chunk_size).await
    }

    async fn write_chunk(
        &self,
        pending: &PendingUpload,
        policy: &StoragePolicy,
        index: u32,
        total: u32,
        data: Bytes,
        max_chunk: u64,
    ) -> DriveResult<ChunkAck> {
        let now = Utc::now();
        if pending.status.is_terminal() {
            return Err(DriveError::SessionNotFound(pending.session_id.clone()));
        }
        if pending.is_expired(now) {
            return Err(DriveError::SessionExpired(pending.session_id.clone()));
        }
        if total == 0 || index >= total {
            return Err(DriveError::InvalidRequest(format!("chunk {} outside 0..{}", index, total)));
        }
        if let Some(announced) = pending.chunk_total {
            if announced != total {
                return Err(DriveError::InvalidRequest(format!(
                    "session {} announced {} chunks, got total {}",
                    pending.session_id, announced, total
                )));
            }
        }
        if max_chunk > 0 {
            let needed = pending.reserved_bytes.div_ceil(max_chunk).max(1);
            if u64::from(total) > needed {
                return Err(DriveError::InvalidRequest(format!(
                    "{} chunks of at most {} bytes exceed the declared {} bytes",
                    total, max_chunk, pending.reserved_bytes
                )));
            }
        }

        let next = pending.status.apply(UploadEvent::ChunkReceived)?;
        if next != pending.status && !self.store.transition_pending(&pending.session_id, pending.status, next, now)? {
            return Err(DriveError::SessionNotFound(pending.session_id.clone()));
        }
        if pending.chunk_total.is_none() {
            self.store.set_chunk_total(&pending.session_id, total)?;
        }
        self.assembler.put_chunk(&pending.session_id, index, total, data, max_chunk).await
    }

    /// Assemble the chunks of a local upload and commit the file.
    pub async fn finalize(&self, user_id: UserId, session_id: &str) -> DriveResult<FileView> {
        let _guard = self.locks.acquire(session_id).await?;
        let pending = self.owned_session(user_id, session_id)?;
        let policy = self.local_policy(&pending)?;
        self.finalize_locked(&pending, &policy).await
    }

    async fn finalize_locked(&self, pending: &PendingUpload, policy: &StoragePolicy) -> DriveResult<FileView> {
        match pending.status {
            UploadStatus::Committed => {
                let file_id = pending
                    .committed_file_id
                    .ok_or_else(|| DriveError::Storage(format!("committed session {} has no file", pending.session_id)))?;
                return self.committed_view(file_id);
            }
            UploadStatus::Aborted => return Err(DriveError::SessionNotFound(pending.session_id.clone())),
            UploadStatus::Issued => {
                return Err(DriveError::InvalidRequest(format!("session {} has no chunks", pending.session_id)));
            }
            UploadStatus::Chunking | UploadStatus::AwaitingCallback => {}
        }
        if pending.is_expired(Utc::now()) {
            return Err(DriveError::SessionExpired(pending.session_id.clone()));
        }

        let handle = self.assembler.finalize(&pending.session_id).await?;
        let committed = match self.objects.put_file(&pending.backend_key, &handle.path).await {
            Ok(stored) => {
                debug!("Stored {} bytes for session {} under {}", stored, pending.session_id, pending.backend_key);
                self.commit(pending, policy, stored, Some(handle.md5), UploadStatus::Chunking).await
            }
            Err(e) => Err(e),
        };
        match committed {
            Ok(file) => Ok(FileView::from(&file)),
            Err(e) => {
                // The chunks were consumed by assembly, so a retry has nothing to finalize.
                self.abandon(pending, policy).await;
                Err(e)
            }
        }
    }

    /// Abort a local session whose assembled bytes could not become a file,
    /// and drop whatever reached the object store.
    async fn abandon(&self, pending: &PendingUpload, policy: &StoragePolicy) {
        match self.store.abort_pending(&pending.session_id, Utc::now()) {
            Ok(AbortOutcome::Aborted(_)) => {
                warn!("Abandoned session {} after a failed finalize", pending.session_id);
                self.reclaim(policy, &pending.backend_key).await;
                if let Err(e) = self.assembler.discard(&pending.session_id).await {
                    warn!("Could not discard scratch data of {}: {}", pending.session_id, e);
                }
            }
            Ok(AbortOutcome::AlreadyAborted(_)) => {}
            Err(e) => warn!("Could not abort session {}: {}", pending.session_id, e),
        }
    }

    /// Authenticate a provider callback and commit its upload. Returns the
    /// body the provider expects back.
    pub async fn handle_callback(&self, kind: &str, policy_id: PolicyId, session_id: &str, request: &CallbackRequest) -> DriveResult<Value> {
        let _guard = self.locks.acquire(session_id).await?;
        let verification = self.verifier.verify(kind, policy_id, session_id, request, Utc::now()).await?;
        let (file_id, driver) = match verification {
            Verification::Fresh(done) => {
                let driver = self.drivers.get(done.policy.kind)?;
                let file = self
                    .commit(&done.pending, &done.policy, done.size, done.content_hash, UploadStatus::AwaitingCallback)
                    .await?;
                (file.id, driver)
            }
            Verification::Replayed { file_id } => {
                let policy = self.registry.resolve(policy_id)?;
                (file_id, self.drivers.get(policy.kind)?)
            }
        };
        Ok(match self.store.get_file(file_id)? {
            Some(file) => driver.callback_ack(&FileView::from(&file)),
            // Committed, then deleted before the provider retried.
            None => json!({ "code": 0, "data": { "id": file_id } }),
        })
    }

    fn committed_view(&self, file_id: FileId) -> DriveResult<FileView> {
        self.store
            .get_file(file_id)?
            .map(|file| FileView::from(&file))
            .ok_or_else(|| DriveError::NotFound(format!("file {}", file_id)))
    }

    /// Apply a verified completion. Uploads that cannot be committed are
    /// aborted and their stored bytes reclaimed.
    async fn commit(
        &self,
        pending: &PendingUpload,
        policy: &StoragePolicy,
        size: u64,
        content_hash: Option<String>,
        expected: UploadStatus,
    ) -> DriveResult<FileRecord> {
        let request = CommitRequest {
            session_id: pending.session_id.clone(),
            expected,
            size,
            content_hash,
            conflict_rule: policy.conflict_rule,
            now: Utc::now(),
        };
        let result = policy.check_size(size).and_then(|_| self.store.commit_pending(&request));
        match result {
            Ok(CommitOutcome::Committed { file, replaced }) => {
                if let Some(old) = replaced {
                    info!("File {} replaced {} at '{}'", file.id, old.id, file.name);
                }
                info!(
                    "Committed session {} as file {} ({} bytes) for user {}",
                    pending.session_id, file.id, file.size, pending.owner_id
                );
                Ok(file)
            }
            Ok(CommitOutcome::AlreadyCommitted { file_id }) => self
                .store
                .get_file(file_id)?
                .ok_or_else(|| DriveError::NotFound(format!("file {}", file_id))),
            Err(e @ (DriveError::Conflict(_) | DriveError::QuotaExceeded { .. } | DriveError::FileTooLarge { .. })) => {
                warn!("Session {} cannot be committed: {}", pending.session_id, e);
                self.store.abort_pending(&pending.session_id, Utc::now())?;
                self.reclaim(policy, &pending.backend_key).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn reclaim(&self, policy: &StoragePolicy, key: &str) {
        let result = match self.drivers.get(policy.kind) {
            Ok(driver) => driver.delete_object(policy, key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Could not reclaim object {} on policy {}: {}", key, policy.id, e);
        }
    }

    /// Owner-initiated cancel. Cancelling twice is fine; cancelling a
    /// committed session is an illegal transition.
    pub async fn cancel(&self, user_id: UserId, session_id: &str) -> DriveResult<()> {
        let _guard = self.locks.acquire(session_id).await?;
        self.owned_session(user_id, session_id)?;
        self.abort_locked(session_id, UploadEvent::Cancelled, Utc::now()).await.map(|_| ())
    }

    /// Abort a session the sweeper found past its window. Returns false if
    /// it turned out to be finished or still valid by the time the lock was
    /// taken.
    pub async fn expire_session(&self, session_id: &str, now: DateTime<Utc>) -> DriveResult<bool> {
        let _guard = self.locks.acquire(session_id).await?;
        match self.store.get_pending(session_id)? {
            Some(pending) if !pending.status.is_terminal() && pending.is_expired(now) => {
                self.abort_locked(session_id, UploadEvent::Expired, now).await
            }
            _ => Ok(false),
        }
    }

    async fn abort_locked(&self, session_id: &str, event: UploadEvent, now: DateTime<Utc>) -> DriveResult<bool> {
        let pending = self
            .store
            .get_pending(session_id)?
            .ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))?;
        pending.status.apply(event)?;

        let aborted = match self.store.abort_pending(session_id, now)? {
            AbortOutcome::AlreadyAborted(_) => return Ok(false),
            AbortOutcome::Aborted(aborted) => aborted,
        };
        info!("Aborted session {} ({})", session_id, event.name());

        let policy = self.registry.resolve(aborted.policy_id)?;
        if policy.kind.is_local() {
            self.assembler.discard(session_id).await?;
            // Present only if the session died between storing and committing.
            self.reclaim(&policy, &aborted.backend_key).await;
        } else if let Err(e) = self.drivers.get(policy.kind)?.cancel_session(&policy, &aborted).await {
            warn!("Could not cancel provider session for {}: {}", session_id, e);
        }
        Ok(true)
    }

    /// Single-shot upload of a whole body through the user's default local
    /// policy, as used by WebDAV PUT.
    pub async fn upload_direct(&self, user_id: UserId, path: &str, data: Bytes) -> DriveResult<FileView> {
        let policy_id = self
            .quota
            .default_policy(user_id)?
            .ok_or_else(|| DriveError::InvalidRequest("no storage policy available".to_string()))?;
        let policy = self.registry.resolve(policy_id)?;
        if !policy.kind.is_local() {
            return Err(DriveError::InvalidRequest(format!(
                "direct uploads need a local policy, default is {}",
                policy.kind
            )));
        }

        let issued = self.issue(user_id, policy_id, path, data.len() as u64).await?;
        let session_id = issued.session_id.clone();
        let _guard = self.locks.acquire(&session_id).await?;
        let result = async {
            self.write_chunk(&issued.pending, &policy, 0, 1, data, 0).await?;
            let pending = self.owned_session(user_id, &session_id)?;
            self.finalize_locked(&pending, &policy).await
        }
        .await;

        // A failed commit has aborted already; this covers failures before it.
        if result.is_err() {
            if let Err(e) = self.abort_locked(&session_id, UploadEvent::Cancelled, Utc::now()).await {
                warn!("Could not abort failed direct upload {}: {}", session_id, e);
            }
        }
        result
    }

    /// Bytes of a file stored on the local backend.
    pub async fn download(&self, user_id: UserId, path: &str) -> DriveResult<(FileRecord, Bytes)> {
        let file = self.tree.resolve(user_id, path)?;
        if file.is_dir() {
            return Err(DriveError::InvalidRequest(format!("'{}' is a directory", path)));
        }
        let (policy_id, key) = match (file.policy_id, file.backend_key.as_deref()) {
            (Some(policy_id), Some(key)) => (policy_id, key.to_string()),
            _ => return Err(DriveError::Storage(format!("file {} has no stored object", file.id))),
        };
        let policy = self.registry.resolve(policy_id)?;
        if !policy.kind.is_local() {
            return Err(DriveError::InvalidRequest(format!("file {} is served by {}", file.id, policy.kind)));
        }
        let data = self.objects.get(&key).await?;
        Ok((file, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::local::LocalDriver;
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::metadata::Group;
    use crate::policy::ConflictRule;
    use crate::storage::mock_store::MockObjectStore;
    use tempfile::TempDir;

    struct Fixture {
        _scratch: TempDir,
        store: Arc<dyn MetadataStorage>,
        objects: Arc<MockObjectStore>,
        coordinator: IngestionCoordinator,
    }

    fn fixture(quota: u64, conflict_rule: ConflictRule) -> Fixture {
        let scratch = TempDir::new().unwrap();
        let store: Arc<dyn MetadataStorage> = Arc::new(MockMetadataStore::new());
        let mut policy = StoragePolicy::local(1, "local");
        policy.chunk_size = 4;
        policy.conflict_rule = conflict_rule;
        store.put_policy(&policy).unwrap();
        let registry = Arc::new(PolicyRegistry::load(store.clone()).unwrap());
        let quota_ledger = Arc::new(QuotaLedger::new(store.clone(), 1));
        quota_ledger
            .set_group(&Group { id: 1, name: "default".into(), max_storage: quota, policy_ids: vec![1] })
            .unwrap();
        let objects = Arc::new(MockObjectStore::new());
        let drivers = Arc::new(DriverSet::new().with(Arc::new(LocalDriver::new(objects.clone()))));
        let assembler = Arc::new(ChunkAssembler::new(scratch.path()).unwrap());
        let coordinator = IngestionCoordinator::new(
            store.clone(),
            registry,
            quota_ledger,
            drivers,
            objects.clone(),
            assembler,
            "http://drive.test",
        );
        Fixture { _scratch: scratch, store, objects, coordinator }
    }

    #[tokio::test]
    async fn test_chunked_upload_commits() {
        let f = fixture(100, ConflictRule::Fail);
        let issued = f.coordinator.issue(7, 1, "/hello.txt", 10).await.unwrap();
        let sid = issued.session_id.as_str();

        f.coordinator.put_chunk(7, sid, 2, 3, Bytes::from_static(b"ij")).await.unwrap();
        f.coordinator.put_chunk(7, sid, 0, 3, Bytes::from_static(b"abcd")).await.unwrap();
        assert!(matches!(
            f.coordinator.finalize(7, sid).await,
            Err(DriveError::IncompleteUpload { ref missing }) if missing == &vec![1]
        ));
        f.coordinator.put_chunk(7, sid, 1, 3, Bytes::from_static(b"efgh")).await.unwrap();

        let view = f.coordinator.finalize(7, sid).await.unwrap();
        assert_eq!(view.size, 10);
        assert_eq!(view.content_hash.as_deref(), Some(format!("{:x}", md5::compute(b"abcdefghij")).as_str()));
        assert_eq!(f.objects.object_count(), 1);

        let usage = f.store.quota_usage(7).unwrap();
        assert_eq!((usage.used, usage.reserved), (10, 0));

        // Finalize replay returns the same file.
        let again = f.coordinator.finalize(7, sid).await.unwrap();
        assert_eq!(again.id, view.id);

        let (_, body) = f.coordinator.download(7, "/hello.txt").await.unwrap();
        assert_eq!(&body[..], b"abcdefghij");
    }

    #[tokio::test]
    async fn test_chunk_guards() {
        let f = fixture(100, ConflictRule::Fail);
        let sid = f.coordinator.issue(7, 1, "/a.txt", 8).await.unwrap().session_id;

        // Foreign user.
        assert!(matches!(
            f.coordinator.put_chunk(8, &sid, 0, 2, Bytes::from_static(b"abcd")).await,
            Err(DriveError::SessionNotFound(_))
        ));
        // More chunks than the declared size allows.
        assert!(matches!(
            f.coordinator.put_chunk(7, &sid, 0, 3, Bytes::from_static(b"abcd")).await,
            Err(DriveError::InvalidRequest(_))
        ));
        f.coordinator.put_chunk(7, &sid, 0, 2, Bytes::from_static(b"abcd")).await.unwrap();
        // Total cannot change once announced.
        assert!(matches!(
            f.coordinator.put_chunk(7, &sid, 1, 1, Bytes::from_static(b"efgh")).await,
            Err(DriveError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_and_is_idempotent() {
        let f = fixture(100, ConflictRule::Fail);
        let sid = f.coordinator.issue(7, 1, "/a.txt", 8).await.unwrap().session_id;
        f.coordinator.put_chunk(7, &sid, 0, 2, Bytes::from_static(b"abcd")).await.unwrap();

        f.coordinator.cancel(7, &sid).await.unwrap();
        f.coordinator.cancel(7, &sid).await.unwrap();
        assert_eq!(f.store.quota_usage(7).unwrap().reserved, 0);
        assert!(matches!(
            f.coordinator.put_chunk(7, &sid, 1, 2, Bytes::from_static(b"efgh")).await,
            Err(DriveError::SessionNotFound(_))
        ));

        // The slot is free again.
        f.coordinator.issue(7, 1, "/a.txt", 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_conflict_aborts_and_reclaims() {
        let f = fixture(100, ConflictRule::Fail);
        f.coordinator.upload_direct(7, "/a.txt", Bytes::from_static(b"first")).await.unwrap();

        // Slot was free at issue time; occupied by the time of commit.
        let sid = f.coordinator.issue(7, 1, "/b.txt", 4).await.unwrap().session_id;
        f.coordinator.put_chunk(7, &sid, 0, 1, Bytes::from_static(b"abcd")).await.unwrap();
        f.coordinator.tree().move_path(7, "/a.txt", "/b.txt").unwrap();

        assert!(matches!(f.coordinator.finalize(7, &sid).await, Err(DriveError::Conflict(_))));
        let pending = f.store.get_pending(&sid).unwrap().unwrap();
        assert_eq!(pending.status, UploadStatus::Aborted);
        assert!(!f.objects.contains(&pending.backend_key));
        let usage = f.store.quota_usage(7).unwrap();
        assert_eq!((usage.used, usage.reserved), (5, 0));
    }

    #[tokio::test]
    async fn test_finalize_into_deleted_dir_aborts_and_reclaims() {
        let f = fixture(100, ConflictRule::Fail);
        f.coordinator.tree().mkdir(7, "/docs").unwrap();
        let sid = f.coordinator.issue(7, 1, "/docs/a.txt", 4).await.unwrap().session_id;
        f.coordinator.put_chunk(7, &sid, 0, 1, Bytes::from_static(b"abcd")).await.unwrap();
        f.coordinator.tree().delete_path(7, "/docs").unwrap();

        assert!(matches!(f.coordinator.finalize(7, &sid).await, Err(DriveError::NotFound(_))));
        let pending = f.store.get_pending(&sid).unwrap().unwrap();
        assert_eq!(pending.status, UploadStatus::Aborted);
        assert!(!f.objects.contains(&pending.backend_key));
        assert_eq!(f.objects.object_count(), 0);
        let usage = f.store.quota_usage(7).unwrap();
        assert_eq!((usage.used, usage.reserved), (0, 0));

        // The session is gone for good, not stuck in chunking.
        assert!(matches!(f.coordinator.finalize(7, &sid).await, Err(DriveError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_expiry_reclaims_uncommitted_local_object() {
        let f = fixture(100, ConflictRule::Fail);
        let sid = f.coordinator.issue(7, 1, "/a.txt", 4).await.unwrap().session_id;
        let key = f.store.get_pending(&sid).unwrap().unwrap().backend_key;
        // Bytes stored but never committed, as after a crash mid-finalize.
        f.objects.insert(&key, Bytes::from_static(b"abcd"));

        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(f.coordinator.expire_session(&sid, later).await.unwrap());
        assert!(!f.objects.contains(&key));
    }

    #[tokio::test]
    async fn test_upload_direct_rename_rule() {
        let f = fixture(100, ConflictRule::Rename);
        f.coordinator.upload_direct(7, "/a.txt", Bytes::from_static(b"one")).await.unwrap();
        let second = f.coordinator.upload_direct(7, "/a.txt", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(second.name, "a (1).txt");
        assert_eq!(f.store.quota_usage(7).unwrap().used, 6);
    }

    #[tokio::test]
    async fn test_expire_session() {
        let f = fixture(100, ConflictRule::Fail);
        let sid = f.coordinator.issue(7, 1, "/a.txt", 8).await.unwrap().session_id;

        assert!(!f.coordinator.expire_session(&sid, Utc::now()).await.unwrap());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(f.coordinator.expire_session(&sid, later).await.unwrap());
        assert!(!f.coordinator.expire_session(&sid, later).await.unwrap());
        assert_eq!(f.store.quota_usage(7).unwrap().reserved, 0);
    }
}
