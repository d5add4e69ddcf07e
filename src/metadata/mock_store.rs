//! Mock implementation of MetadataStorage trait for testing

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{DriveError, DriveResult};
use crate::ingest::state::{UploadEvent, UploadStatus};
use crate::metadata::{
    AbortOutcome, CommitOutcome, CommitRequest, FileId, FileKind, FileRecord, Group, GroupId,
    MetadataStorage, PendingUpload, QuotaReservation, QuotaUsage, SessionId, UserAccount, UserId,
};
use crate::policy::{ConflictRule, PolicyId, StoragePolicy};
use crate::tree::path::numbered_name;

#[derive(Default)]
struct MockState {
    policies: BTreeMap<PolicyId, StoragePolicy>,
    groups: HashMap<GroupId, Group>,
    users: HashMap<UserId, UserAccount>,
    files: BTreeMap<FileId, FileRecord>,
    next_file_id: FileId,
    pending: HashMap<SessionId, PendingUpload>,
    reservations: HashMap<SessionId, QuotaReservation>,
}

impl MockState {
    fn live_file(&self, file_id: FileId) -> Option<&FileRecord> {
        self.files.get(&file_id).filter(|f| f.deleted_at.is_none())
    }

    fn live_child(&self, parent_id: FileId, name: &str) -> Option<&FileRecord> {
        self.files
            .values()
            .find(|f| f.deleted_at.is_none() && f.parent_id == Some(parent_id) && f.name == name)
    }

    fn children(&self, parent_id: FileId) -> Vec<FileRecord> {
        let mut children: Vec<FileRecord> = self
            .files
            .values()
            .filter(|f| f.deleted_at.is_none() && f.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| (!a.is_dir(), &a.name).cmp(&(!b.is_dir(), &b.name)));
        children
    }

    fn live_dir(&self, dir_id: FileId) -> DriveResult<FileRecord> {
        match self.live_file(dir_id) {
            Some(dir) if dir.is_dir() => Ok(dir.clone()),
            Some(_) => Err(DriveError::InvalidRequest(format!("{} is not a directory", dir_id))),
            None => Err(DriveError::NotFound(format!("directory {}", dir_id))),
        }
    }

    fn usage(&self, user_id: UserId) -> DriveResult<QuotaUsage> {
        let user = self
            .users
            .get(&user_id)
            .ok_or_else(|| DriveError::NotFound(format!("user {}", user_id)))?;
        let quota = self.groups.get(&user.group_id).map(|g| g.max_storage).unwrap_or(0);
        Ok(QuotaUsage { quota, used: user.used_bytes, reserved: user.reserved_bytes })
    }

    fn release(&mut self, session_id: &str) -> Option<QuotaReservation> {
        let reservation = self.reservations.remove(session_id)?;
        if let Some(user) = self.users.get_mut(&reservation.user_id) {
            user.reserved_bytes = user.reserved_bytes.saturating_sub(reservation.bytes);
        }
        Some(reservation)
    }

    fn insert_file(&mut self, mut record: FileRecord) -> FileRecord {
        self.next_file_id += 1;
        record.id = self.next_file_id;
        self.files.insert(record.id, record.clone());
        record
    }

    fn mark_tombstoned(&mut self, file_id: FileId, now: DateTime<Utc>) -> Option<FileRecord> {
        let record = self.files.get_mut(&file_id)?;
        record.deleted_at = Some(now);
        Some(record.clone())
    }
}

/// Mock implementation of MetadataStorage for testing
pub struct MockMetadataStore {
    state: Mutex<MockState>,
}

impl MockMetadataStore {
    /// Create a new mock metadata store
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState::default()) }
    }

    /// Clear all data from the store (useful for test cleanup)
    pub fn clear(&self) {
        *self.lock() = MockState::default();
    }

    /// Number of file records, tombstoned ones included
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStorage for MockMetadataStore {
    fn list_policies(&self) -> DriveResult<Vec<StoragePolicy>> {
        Ok(self.lock().policies.values().cloned().collect())
    }

    fn put_policy(&self, policy: &StoragePolicy) -> DriveResult<()> {
        self.lock().policies.insert(policy.id, policy.clone());
        Ok(())
    }

    fn delete_policy(&self, policy_id: PolicyId) -> DriveResult<()> {
        self.lock().policies.remove(&policy_id);
        Ok(())
    }

    fn policy_in_use(&self, policy_id: PolicyId) -> DriveResult<bool> {
        let state = self.lock();
        let by_file = state.files.values().any(|f| f.policy_id == Some(policy_id));
        let by_session = state
            .pending
            .values()
            .any(|p| p.policy_id == policy_id && !p.status.is_terminal());
        Ok(by_file || by_session)
    }

    fn put_group(&self, group: &Group) -> DriveResult<()> {
        self.lock().groups.insert(group.id, group.clone());
        Ok(())
    }

    fn get_group(&self, group_id: GroupId) -> DriveResult<Option<Group>> {
        Ok(self.lock().groups.get(&group_id).cloned())
    }

    fn ensure_user(&self, user_id: UserId, group_id: GroupId, now: DateTime<Utc>) -> DriveResult<UserAccount> {
        let mut state = self.lock();
        state.users.entry(user_id).or_insert(UserAccount {
            id: user_id,
            group_id,
            used_bytes: 0,
            reserved_bytes: 0,
        });
        let has_root = state
            .files
            .values()
            .any(|f| f.owner_id == user_id && f.parent_id.is_none() && f.deleted_at.is_none());
        if !has_root {
            state.insert_file(FileRecord {
                id: 0,
                owner_id: user_id,
                parent_id: None,
                name: String::new(),
                kind: FileKind::Directory,
                size: 0,
                policy_id: None,
                backend_key: None,
                content_hash: None,
                created_at: now,
                deleted_at: None,
            });
        }
        Ok(state.users[&user_id].clone())
    }

    fn assign_group(&self, user_id: UserId, group_id: GroupId) -> DriveResult<()> {
        let mut state = self.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| DriveError::NotFound(format!("user {}", user_id)))?;
        user.group_id = group_id;
        Ok(())
    }

    fn get_user(&self, user_id: UserId) -> DriveResult<Option<UserAccount>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    fn quota_usage(&self, user_id: UserId) -> DriveResult<QuotaUsage> {
        self.lock().usage(user_id)
    }

    fn reserve_quota(&self, reservation: &QuotaReservation) -> DriveResult<()> {
        let mut state = self.lock();
        let usage = state.usage(reservation.user_id)?;
        if usage.used + usage.reserved + reservation.bytes > usage.quota {
            return Err(DriveError::QuotaExceeded {
                required: reservation.bytes,
                available: usage.available(),
            });
        }
        if state.reservations.contains_key(&reservation.session_id) {
            return Err(DriveError::Conflict(format!(
                "session {} already holds a reservation",
                reservation.session_id
            )));
        }
        state.reservations.insert(reservation.session_id.clone(), reservation.clone());
        if let Some(user) = state.users.get_mut(&reservation.user_id) {
            user.reserved_bytes += reservation.bytes;
        }
        Ok(())
    }

    fn release_quota(&self, session_id: &str) -> DriveResult<Option<QuotaReservation>> {
        Ok(self.lock().release(session_id))
    }

    fn orphaned_reservations(&self, older_than: DateTime<Utc>, limit: usize) -> DriveResult<Vec<QuotaReservation>> {
        let state = self.lock();
        let mut orphans: Vec<QuotaReservation> = state
            .reservations
            .values()
            .filter(|r| !state.pending.contains_key(&r.session_id) && r.created_at < older_than)
            .cloned()
            .collect();
        orphans.sort_by_key(|r| r.created_at);
        orphans.truncate(limit);
        Ok(orphans)
    }

    fn root_dir(&self, owner_id: UserId) -> DriveResult<FileRecord> {
        self.lock()
            .files
            .values()
            .find(|f| f.owner_id == owner_id && f.parent_id.is_none() && f.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| DriveError::NotFound(format!("root directory of user {}", owner_id)))
    }

    fn get_file(&self, file_id: FileId) -> DriveResult<Option<FileRecord>> {
        Ok(self.lock().live_file(file_id).cloned())
    }

    fn find_child(&self, parent_id: FileId, name: &str) -> DriveResult<Option<FileRecord>> {
        Ok(self.lock().live_child(parent_id, name).cloned())
    }

    fn list_children(&self, parent_id: FileId) -> DriveResult<Vec<FileRecord>> {
        Ok(self.lock().children(parent_id))
    }

    fn create_directory(&self, owner_id: UserId, parent_id: FileId, name: &str, now: DateTime<Utc>) -> DriveResult<FileRecord> {
        let mut state = self.lock();
        let parent = state.live_dir(parent_id)?;
        if parent.owner_id != owner_id {
            return Err(DriveError::NotFound(format!("directory {}", parent_id)));
        }
        if state.live_child(parent_id, name).is_some() {
            return Err(DriveError::Conflict(format!("'{}' already exists", name)));
        }
        Ok(state.insert_file(FileRecord {
            id: 0,
            owner_id,
            parent_id: Some(parent_id),
            name: name.to_string(),
            kind: FileKind::Directory,
            size: 0,
            policy_id: None,
            backend_key: None,
            content_hash: None,
            created_at: now,
            deleted_at: None,
        }))
    }

    fn move_file(&self, file_id: FileId, new_parent_id: FileId, new_name: &str) -> DriveResult<()> {
        let mut state = self.lock();
        let file = state
            .live_file(file_id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(format!("file {}", file_id)))?;
        if file.parent_id.is_none() {
            return Err(DriveError::InvalidRequest("the root directory cannot be moved".to_string()));
        }
        let target = state.live_dir(new_parent_id)?;
        if target.owner_id != file.owner_id {
            return Err(DriveError::NotFound(format!("directory {}", new_parent_id)));
        }

        let mut cursor = Some(target.id);
        while let Some(id) = cursor {
            if id == file_id {
                return Err(DriveError::InvalidRequest("cannot move a directory into itself".to_string()));
            }
            cursor = state.live_file(id).and_then(|f| f.parent_id);
        }

        if let Some(occupant) = state.live_child(new_parent_id, new_name) {
            if occupant.id != file_id {
                return Err(DriveError::Conflict(format!("'{}' already exists", new_name)));
            }
        }

        if let Some(record) = state.files.get_mut(&file_id) {
            record.parent_id = Some(new_parent_id);
            record.name = new_name.to_string();
        }
        Ok(())
    }

    fn tombstone(&self, file_id: FileId, now: DateTime<Utc>) -> DriveResult<Vec<FileRecord>> {
        let mut state = self.lock();
        let record = state
            .live_file(file_id)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(format!("file {}", file_id)))?;
        if record.parent_id.is_none() {
            return Err(DriveError::InvalidRequest("the root directory cannot be deleted".to_string()));
        }

        let owner = record.owner_id;
        let mut queue = vec![record];
        let mut tombstoned = Vec::new();
        let mut freed: u64 = 0;
        while let Some(node) = queue.pop() {
            if node.is_dir() {
                queue.extend(state.children(node.id));
            } else {
                freed += node.size;
            }
            if let Some(marked) = state.mark_tombstoned(node.id, now) {
                tombstoned.push(marked);
            }
        }

        if let Some(user) = state.users.get_mut(&owner) {
            user.used_bytes = user.used_bytes.saturating_sub(freed);
        }
        Ok(tombstoned)
    }

    fn tombstoned_files(&self, limit: usize) -> DriveResult<Vec<FileRecord>> {
        let state = self.lock();
        let mut files: Vec<FileRecord> = state.files.values().filter(|f| f.deleted_at.is_some()).cloned().collect();
        files.sort_by_key(|f| (f.deleted_at, f.id));
        files.truncate(limit);
        Ok(files)
    }

    fn purge_file(&self, file_id: FileId) -> DriveResult<()> {
        let mut state = self.lock();
        if state.files.get(&file_id).map_or(false, |f| f.deleted_at.is_some()) {
            state.files.remove(&file_id);
        }
        Ok(())
    }

    fn open_pending(&self, pending: &PendingUpload) -> DriveResult<()> {
        let mut state = self.lock();
        let slot_taken = state.pending.values().any(|p| {
            !p.status.is_terminal()
                && p.target_parent_id == pending.target_parent_id
                && p.target_name == pending.target_name
        });
        if slot_taken || state.pending.contains_key(&pending.session_id) {
            return Err(DriveError::Conflict(format!(
                "another upload to '{}' is already in progress",
                pending.target_name
            )));
        }
        state.pending.insert(pending.session_id.clone(), pending.clone());
        Ok(())
    }

    fn get_pending(&self, session_id: &str) -> DriveResult<Option<PendingUpload>> {
        Ok(self.lock().pending.get(session_id).cloned())
    }

    fn transition_pending(&self, session_id: &str, from: UploadStatus, to: UploadStatus, now: DateTime<Utc>) -> DriveResult<bool> {
        if from.is_terminal() || to.is_terminal() {
            return Err(DriveError::InvalidRequest(
                "terminal transitions go through commit_pending or abort_pending".to_string(),
            ));
        }
        let mut state = self.lock();
        match state.pending.get_mut(session_id) {
            Some(pending) if pending.status == from => {
                pending.status = to;
                pending.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_chunk_total(&self, session_id: &str, chunk_total: u32) -> DriveResult<()> {
        if let Some(pending) = self.lock().pending.get_mut(session_id) {
            pending.chunk_total = Some(chunk_total);
        }
        Ok(())
    }

    fn attach_remote_session(&self, session_id: &str, url: &str) -> DriveResult<()> {
        if let Some(pending) = self.lock().pending.get_mut(session_id) {
            pending.remote_session_url = Some(url.to_string());
        }
        Ok(())
    }

    fn commit_pending(&self, request: &CommitRequest) -> DriveResult<CommitOutcome> {
        let mut state = self.lock();
        let pending = state
            .pending
            .get(&request.session_id)
            .cloned()
            .ok_or_else(|| DriveError::SessionNotFound(request.session_id.clone()))?;

        if pending.status == UploadStatus::Committed {
            let file_id = pending.committed_file_id.ok_or_else(|| {
                DriveError::Storage(format!("session {} committed without a file", pending.session_id))
            })?;
            return Ok(CommitOutcome::AlreadyCommitted { file_id });
        }
        pending.status.apply(UploadEvent::Completed)?;
        if pending.status != request.expected {
            return Err(DriveError::IllegalTransition { from: pending.status, event: "completed" });
        }

        // Every check runs before the first mutation, so an error leaves the
        // state untouched just like a rolled back transaction.
        let parent = state.live_dir(pending.target_parent_id)?;
        let mut name = pending.target_name.clone();
        let mut replace_id = None;
        let mut credit: u64 = 0;

        if let Some(occupant) = state.live_child(parent.id, &name) {
            match request.conflict_rule {
                ConflictRule::Fail => {
                    return Err(DriveError::Conflict(format!("'{}' already exists", name)));
                }
                ConflictRule::Rename => {
                    let mut n = 1;
                    loop {
                        let candidate = numbered_name(&pending.target_name, n);
                        if state.live_child(parent.id, &candidate).is_none() {
                            name = candidate;
                            break;
                        }
                        n += 1;
                    }
                }
                ConflictRule::Replace => {
                    if occupant.is_dir() {
                        return Err(DriveError::Conflict(format!("'{}' is a directory", name)));
                    }
                    credit = occupant.size;
                    replace_id = Some(occupant.id);
                }
            }
        }

        let reserved = state.reservations.get(&pending.session_id).map(|r| r.bytes).unwrap_or(0);
        let usage = state.usage(pending.owner_id)?;
        let used = usage.used.saturating_sub(credit) + request.size;
        let still_reserved = usage.reserved.saturating_sub(reserved);
        if used + still_reserved > usage.quota {
            return Err(DriveError::QuotaExceeded {
                required: request.size,
                available: usage.quota.saturating_sub(usage.used.saturating_sub(credit) + still_reserved),
            });
        }

        let replaced = match replace_id {
            Some(id) => state.mark_tombstoned(id, request.now),
            None => None,
        };
        state.reservations.remove(&pending.session_id);
        if let Some(user) = state.users.get_mut(&pending.owner_id) {
            user.used_bytes = used;
            user.reserved_bytes = still_reserved;
        }

        let file = state.insert_file(FileRecord {
            id: 0,
            owner_id: pending.owner_id,
            parent_id: Some(parent.id),
            name,
            kind: FileKind::File,
            size: request.size,
            policy_id: Some(pending.policy_id),
            backend_key: Some(pending.backend_key.clone()),
            content_hash: request.content_hash.clone(),
            created_at: request.now,
            deleted_at: None,
        });

        if let Some(session) = state.pending.get_mut(&request.session_id) {
            session.status = UploadStatus::Committed;
            session.committed_file_id = Some(file.id);
            session.updated_at = request.now;
        }
        Ok(CommitOutcome::Committed { file, replaced })
    }

    fn abort_pending(&self, session_id: &str, now: DateTime<Utc>) -> DriveResult<AbortOutcome> {
        let mut state = self.lock();
        let pending = state
            .pending
            .get(session_id)
            .cloned()
            .ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))?;

        let next = pending.status.apply(UploadEvent::Cancelled)?;
        if next == pending.status {
            return Ok(AbortOutcome::AlreadyAborted(pending));
        }

        state.release(session_id);
        let session = state
            .pending
            .get_mut(session_id)
            .ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))?;
        session.status = UploadStatus::Aborted;
        session.updated_at = now;
        Ok(AbortOutcome::Aborted(session.clone()))
    }

    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> DriveResult<Vec<PendingUpload>> {
        let state = self.lock();
        let mut expired: Vec<PendingUpload> = state
            .pending
            .values()
            .filter(|p| !p.status.is_terminal() && p.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|p| p.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn purge_finished_pending(&self, older_than: DateTime<Utc>) -> DriveResult<usize> {
        let mut state = self.lock();
        let before = state.pending.len();
        state
            .pending
            .retain(|_, p| !(p.status.is_terminal() && p.updated_at < older_than));
        Ok(before - state.pending.len())
    }
}
