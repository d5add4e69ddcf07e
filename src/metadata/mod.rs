//! Metadata Storage Layer Abstraction
//!
//! Everything the engine persists lives behind `MetadataStorage`: storage
//! policies, groups and user quota rows, the virtual file tree, pending
//! uploads and quota reservations. SQLite is the production backend; the
//! mock store keeps the same semantics in memory for tests.
//!
//! Operations that must be atomic across tables (reserving quota, committing
//! an upload, aborting one) are single trait methods so each backend can run
//! them inside one transaction or one lock.

pub mod sqlite_store;
pub mod mock_store;
pub mod config;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DriveResult;
use crate::ingest::state::UploadStatus;
use crate::policy::{ConflictRule, PolicyId, StoragePolicy};

pub type UserId = i64;
pub type FileId = i64;
pub type GroupId = i64;
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::File => "file",
            FileKind::Directory => "directory",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(FileKind::File),
            "directory" => Ok(FileKind::Directory),
            _ => Err(format!("Unknown file kind: {}", s)),
        }
    }
}

/// A node of the virtual tree. Directories carry no backend key and size 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub owner_id: UserId,
    /// `None` only for a user's root directory.
    pub parent_id: Option<FileId>,
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub policy_id: Option<PolicyId>,
    /// Opaque to the tree; meaningful only to the owning policy's backend.
    pub backend_key: Option<String>,
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the record is tombstoned and waiting for reclamation.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// An authorized upload that has not been confirmed complete yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub target_parent_id: FileId,
    pub target_name: String,
    pub policy_id: PolicyId,
    pub backend_key: String,
    pub reserved_bytes: u64,
    /// Chunk count announced by the first chunk of a local upload.
    pub chunk_total: Option<u32>,
    /// Upload session URL opened on a resumable backend.
    pub remote_session_url: Option<String>,
    pub status: UploadStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub committed_file_id: Option<FileId>,
}

impl PendingUpload {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Total bytes a member may consume.
    pub max_storage: u64,
    /// Policies members may upload through.
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub group_id: GroupId,
    pub used_bytes: u64,
    pub reserved_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub quota: u64,
    pub used: u64,
    pub reserved: u64,
}

impl QuotaUsage {
    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.used + self.reserved)
    }
}

/// Everything a store needs to turn a pending upload into a file record.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub session_id: SessionId,
    /// The status the session must currently be in.
    pub expected: UploadStatus,
    /// Verified object size, replacing the declared size in the ledger.
    pub size: u64,
    pub content_hash: Option<String>,
    pub conflict_rule: ConflictRule,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        file: FileRecord,
        /// Occupant tombstoned by the `replace` conflict rule.
        replaced: Option<FileRecord>,
    },
    /// The session was committed earlier; nothing was applied.
    AlreadyCommitted { file_id: FileId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortOutcome {
    Aborted(PendingUpload),
    /// Already aborted earlier; nothing was released.
    AlreadyAborted(PendingUpload),
}

/// Trait defining the metadata storage interface
pub trait MetadataStorage: Send + Sync {
    // Policies

    fn list_policies(&self) -> DriveResult<Vec<StoragePolicy>>;

    fn put_policy(&self, policy: &StoragePolicy) -> DriveResult<()>;

    fn delete_policy(&self, policy_id: PolicyId) -> DriveResult<()>;

    /// True while a live file or live pending upload references the policy.
    fn policy_in_use(&self, policy_id: PolicyId) -> DriveResult<bool>;

    // Groups and users

    fn put_group(&self, group: &Group) -> DriveResult<()>;

    fn get_group(&self, group_id: GroupId) -> DriveResult<Option<Group>>;

    /// Create the user row and its root directory if missing.
    fn ensure_user(&self, user_id: UserId, group_id: GroupId, now: DateTime<Utc>) -> DriveResult<UserAccount>;

    fn assign_group(&self, user_id: UserId, group_id: GroupId) -> DriveResult<()>;

    fn get_user(&self, user_id: UserId) -> DriveResult<Option<UserAccount>>;

    fn quota_usage(&self, user_id: UserId) -> DriveResult<QuotaUsage>;

    // Quota reservations

    /// Atomically add a reservation if it fits in the remaining quota.
    /// Fails with `QuotaExceeded` and leaves nothing behind otherwise.
    fn reserve_quota(&self, reservation: &QuotaReservation) -> DriveResult<()>;

    /// Release a reservation. Returns `None` if it was already released or
    /// settled, so each reservation is given back at most once.
    fn release_quota(&self, session_id: &str) -> DriveResult<Option<QuotaReservation>>;

    /// Reservations with no pending upload row, created before `older_than`.
    fn orphaned_reservations(&self, older_than: DateTime<Utc>, limit: usize) -> DriveResult<Vec<QuotaReservation>>;

    // Virtual tree

    fn root_dir(&self, owner_id: UserId) -> DriveResult<FileRecord>;

    /// Live record by id; tombstoned records are invisible.
    fn get_file(&self, file_id: FileId) -> DriveResult<Option<FileRecord>>;

    fn find_child(&self, parent_id: FileId, name: &str) -> DriveResult<Option<FileRecord>>;

    fn list_children(&self, parent_id: FileId) -> DriveResult<Vec<FileRecord>>;

    /// Fails with `Conflict` if the slot is occupied.
    fn create_directory(&self, owner_id: UserId, parent_id: FileId, name: &str, now: DateTime<Utc>) -> DriveResult<FileRecord>;

    /// Fails with `Conflict` if the destination slot is occupied.
    fn move_file(&self, file_id: FileId, new_parent_id: FileId, new_name: &str) -> DriveResult<()>;

    /// Tombstone a record and its whole subtree, crediting file sizes back
    /// to the owner's used bytes. Returns the tombstoned records.
    fn tombstone(&self, file_id: FileId, now: DateTime<Utc>) -> DriveResult<Vec<FileRecord>>;

    /// Tombstoned records waiting for backend reclamation.
    fn tombstoned_files(&self, limit: usize) -> DriveResult<Vec<FileRecord>>;

    fn purge_file(&self, file_id: FileId) -> DriveResult<()>;

    // Pending uploads

    /// Record a new pending upload. Fails with `Conflict` if another live
    /// session targets the same `(parent, name)` slot.
    fn open_pending(&self, pending: &PendingUpload) -> DriveResult<()>;

    fn get_pending(&self, session_id: &str) -> DriveResult<Option<PendingUpload>>;

    /// Compare-and-set between two live states. Returns false if the
    /// session was not in `from`.
    fn transition_pending(&self, session_id: &str, from: UploadStatus, to: UploadStatus, now: DateTime<Utc>) -> DriveResult<bool>;

    fn set_chunk_total(&self, session_id: &str, chunk_total: u32) -> DriveResult<()>;

    fn attach_remote_session(&self, session_id: &str, url: &str) -> DriveResult<()>;

    /// Atomically: check the session status, insert the file record under
    /// the policy's conflict rule, settle the reservation into used bytes
    /// with the verified size, and mark the session committed.
    fn commit_pending(&self, request: &CommitRequest) -> DriveResult<CommitOutcome>;

    /// Atomically move a live session to aborted and release its
    /// reservation. Aborting a committed session is an `IllegalTransition`.
    fn abort_pending(&self, session_id: &str, now: DateTime<Utc>) -> DriveResult<AbortOutcome>;

    /// Live sessions whose `expires_at` is at or before `now`.
    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> DriveResult<Vec<PendingUpload>>;

    /// Drop terminal sessions last updated before `older_than`.
    fn purge_finished_pending(&self, older_than: DateTime<Utc>) -> DriveResult<usize>;
}
