//! SQLite implementation of MetadataStorage trait

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DriveError, DriveResult};
use crate::ingest::state::{UploadEvent, UploadStatus};
use crate::metadata::{
    AbortOutcome, CommitOutcome, CommitRequest, FileId, FileKind, FileRecord, Group, GroupId,
    MetadataStorage, PendingUpload, QuotaReservation, QuotaUsage, UserAccount, UserId,
};
use crate::policy::{ConflictRule, PolicyId, StoragePolicy};
use crate::tree::path::numbered_name;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS policies (
        id INTEGER PRIMARY KEY,
        kind TEXT NOT NULL,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS groups (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        max_storage INTEGER NOT NULL,
        policy_ids TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        group_id INTEGER NOT NULL,
        used_bytes INTEGER NOT NULL DEFAULT 0,
        reserved_bytes INTEGER NOT NULL DEFAULT 0,
        CHECK (used_bytes >= 0 AND reserved_bytes >= 0)
    );

    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL,
        parent_id INTEGER,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        policy_id INTEGER,
        backend_key TEXT,
        content_hash TEXT,
        created_at INTEGER NOT NULL,
        deleted_at INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS uniq_live_sibling
        ON files(parent_id, name) WHERE deleted_at IS NULL;
    CREATE UNIQUE INDEX IF NOT EXISTS uniq_live_root
        ON files(owner_id) WHERE parent_id IS NULL AND deleted_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_files_tombstoned ON files(deleted_at);
    CREATE INDEX IF NOT EXISTS idx_files_policy ON files(policy_id);

    CREATE TABLE IF NOT EXISTS pending_uploads (
        session_id TEXT PRIMARY KEY,
        owner_id INTEGER NOT NULL,
        target_parent_id INTEGER NOT NULL,
        target_name TEXT NOT NULL,
        policy_id INTEGER NOT NULL,
        backend_key TEXT NOT NULL,
        reserved_bytes INTEGER NOT NULL,
        chunk_total INTEGER,
        remote_session_url TEXT,
        status TEXT NOT NULL,
        issued_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        committed_file_id INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS uniq_live_pending_slot
        ON pending_uploads(target_parent_id, target_name)
        WHERE status IN ('issued', 'chunking', 'awaiting_callback');
    CREATE INDEX IF NOT EXISTS idx_pending_expiry ON pending_uploads(status, expires_at);

    CREATE TABLE IF NOT EXISTS reservations (
        session_id TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL,
        bytes INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );
";

const FILE_COLUMNS: &str =
    "id, owner_id, parent_id, name, kind, size, policy_id, backend_key, content_hash, created_at, deleted_at";

const PENDING_COLUMNS: &str = "session_id, owner_id, target_parent_id, target_name, policy_id, backend_key, \
     reserved_bytes, chunk_total, remote_session_url, status, issued_at, expires_at, updated_at, committed_file_id";

const LIVE_STATUSES: &str = "('issued', 'chunking', 'awaiting_callback')";

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let kind: String = row.get(4)?;
    Ok(FileRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        kind: kind.parse::<FileKind>().map_err(|e| conversion_error(4, e))?,
        size: row.get::<_, i64>(5)? as u64,
        policy_id: row.get(6)?,
        backend_key: row.get(7)?,
        content_hash: row.get(8)?,
        created_at: from_millis(row.get(9)?),
        deleted_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingUpload> {
    let status: String = row.get(9)?;
    Ok(PendingUpload {
        session_id: row.get(0)?,
        owner_id: row.get(1)?,
        target_parent_id: row.get(2)?,
        target_name: row.get(3)?,
        policy_id: row.get(4)?,
        backend_key: row.get(5)?,
        reserved_bytes: row.get::<_, i64>(6)? as u64,
        chunk_total: row.get::<_, Option<i64>>(7)?.map(|n| n as u32),
        remote_session_url: row.get(8)?,
        status: status.parse::<UploadStatus>().map_err(|e| conversion_error(9, e))?,
        issued_at: from_millis(row.get(10)?),
        expires_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
        committed_file_id: row.get(13)?,
    })
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<QuotaReservation> {
    Ok(QuotaReservation {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        bytes: row.get::<_, i64>(2)? as u64,
        created_at: from_millis(row.get(3)?),
    })
}

// Helpers below take a plain `Connection` so they run both standalone and
// inside a transaction (which derefs to `Connection`).

fn load_file(conn: &Connection, file_id: FileId) -> DriveResult<Option<FileRecord>> {
    let sql = format!("SELECT {} FROM files WHERE id = ?1 AND deleted_at IS NULL", FILE_COLUMNS);
    Ok(conn.query_row(&sql, params![file_id], file_from_row).optional()?)
}

fn load_child(conn: &Connection, parent_id: FileId, name: &str) -> DriveResult<Option<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE parent_id = ?1 AND name = ?2 AND deleted_at IS NULL",
        FILE_COLUMNS
    );
    Ok(conn.query_row(&sql, params![parent_id, name], file_from_row).optional()?)
}

fn load_children(conn: &Connection, parent_id: FileId) -> DriveResult<Vec<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE parent_id = ?1 AND deleted_at IS NULL \
         ORDER BY CASE kind WHEN 'directory' THEN 0 ELSE 1 END, name",
        FILE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![parent_id], file_from_row)?;
    let mut children = Vec::new();
    for row in rows {
        children.push(row?);
    }
    Ok(children)
}

fn load_live_dir(conn: &Connection, dir_id: FileId) -> DriveResult<FileRecord> {
    match load_file(conn, dir_id)? {
        Some(dir) if dir.is_dir() => Ok(dir),
        Some(_) => Err(DriveError::InvalidRequest(format!("{} is not a directory", dir_id))),
        None => Err(DriveError::NotFound(format!("directory {}", dir_id))),
    }
}

fn load_pending(conn: &Connection, session_id: &str) -> DriveResult<Option<PendingUpload>> {
    let sql = format!("SELECT {} FROM pending_uploads WHERE session_id = ?1", PENDING_COLUMNS);
    Ok(conn.query_row(&sql, params![session_id], pending_from_row).optional()?)
}

fn usage_on(conn: &Connection, user_id: UserId) -> DriveResult<QuotaUsage> {
    conn.query_row(
        "SELECT u.used_bytes, u.reserved_bytes, COALESCE(g.max_storage, 0)
         FROM users u LEFT JOIN groups g ON g.id = u.group_id
         WHERE u.id = ?1",
        params![user_id],
        |row| {
            Ok(QuotaUsage {
                used: row.get::<_, i64>(0)? as u64,
                reserved: row.get::<_, i64>(1)? as u64,
                quota: row.get::<_, i64>(2)? as u64,
            })
        },
    )
    .optional()?
    .ok_or_else(|| DriveError::NotFound(format!("user {}", user_id)))
}

fn release_on(conn: &Connection, session_id: &str) -> DriveResult<Option<QuotaReservation>> {
    let reservation = conn
        .query_row(
            "SELECT session_id, user_id, bytes, created_at FROM reservations WHERE session_id = ?1",
            params![session_id],
            reservation_from_row,
        )
        .optional()?;

    if let Some(reservation) = &reservation {
        conn.execute("DELETE FROM reservations WHERE session_id = ?1", params![session_id])?;
        conn.execute(
            "UPDATE users SET reserved_bytes = MAX(reserved_bytes - ?2, 0) WHERE id = ?1",
            params![reservation.user_id, reservation.bytes as i64],
        )?;
    }
    Ok(reservation)
}

fn mark_tombstoned(conn: &Connection, record: &FileRecord, now: DateTime<Utc>) -> DriveResult<FileRecord> {
    conn.execute(
        "UPDATE files SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![record.id, millis(now)],
    )?;
    let mut tombstoned = record.clone();
    tombstoned.deleted_at = Some(now);
    Ok(tombstoned)
}

/// SQLite implementation of MetadataStorage
pub struct SQLiteMetadataStore {
    conn: Mutex<Connection>,
}

impl SQLiteMetadataStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(db_path: &Path, wal_mode: bool, busy_timeout_ms: u32) -> DriveResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening metadata database at {}", db_path.display());
        let conn = Connection::open(db_path)?;
        if wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        }
        conn.busy_timeout(std::time::Duration::from_millis(u64::from(busy_timeout_ms)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> DriveResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DriveResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetadataStorage for SQLiteMetadataStore {
    fn list_policies(&self) -> DriveResult<Vec<StoragePolicy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT body FROM policies ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut policies = Vec::new();
        for row in rows {
            policies.push(serde_json::from_str(&row?)?);
        }
        Ok(policies)
    }

    fn put_policy(&self, policy: &StoragePolicy) -> DriveResult<()> {
        let body = serde_json::to_string(policy)?;
        self.lock().execute(
            "INSERT INTO policies (id, kind, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, body = excluded.body",
            params![policy.id, policy.kind.as_str(), body],
        )?;
        Ok(())
    }

    fn delete_policy(&self, policy_id: PolicyId) -> DriveResult<()> {
        self.lock().execute("DELETE FROM policies WHERE id = ?1", params![policy_id])?;
        Ok(())
    }

    fn policy_in_use(&self, policy_id: PolicyId) -> DriveResult<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM files WHERE policy_id = ?1)
                 OR EXISTS(SELECT 1 FROM pending_uploads WHERE policy_id = ?1 AND status IN {})",
            LIVE_STATUSES
        );
        let in_use: bool = self.lock().query_row(&sql, params![policy_id], |row| row.get(0))?;
        Ok(in_use)
    }

    fn put_group(&self, group: &Group) -> DriveResult<()> {
        let policy_ids = serde_json::to_string(&group.policy_ids)?;
        self.lock().execute(
            "INSERT INTO groups (id, name, max_storage, policy_ids) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, max_storage = excluded.max_storage,
                 policy_ids = excluded.policy_ids",
            params![group.id, group.name, group.max_storage as i64, policy_ids],
        )?;
        Ok(())
    }

    fn get_group(&self, group_id: GroupId) -> DriveResult<Option<Group>> {
        let row = self
            .lock()
            .query_row(
                "SELECT id, name, max_storage, policy_ids FROM groups WHERE id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, name, max_storage, policy_ids)) => Ok(Some(Group {
                id,
                name,
                max_storage: max_storage as u64,
                policy_ids: serde_json::from_str(&policy_ids)?,
            })),
            None => Ok(None),
        }
    }

    fn ensure_user(&self, user_id: UserId, group_id: GroupId, now: DateTime<Utc>) -> DriveResult<UserAccount> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO users (id, group_id, used_bytes, reserved_bytes) VALUES (?1, ?2, 0, 0)",
            params![user_id, group_id],
        )?;
        let has_root: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM files WHERE owner_id = ?1 AND parent_id IS NULL AND deleted_at IS NULL)",
            params![user_id],
            |row| row.get(0),
        )?;
        if !has_root {
            tx.execute(
                "INSERT INTO files (owner_id, parent_id, name, kind, size, created_at)
                 VALUES (?1, NULL, '', 'directory', 0, ?2)",
                params![user_id, millis(now)],
            )?;
            debug!("Created root directory for user {}", user_id);
        }
        let account = tx.query_row(
            "SELECT id, group_id, used_bytes, reserved_bytes FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(UserAccount {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    used_bytes: row.get::<_, i64>(2)? as u64,
                    reserved_bytes: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        tx.commit()?;
        Ok(account)
    }

    fn assign_group(&self, user_id: UserId, group_id: GroupId) -> DriveResult<()> {
        let changed = self
            .lock()
            .execute("UPDATE users SET group_id = ?2 WHERE id = ?1", params![user_id, group_id])?;
        if changed == 0 {
            return Err(DriveError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    fn get_user(&self, user_id: UserId) -> DriveResult<Option<UserAccount>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id, group_id, used_bytes, reserved_bytes FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserAccount {
                        id: row.get(0)?,
                        group_id: row.get(1)?,
                        used_bytes: row.get::<_, i64>(2)? as u64,
                        reserved_bytes: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?)
    }

    fn quota_usage(&self, user_id: UserId) -> DriveResult<QuotaUsage> {
        usage_on(&self.lock(), user_id)
    }

    fn reserve_quota(&self, reservation: &QuotaReservation) -> DriveResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Bound check and increment in one statement, so two racing
        // reservations can never both squeeze under the quota.
        let changed = tx.execute(
            "UPDATE users SET reserved_bytes = reserved_bytes + ?2
             WHERE id = ?1
               AND used_bytes + reserved_bytes + ?2 <=
                   COALESCE((SELECT max_storage FROM groups WHERE groups.id = users.group_id), 0)",
            params![reservation.user_id, reservation.bytes as i64],
        )?;
        if changed == 0 {
            let usage = usage_on(&tx, reservation.user_id)?;
            return Err(DriveError::QuotaExceeded {
                required: reservation.bytes,
                available: usage.available(),
            });
        }

        tx.execute(
            "INSERT INTO reservations (session_id, user_id, bytes, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                reservation.session_id,
                reservation.user_id,
                reservation.bytes as i64,
                millis(reservation.created_at)
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DriveError::Conflict(format!("session {} already holds a reservation", reservation.session_id))
            } else {
                DriveError::from(e)
            }
        })?;

        tx.commit()?;
        Ok(())
    }

    fn release_quota(&self, session_id: &str) -> DriveResult<Option<QuotaReservation>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let released = release_on(&tx, session_id)?;
        tx.commit()?;
        Ok(released)
    }

    fn orphaned_reservations(&self, older_than: DateTime<Utc>, limit: usize) -> DriveResult<Vec<QuotaReservation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT r.session_id, r.user_id, r.bytes, r.created_at
             FROM reservations r LEFT JOIN pending_uploads p ON p.session_id = r.session_id
             WHERE p.session_id IS NULL AND r.created_at < ?1
             ORDER BY r.created_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![millis(older_than), limit as i64], reservation_from_row)?;
        let mut orphans = Vec::new();
        for row in rows {
            orphans.push(row?);
        }
        Ok(orphans)
    }

    fn root_dir(&self, owner_id: UserId) -> DriveResult<FileRecord> {
        let sql = format!(
            "SELECT {} FROM files WHERE owner_id = ?1 AND parent_id IS NULL AND deleted_at IS NULL",
            FILE_COLUMNS
        );
        self.lock()
            .query_row(&sql, params![owner_id], file_from_row)
            .optional()?
            .ok_or_else(|| DriveError::NotFound(format!("root directory of user {}", owner_id)))
    }

    fn get_file(&self, file_id: FileId) -> DriveResult<Option<FileRecord>> {
        load_file(&self.lock(), file_id)
    }

    fn find_child(&self, parent_id: FileId, name: &str) -> DriveResult<Option<FileRecord>> {
        load_child(&self.lock(), parent_id, name)
    }

    fn list_children(&self, parent_id: FileId) -> DriveResult<Vec<FileRecord>> {
        load_children(&self.lock(), parent_id)
    }

    fn create_directory(&self, owner_id: UserId, parent_id: FileId, name: &str, now: DateTime<Utc>) -> DriveResult<FileRecord> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let parent = load_live_dir(&tx, parent_id)?;
        if parent.owner_id != owner_id {
            return Err(DriveError::NotFound(format!("directory {}", parent_id)));
        }

        tx.execute(
            "INSERT INTO files (owner_id, parent_id, name, kind, size, created_at)
             VALUES (?1, ?2, ?3, 'directory', 0, ?4)",
            params![owner_id, parent_id, name, millis(now)],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DriveError::Conflict(format!("'{}' already exists", name))
            } else {
                DriveError::from(e)
            }
        })?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(FileRecord {
            id,
            owner_id,
            parent_id: Some(parent_id),
            name: name.to_string(),
            kind: FileKind::Directory,
            size: 0,
            policy_id: None,
            backend_key: None,
            content_hash: None,
            created_at: from_millis(millis(now)),
            deleted_at: None,
        })
    }

    fn move_file(&self, file_id: FileId, new_parent_id: FileId, new_name: &str) -> DriveResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let file = load_file(&tx, file_id)?.ok_or_else(|| DriveError::NotFound(format!("file {}", file_id)))?;
        if file.parent_id.is_none() {
            return Err(DriveError::InvalidRequest("the root directory cannot be moved".to_string()));
        }
        let target = load_live_dir(&tx, new_parent_id)?;
        if target.owner_id != file.owner_id {
            return Err(DriveError::NotFound(format!("directory {}", new_parent_id)));
        }

        // Walk up from the destination; meeting the source means a cycle.
        let mut cursor = Some(target.id);
        while let Some(id) = cursor {
            if id == file_id {
                return Err(DriveError::InvalidRequest("cannot move a directory into itself".to_string()));
            }
            cursor = load_file(&tx, id)?.and_then(|f| f.parent_id);
        }

        tx.execute(
            "UPDATE files SET parent_id = ?2, name = ?3 WHERE id = ?1",
            params![file_id, new_parent_id, new_name],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DriveError::Conflict(format!("'{}' already exists", new_name))
            } else {
                DriveError::from(e)
            }
        })?;
        tx.commit()?;
        Ok(())
    }

    fn tombstone(&self, file_id: FileId, now: DateTime<Utc>) -> DriveResult<Vec<FileRecord>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let record = load_file(&tx, file_id)?.ok_or_else(|| DriveError::NotFound(format!("file {}", file_id)))?;
        if record.parent_id.is_none() {
            return Err(DriveError::InvalidRequest("the root directory cannot be deleted".to_string()));
        }

        let mut queue = vec![record];
        let mut tombstoned = Vec::new();
        let mut freed: u64 = 0;
        while let Some(node) = queue.pop() {
            if node.is_dir() {
                queue.extend(load_children(&tx, node.id)?);
            } else {
                freed += node.size;
            }
            tombstoned.push(mark_tombstoned(&tx, &node, now)?);
        }

        let owner = tombstoned[0].owner_id;
        tx.execute(
            "UPDATE users SET used_bytes = MAX(used_bytes - ?2, 0) WHERE id = ?1",
            params![owner, freed as i64],
        )?;
        tx.commit()?;
        debug!("Tombstoned {} records, freed {} bytes for user {}", tombstoned.len(), freed, owner);
        Ok(tombstoned)
    }

    fn tombstoned_files(&self, limit: usize) -> DriveResult<Vec<FileRecord>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM files WHERE deleted_at IS NOT NULL ORDER BY deleted_at, id LIMIT ?1",
            FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], file_from_row)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn purge_file(&self, file_id: FileId) -> DriveResult<()> {
        self.lock().execute(
            "DELETE FROM files WHERE id = ?1 AND deleted_at IS NOT NULL",
            params![file_id],
        )?;
        Ok(())
    }

    fn open_pending(&self, pending: &PendingUpload) -> DriveResult<()> {
        let sql = format!(
            "INSERT INTO pending_uploads ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            PENDING_COLUMNS
        );
        self.lock()
            .execute(
                &sql,
                params![
                    pending.session_id,
                    pending.owner_id,
                    pending.target_parent_id,
                    pending.target_name,
                    pending.policy_id,
                    pending.backend_key,
                    pending.reserved_bytes as i64,
                    pending.chunk_total.map(i64::from),
                    pending.remote_session_url,
                    pending.status.as_str(),
                    millis(pending.issued_at),
                    millis(pending.expires_at),
                    millis(pending.updated_at),
                    pending.committed_file_id,
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    DriveError::Conflict(format!(
                        "another upload to '{}' is already in progress",
                        pending.target_name
                    ))
                } else {
                    DriveError::from(e)
                }
            })?;
        Ok(())
    }

    fn get_pending(&self, session_id: &str) -> DriveResult<Option<PendingUpload>> {
        load_pending(&self.lock(), session_id)
    }

    fn transition_pending(&self, session_id: &str, from: UploadStatus, to: UploadStatus, now: DateTime<Utc>) -> DriveResult<bool> {
        if from.is_terminal() || to.is_terminal() {
            return Err(DriveError::InvalidRequest(
                "terminal transitions go through commit_pending or abort_pending".to_string(),
            ));
        }
        let changed = self.lock().execute(
            "UPDATE pending_uploads SET status = ?3, updated_at = ?4 WHERE session_id = ?1 AND status = ?2",
            params![session_id, from.as_str(), to.as_str(), millis(now)],
        )?;
        Ok(changed == 1)
    }

    fn set_chunk_total(&self, session_id: &str, chunk_total: u32) -> DriveResult<()> {
        self.lock().execute(
            "UPDATE pending_uploads SET chunk_total = ?2 WHERE session_id = ?1",
            params![session_id, i64::from(chunk_total)],
        )?;
        Ok(())
    }

    fn attach_remote_session(&self, session_id: &str, url: &str) -> DriveResult<()> {
        self.lock().execute(
            "UPDATE pending_uploads SET remote_session_url = ?2 WHERE session_id = ?1",
            params![session_id, url],
        )?;
        Ok(())
    }

    fn commit_pending(&self, request: &CommitRequest) -> DriveResult<CommitOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pending = load_pending(&tx, &request.session_id)?
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

        let parent = load_live_dir(&tx, pending.target_parent_id)?;
        let mut name = pending.target_name.clone();
        let mut replaced = None;
        let mut credit: u64 = 0;

        if let Some(occupant) = load_child(&tx, parent.id, &name)? {
            match request.conflict_rule {
                ConflictRule::Fail => {
                    return Err(DriveError::Conflict(format!("'{}' already exists", name)));
                }
                ConflictRule::Rename => {
                    let mut n = 1;
                    loop {
                        let candidate = numbered_name(&pending.target_name, n);
                        if load_child(&tx, parent.id, &candidate)?.is_none() {
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
                    replaced = Some(mark_tombstoned(&tx, &occupant, request.now)?);
                }
            }
        }

        let reserved = tx
            .query_row(
                "SELECT bytes FROM reservations WHERE session_id = ?1",
                params![pending.session_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0) as u64;

        let usage = usage_on(&tx, pending.owner_id)?;
        let used = usage.used.saturating_sub(credit) + request.size;
        let still_reserved = usage.reserved.saturating_sub(reserved);
        if used + still_reserved > usage.quota {
            return Err(DriveError::QuotaExceeded {
                required: request.size,
                available: usage.quota.saturating_sub(usage.used.saturating_sub(credit) + still_reserved),
            });
        }
        tx.execute("DELETE FROM reservations WHERE session_id = ?1", params![pending.session_id])?;
        tx.execute(
            "UPDATE users SET used_bytes = ?2, reserved_bytes = ?3 WHERE id = ?1",
            params![pending.owner_id, used as i64, still_reserved as i64],
        )?;

        tx.execute(
            "INSERT INTO files (owner_id, parent_id, name, kind, size, policy_id, backend_key, content_hash, created_at)
             VALUES (?1, ?2, ?3, 'file', ?4, ?5, ?6, ?7, ?8)",
            params![
                pending.owner_id,
                parent.id,
                name,
                request.size as i64,
                pending.policy_id,
                pending.backend_key,
                request.content_hash,
                millis(request.now)
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                DriveError::Conflict(format!("'{}' already exists", name))
            } else {
                DriveError::from(e)
            }
        })?;
        let file_id = tx.last_insert_rowid();

        let changed = tx.execute(
            "UPDATE pending_uploads SET status = 'committed', committed_file_id = ?3, updated_at = ?4
             WHERE session_id = ?1 AND status = ?2",
            params![pending.session_id, request.expected.as_str(), file_id, millis(request.now)],
        )?;
        if changed != 1 {
            warn!("Session {} changed state during commit", pending.session_id);
            return Err(DriveError::IllegalTransition { from: pending.status, event: "completed" });
        }

        tx.commit()?;

        let file = FileRecord {
            id: file_id,
            owner_id: pending.owner_id,
            parent_id: Some(parent.id),
            name,
            kind: FileKind::File,
            size: request.size,
            policy_id: Some(pending.policy_id),
            backend_key: Some(pending.backend_key),
            content_hash: request.content_hash.clone(),
            created_at: from_millis(millis(request.now)),
            deleted_at: None,
        };
        Ok(CommitOutcome::Committed { file, replaced })
    }

    fn abort_pending(&self, session_id: &str, now: DateTime<Utc>) -> DriveResult<AbortOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut pending =
            load_pending(&tx, session_id)?.ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))?;

        let next = pending.status.apply(UploadEvent::Cancelled)?;
        if next == pending.status {
            return Ok(AbortOutcome::AlreadyAborted(pending));
        }

        tx.execute(
            "UPDATE pending_uploads SET status = 'aborted', updated_at = ?3 WHERE session_id = ?1 AND status = ?2",
            params![session_id, pending.status.as_str(), millis(now)],
        )?;
        release_on(&tx, session_id)?;
        tx.commit()?;

        pending.status = UploadStatus::Aborted;
        pending.updated_at = from_millis(millis(now));
        Ok(AbortOutcome::Aborted(pending))
    }

    fn expired_pending(&self, now: DateTime<Utc>, limit: usize) -> DriveResult<Vec<PendingUpload>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM pending_uploads WHERE status IN {} AND expires_at <= ?1 ORDER BY expires_at LIMIT ?2",
            PENDING_COLUMNS, LIVE_STATUSES
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![millis(now), limit as i64], pending_from_row)?;
        let mut expired = Vec::new();
        for row in rows {
            expired.push(row?);
        }
        Ok(expired)
    }

    fn purge_finished_pending(&self, older_than: DateTime<Utc>) -> DriveResult<usize> {
        let purged = self.lock().execute(
            "DELETE FROM pending_uploads WHERE status IN ('committed', 'aborted') AND updated_at < ?1",
            params![millis(older_than)],
        )?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_user(quota: u64) -> SQLiteMetadataStore {
        let store = SQLiteMetadataStore::open_in_memory().unwrap();
        store
            .put_group(&Group { id: 1, name: "users".into(), max_storage: quota, policy_ids: vec![1] })
            .unwrap();
        store.ensure_user(7, 1, Utc::now()).unwrap();
        store
    }

    fn reservation(session: &str, bytes: u64) -> QuotaReservation {
        QuotaReservation { session_id: session.to_string(), user_id: 7, bytes, created_at: Utc::now() }
    }

    #[test]
    fn test_reserve_respects_quota() {
        let store = store_with_user(100);
        store.reserve_quota(&reservation("a", 60)).unwrap();
        let err = store.reserve_quota(&reservation("b", 50)).unwrap_err();
        assert!(matches!(err, DriveError::QuotaExceeded { required: 50, available: 40 }));

        let usage = store.quota_usage(7).unwrap();
        assert_eq!(usage.reserved, 60);
    }

    #[test]
    fn test_release_is_exactly_once() {
        let store = store_with_user(100);
        store.reserve_quota(&reservation("a", 60)).unwrap();
        assert!(store.release_quota("a").unwrap().is_some());
        assert!(store.release_quota("a").unwrap().is_none());
        assert_eq!(store.quota_usage(7).unwrap().reserved, 0);
    }

    #[test]
    fn test_sibling_uniqueness_is_enforced_by_index() {
        let store = store_with_user(100);
        let root = store.root_dir(7).unwrap();
        store.create_directory(7, root.id, "docs", Utc::now()).unwrap();
        let err = store.create_directory(7, root.id, "docs", Utc::now()).unwrap_err();
        assert!(matches!(err, DriveError::Conflict(_)));
    }

    #[test]
    fn test_tombstone_frees_the_name() {
        let store = store_with_user(100);
        let root = store.root_dir(7).unwrap();
        let docs = store.create_directory(7, root.id, "docs", Utc::now()).unwrap();
        let removed = store.tombstone(docs.id, Utc::now()).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(store.get_file(docs.id).unwrap().is_none());
        store.create_directory(7, root.id, "docs", Utc::now()).unwrap();
        assert_eq!(store.tombstoned_files(10).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_finished_pending() {
        let store = store_with_user(100);
        let root = store.root_dir(7).unwrap();
        let now = Utc::now();
        let pending = PendingUpload {
            session_id: "s1".into(),
            owner_id: 7,
            target_parent_id: root.id,
            target_name: "a.txt".into(),
            policy_id: 1,
            backend_key: "7/a.txt".into(),
            reserved_bytes: 10,
            chunk_total: None,
            remote_session_url: None,
            status: UploadStatus::Issued,
            issued_at: now,
            expires_at: now + Duration::seconds(60),
            updated_at: now,
            committed_file_id: None,
        };
        store.open_pending(&pending).unwrap();
        store.abort_pending("s1", now).unwrap();

        assert_eq!(store.purge_finished_pending(now - Duration::seconds(1)).unwrap(), 0);
        assert_eq!(store.purge_finished_pending(now + Duration::seconds(1)).unwrap(), 1);
        assert!(store.get_pending("s1").unwrap().is_none());
    }
}
