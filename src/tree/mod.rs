//! Per-user virtual directory tree, decoupled from where bytes live.

pub mod path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{DriveError, DriveResult};
use crate::metadata::{FileId, FileKind, FileRecord, MetadataStorage, UserId};
use path::{split_parent, split_path, validate_name};

/// What clients see of a tree node. The backend key stays internal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: FileId,
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileView {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            kind: record.kind,
            size: record.size,
            content_hash: record.content_hash.clone(),
            created_at: record.created_at,
        }
    }
}

pub struct VirtualTree {
    store: Arc<dyn MetadataStorage>,
}

impl VirtualTree {
    pub fn new(store: Arc<dyn MetadataStorage>) -> Self {
        Self { store }
    }

    /// Walk `path` from the user's root. Every non-final segment must be a
    /// directory.
    pub fn resolve(&self, user_id: UserId, path: &str) -> DriveResult<FileRecord> {
        let segments = split_path(path)?;
        self.walk(user_id, &segments, path)
    }

    /// Resolve the directory that holds the final segment of `path`.
    pub fn resolve_parent<'a>(&self, user_id: UserId, path: &'a str) -> DriveResult<(FileRecord, &'a str)> {
        let (parents, name) = split_parent(path)?;
        let dir = self.walk(user_id, &parents, path)?;
        if !dir.is_dir() {
            return Err(DriveError::InvalidRequest(format!("parent of '{}' is not a directory", path)));
        }
        Ok((dir, name))
    }

    fn walk(&self, user_id: UserId, segments: &[&str], path: &str) -> DriveResult<FileRecord> {
        let mut current = self.store.root_dir(user_id)?;
        for segment in segments {
            if !current.is_dir() {
                return Err(DriveError::NotFound(path.to_string()));
            }
            current = self
                .store
                .find_child(current.id, segment)?
                .ok_or_else(|| DriveError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Fetch a live record owned by `user_id`. Foreign ids look missing.
    pub fn get_owned(&self, user_id: UserId, file_id: FileId) -> DriveResult<FileRecord> {
        match self.store.get_file(file_id)? {
            Some(record) if record.owner_id == user_id => Ok(record),
            _ => Err(DriveError::NotFound(format!("file {}", file_id))),
        }
    }

    pub fn create_dir_in(&self, user_id: UserId, parent_id: FileId, name: &str) -> DriveResult<FileRecord> {
        validate_name(name)?;
        self.store.create_directory(user_id, parent_id, name, Utc::now())
    }

    pub fn mkdir(&self, user_id: UserId, path: &str) -> DriveResult<FileRecord> {
        let (parent, name) = self.resolve_parent(user_id, path)?;
        let dir = self.create_dir_in(user_id, parent.id, name)?;
        debug!("Created directory {} for user {}", path, user_id);
        Ok(dir)
    }

    /// List a directory, directories first.
    pub fn list(&self, user_id: UserId, path: &str) -> DriveResult<Vec<FileRecord>> {
        let dir = self.resolve(user_id, path)?;
        if !dir.is_dir() {
            return Err(DriveError::InvalidRequest(format!("'{}' is not a directory", path)));
        }
        self.store.list_children(dir.id)
    }

    pub fn move_to(&self, user_id: UserId, file_id: FileId, new_parent_id: FileId, new_name: &str) -> DriveResult<()> {
        validate_name(new_name)?;
        let record = self.get_owned(user_id, file_id)?;
        if !self.get_owned(user_id, new_parent_id)?.is_dir() {
            return Err(DriveError::InvalidRequest(format!("{} is not a directory", new_parent_id)));
        }
        self.store.move_file(record.id, new_parent_id, new_name)?;
        info!("Moved file {} to {}/{}", file_id, new_parent_id, new_name);
        Ok(())
    }

    /// Move or rename by path.
    pub fn move_path(&self, user_id: UserId, from: &str, to: &str) -> DriveResult<FileRecord> {
        let source = self.resolve(user_id, from)?;
        let (parent, name) = self.resolve_parent(user_id, to)?;
        self.move_to(user_id, source.id, parent.id, name)?;
        self.get_owned(user_id, source.id)
    }

    /// Tombstone a record and its subtree. Quota is credited immediately;
    /// the backend bytes are reclaimed later by the sweeper.
    pub fn delete(&self, user_id: UserId, file_id: FileId) -> DriveResult<Vec<FileRecord>> {
        let record = self.get_owned(user_id, file_id)?;
        let removed = self.store.tombstone(record.id, Utc::now())?;
        info!("Deleted {} ({} records) for user {}", record.name, removed.len(), user_id);
        Ok(removed)
    }

    pub fn delete_path(&self, user_id: UserId, path: &str) -> DriveResult<Vec<FileRecord>> {
        let record = self.resolve(user_id, path)?;
        self.delete(user_id, record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::metadata::Group;

    fn tree() -> VirtualTree {
        let store = Arc::new(MockMetadataStore::new());
        store
            .put_group(&Group { id: 1, name: "g".into(), max_storage: 100, policy_ids: vec![] })
            .unwrap();
        store.ensure_user(1, 1, Utc::now()).unwrap();
        store.ensure_user(2, 1, Utc::now()).unwrap();
        VirtualTree::new(store)
    }

    #[test]
    fn test_mkdir_and_resolve() {
        let tree = tree();
        tree.mkdir(1, "/docs").unwrap();
        let nested = tree.mkdir(1, "/docs/2024").unwrap();

        assert_eq!(tree.resolve(1, "/docs/2024/").unwrap().id, nested.id);
        assert!(tree.resolve(1, "/").unwrap().parent_id.is_none());
        assert!(matches!(tree.resolve(1, "/docs/missing"), Err(DriveError::NotFound(_))));
        assert!(matches!(tree.resolve(2, "/docs"), Err(DriveError::NotFound(_))));
        assert!(matches!(tree.mkdir(1, "/nope/child"), Err(DriveError::NotFound(_))));
        assert!(matches!(tree.mkdir(1, "/docs"), Err(DriveError::Conflict(_))));
    }

    #[test]
    fn test_move_and_rename() {
        let tree = tree();
        tree.mkdir(1, "/a").unwrap();
        tree.mkdir(1, "/b").unwrap();

        let moved = tree.move_path(1, "/a", "/b/renamed").unwrap();
        assert_eq!(moved.name, "renamed");
        assert!(tree.resolve(1, "/b/renamed").is_ok());
        assert!(tree.resolve(1, "/a").is_err());

        let err = tree.move_path(1, "/b", "/b/renamed/b").unwrap_err();
        assert!(matches!(err, DriveError::InvalidRequest(_)));
        assert!(matches!(tree.move_path(1, "/b", "/bad\\name"), Err(DriveError::NamingRejected(_))));
    }

    #[test]
    fn test_delete_is_owner_scoped() {
        let tree = tree();
        let dir = tree.mkdir(1, "/private").unwrap();
        assert!(matches!(tree.delete(2, dir.id), Err(DriveError::NotFound(_))));
        assert_eq!(tree.delete_path(1, "/private").unwrap().len(), 1);
        assert!(tree.list(1, "/").unwrap().is_empty());
    }

    #[test]
    fn test_file_view_hides_backend_key() {
        let record = FileRecord {
            id: 5,
            owner_id: 1,
            parent_id: Some(1),
            name: "a.txt".into(),
            kind: FileKind::File,
            size: 3,
            policy_id: Some(1),
            backend_key: Some("secret/key".into()),
            content_hash: None,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let json = serde_json::to_string(&FileView::from(&record)).unwrap();
        assert!(!json.contains("secret/key"));
        assert!(json.contains("\"createdAt\""));
    }
}
