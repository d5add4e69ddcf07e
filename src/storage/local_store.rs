//! Local disk object storage implementation

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::error::{DriveError, DriveResult};
use crate::storage::ObjectStore;

/// Objects are plain files below `base_path`, one per backend key.
pub struct LocalObjectStore {
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> DriveResult<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        info!("Using local object storage directory: {}", base_path.display());
        Ok(Self { base_path })
    }

    /// Map a key onto a path, refusing anything that would leave the base
    /// directory.
    fn object_path(&self, key: &str) -> DriveResult<PathBuf> {
        let relative = Path::new(key);
        let mut has_segment = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => has_segment = true,
                _ => return Err(DriveError::InvalidRequest(format!("invalid object key '{}'", key))),
            }
        }
        if !has_segment {
            return Err(DriveError::InvalidRequest("empty object key".to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    async fn prepare_parent(path: &Path) -> DriveResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_file(&self, key: &str, source: &Path) -> DriveResult<u64> {
        let target = self.object_path(key)?;
        Self::prepare_parent(&target).await?;
        // Scratch and objects usually share a volume; fall back to a copy
        // when they don't.
        if fs::rename(source, &target).await.is_err() {
            fs::copy(source, &target).await?;
            fs::remove_file(source).await?;
        }
        let size = fs::metadata(&target).await?.len();
        debug!("Stored object {} ({} bytes)", key, size);
        Ok(size)
    }

    async fn get(&self, key: &str) -> DriveResult<Bytes> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DriveError::NotFound(format!("object {}", key))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> DriveResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted object {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_file_moves_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects")).unwrap();
        let source = dir.path().join("assembled");
        std::fs::write(&source, b"hello").unwrap();

        assert_eq!(store.put_file("7/20240101/a.txt", &source).await.unwrap(), 5);
        assert!(!source.exists());
        assert_eq!(store.get("7/20240101/a.txt").await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("objects")).unwrap();
        let source = dir.path().join("assembled");
        std::fs::write(&source, b"x").unwrap();
        assert!(store.put_file("../outside", &source).await.is_err());
        assert!(store.put_file("/etc/passwd", &source).await.is_err());
        assert!(source.exists());
        assert!(store.get("").await.is_err());
    }
}
