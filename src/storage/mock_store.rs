//! Mock implementation of ObjectStore trait for testing

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DriveError, DriveResult};
use crate::storage::ObjectStore;

/// Mock implementation of ObjectStore for testing
#[derive(Default)]
pub struct MockObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored objects
    pub fn object_count(&self) -> usize {
        self.lock().len()
    }

    /// Place an object directly, returning its size.
    pub fn insert(&self, key: &str, data: Bytes) -> u64 {
        let size = data.len() as u64;
        self.lock().insert(key.to_string(), data);
        size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put_file(&self, key: &str, source: &Path) -> DriveResult<u64> {
        let data = tokio::fs::read(source).await?;
        tokio::fs::remove_file(source).await?;
        Ok(self.insert(key, Bytes::from(data)))
    }

    async fn get(&self, key: &str) -> DriveResult<Bytes> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(format!("object {}", key)))
    }

    async fn delete(&self, key: &str) -> DriveResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}
