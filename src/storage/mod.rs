//! Object Storage Layer Abstraction
//!
//! Bytes of files kept on the `local` backend live behind `ObjectStore`,
//! addressed by the opaque backend key of their file record. The disk store
//! is the production implementation; the mock keeps objects in memory.

pub mod local_store;
pub mod mock_store;
pub mod config;


use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::DriveResult;

/// Trait defining the object storage interface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Move an assembled file into the store under `key`. Returns its size.
    async fn put_file(&self, key: &str, source: &Path) -> DriveResult<u64>;

    async fn get(&self, key: &str) -> DriveResult<Bytes>;

    /// Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> DriveResult<()>;
}
