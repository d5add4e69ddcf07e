//! Configuration for object storage backends

use crate::error::DriveResult;
use crate::storage::{local_store::LocalObjectStore, mock_store::MockObjectStore, ObjectStore};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

/// Available object storage backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum StorageBackend {
    #[default]
    LocalDisk,
    Mock,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "localdisk" | "local" | "disk" => Ok(StorageBackend::LocalDisk),
            "mock" => Ok(StorageBackend::Mock),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

fn default_base_path() -> String {
    "./data/storage".to_string()
}

fn default_temp_path() -> String {
    "./data/temp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Base path for local objects
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Scratch space for chunked uploads
    #[serde(default = "default_temp_path")]
    pub temp_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            base_path: default_base_path(),
            temp_path: default_temp_path(),
        }
    }
}

impl StorageConfig {
    /// Apply the `STORAGE_BACKEND` environment override.
    pub fn with_env_override(mut self) -> Self {
        if let Ok(backend_str) = env::var("STORAGE_BACKEND") {
            match backend_str.parse::<StorageBackend>() {
                Ok(backend) => {
                    info!("Using storage backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => warn!("Invalid storage backend in environment: {}. Keeping {:?}.", e, self.backend),
            }
        }
        self
    }

    pub fn create_store(&self) -> DriveResult<Arc<dyn ObjectStore>> {
        match self.backend {
            StorageBackend::LocalDisk => {
                info!("Creating local disk object store at {}", self.base_path);
                Ok(Arc::new(LocalObjectStore::new(&self.base_path)?))
            }
            StorageBackend::Mock => {
                info!("Creating mock object store");
                Ok(Arc::new(MockObjectStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::LocalDisk);
        assert_eq!("LocalDisk".parse::<StorageBackend>().unwrap(), StorageBackend::LocalDisk);
        assert_eq!("mock".parse::<StorageBackend>().unwrap(), StorageBackend::Mock);
        assert!("xfs".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_default_config_deserializes_from_empty_yaml() {
        let config: StorageConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.backend, StorageBackend::LocalDisk);
        assert_eq!(config.temp_path, "./data/temp");
    }
}
