//! Metadata backend selection. `METADATA_BACKEND` overrides the YAML choice
//! so the same config file can run against the mock store.

use crate::error::DriveResult;
use crate::metadata::{mock_store::MockMetadataStore, sqlite_store::SQLiteMetadataStore, MetadataStorage};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::Arc;

/// Available metadata storage backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum MetadataBackend {
    #[default]
    SQLite,
    Mock,
}

impl std::str::FromStr for MetadataBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(MetadataBackend::SQLite),
            "mock" => Ok(MetadataBackend::Mock),
            _ => Err(format!("Unknown metadata backend: {}", s)),
        }
    }
}

fn default_db_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_wal_mode() -> bool {
    true
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

/// Configuration for metadata storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub backend: MetadataBackend,
    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Enable WAL mode
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::default(),
            db_path: default_db_path(),
            wal_mode: default_wal_mode(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl MetadataConfig {
    /// Apply the `METADATA_BACKEND` environment override, keeping the
    /// configured backend when the variable is unset or invalid.
    pub fn with_env_override(mut self) -> Self {
        if let Ok(backend_str) = env::var("METADATA_BACKEND") {
            match backend_str.parse::<MetadataBackend>() {
                Ok(backend) => {
                    info!("Using metadata backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!("Invalid metadata backend in environment: {}. Keeping {:?}.", e, self.backend);
                }
            }
        }
        self
    }

    /// Create a metadata storage instance based on the configuration
    pub fn create_store(&self) -> DriveResult<Arc<dyn MetadataStorage>> {
        match self.backend {
            MetadataBackend::SQLite => {
                info!("Creating SQLite metadata store at {} (wal: {})", self.db_path, self.wal_mode);
                let store = SQLiteMetadataStore::open(Path::new(&self.db_path), self.wal_mode, self.busy_timeout_ms)?;
                Ok(Arc::new(store))
            }
            MetadataBackend::Mock => {
                info!("Creating Mock metadata store");
                Ok(Arc::new(MockMetadataStore::new()))
            }
        }
    }
}
