//! Application State Management
//!
//! Builds every component from configuration and wires them together, so
//! handlers only ever see `AppState`.

use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::chunk::ChunkAssembler;
use crate::config::AppConfig;
use crate::credential::onedrive::{GraphDrive, MockRemoteDrive, RemoteDrive};
use crate::credential::oss::{HttpKeyFetcher, PublicKeyFetcher, StaticKeyFetcher};
use crate::credential::DriverSet;
use crate::error::DriveResult;
use crate::ingest::{IngestionCoordinator, UploadSweeper};
use crate::metadata::config::MetadataBackend;
use crate::metadata::MetadataStorage;
use crate::policy::registry::PolicyRegistry;
use crate::quota::QuotaLedger;
use crate::storage::config::StorageBackend;
use crate::storage::ObjectStore;

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IngestionCoordinator>,
    pub sweeper: Arc<UploadSweeper>,
    pub store: Arc<dyn MetadataStorage>,
    pub objects: Arc<dyn ObjectStore>,
    pub config: AppConfig,
}

/// Provider-facing collaborators that tests replace.
pub struct ProviderClients {
    pub http: reqwest::Client,
    pub key_fetcher: Arc<dyn PublicKeyFetcher>,
    pub remote_drive: Arc<dyn RemoteDrive>,
}

impl ProviderClients {
    pub fn live() -> Self {
        let http = reqwest::Client::new();
        Self {
            key_fetcher: Arc::new(HttpKeyFetcher::new(http.clone())),
            remote_drive: Arc::new(GraphDrive::new(http.clone())),
            http,
        }
    }

    /// No outbound traffic for signature-verified backends.
    pub fn offline() -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            http,
            key_fetcher: Arc::new(StaticKeyFetcher::new("")),
            remote_drive: Arc::new(MockRemoteDrive::new()),
        }
    }
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> DriveResult<Self> {
        Self::build(config, ProviderClients::live())
    }

    pub fn build(config: AppConfig, clients: ProviderClients) -> DriveResult<Self> {
        info!("Initializing application state with configuration");
        config.validate()?;

        let store = config.metadata.clone().with_env_override().create_store()?;
        let objects = config.storage.clone().with_env_override().create_store()?;
        Self::assemble(config, store, objects, clients)
    }

    fn assemble(
        config: AppConfig,
        store: Arc<dyn MetadataStorage>,
        objects: Arc<dyn ObjectStore>,
        clients: ProviderClients,
    ) -> DriveResult<Self> {
        let registry = Arc::new(PolicyRegistry::load(store.clone())?);
        for policy in &config.policies {
            registry.upsert(policy.clone())?;
        }
        let quota = Arc::new(QuotaLedger::new(store.clone(), config.default_group));
        for group in &config.groups {
            quota.set_group(group)?;
        }

        let drivers = Arc::new(DriverSet::standard(
            objects.clone(),
            clients.http,
            clients.key_fetcher,
            clients.remote_drive,
        ));
        let assembler = Arc::new(ChunkAssembler::new(Path::new(&config.storage.temp_path))?);
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            registry.clone(),
            quota,
            drivers.clone(),
            objects.clone(),
            assembler,
            &config.server.public_base_url,
        ));
        let sweeper = Arc::new(UploadSweeper::new(
            coordinator.clone(),
            store.clone(),
            registry,
            drivers,
            config.sweeper.clone(),
        ));

        info!("Application state initialized successfully");
        Ok(Self { coordinator, sweeper, store, objects, config })
    }

    /// Mock backends and scratch space under `scratch`.
    pub fn new_for_testing(mut config: AppConfig, scratch: &Path, clients: ProviderClients) -> DriveResult<Self> {
        config.metadata.backend = MetadataBackend::Mock;
        config.storage.backend = StorageBackend::Mock;
        config.storage.temp_path = scratch.to_string_lossy().into_owned();
        let store = config.metadata.create_store()?;
        let objects = config.storage.create_store()?;
        Self::assemble(config, store, objects, clients)
    }
}
