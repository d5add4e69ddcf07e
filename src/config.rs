//! Application Configuration
//!
//! YAML configuration with defaults for every section. The file is taken
//! from `DRIVE_CONFIG`, then `config.yaml`; without either the defaults
//! describe a single-node drive with one local policy.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

use crate::error::{DriveError, DriveResult};
use crate::ingest::sweeper::SweeperConfig;
use crate::metadata::config::MetadataConfig;
use crate::metadata::{Group, GroupId};
use crate::policy::StoragePolicy;
use crate::storage::config::StorageConfig;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Group new users land in
    #[serde(default = "default_group_id")]
    pub default_group: GroupId,
    /// Seeded into the metadata store at startup
    #[serde(default = "default_groups")]
    pub groups: Vec<Group>,
    /// Seeded into the metadata store at startup
    #[serde(default = "default_policies")]
    pub policies: Vec<StoragePolicy>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum payload size in bytes
    pub max_payload_size: usize,
    /// Externally reachable base URL, used in chunk and callback URLs
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9710,
            workers: 4,
            max_payload_size: 64 * 1024 * 1024,
            public_base_url: "http://127.0.0.1:9710".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Path to the log4rs configuration file
    pub config_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { config_file: "server_log.yaml".to_string() }
    }
}

fn default_group_id() -> GroupId {
    1
}

fn default_groups() -> Vec<Group> {
    vec![Group {
        id: default_group_id(),
        name: "default".to_string(),
        max_storage: 1024 * 1024 * 1024,
        policy_ids: vec![1],
    }]
}

fn default_policies() -> Vec<StoragePolicy> {
    vec![StoragePolicy::local(1, "local")]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            storage: StorageConfig::default(),
            sweeper: SweeperConfig::default(),
            logging: LoggingConfig::default(),
            default_group: default_group_id(),
            groups: default_groups(),
            policies: default_policies(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file, use defaults if not found
    pub fn load() -> DriveResult<Self> {
        let path = env::var("DRIVE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        if Path::new(&path).exists() {
            let config = Self::from_file(Path::new(&path))?;
            info!("Loaded configuration from {}", path);
            Ok(config)
        } else {
            warn!("Config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> DriveResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> DriveResult<Self> {
        let config: AppConfig = serde_yaml::from_str(content)
            .map_err(|e| DriveError::InvalidRequest(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks serde cannot express.
    pub fn validate(&self) -> DriveResult<()> {
        if !self.groups.iter().any(|g| g.id == self.default_group) {
            return Err(DriveError::InvalidRequest(format!(
                "default group {} is not configured",
                self.default_group
            )));
        }
        for policy in &self.policies {
            policy.validate()?;
        }
        for group in &self.groups {
            if let Some(missing) = group.policy_ids.iter().find(|id| !self.policies.iter().any(|p| p.id == **id)) {
                return Err(DriveError::InvalidRequest(format!(
                    "group {} references unknown policy {}",
                    group.name, missing
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::BackendKind;

    #[test]
    fn test_defaults_are_consistent() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9710);
        assert_eq!(config.policies[0].kind, BackendKind::Local);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
server:
  host: 0.0.0.0
  port: 8080
  workers: 2
  max_payload_size: 1048576
  public_base_url: https://drive.example
policies:
  - id: 1
    name: local
    kind: local
  - id: 2
    name: kodo
    kind: qiniu
    bucket: media
    access_key: ak
    secret: sk
    conflict_rule: rename
groups:
  - id: 1
    name: default
    max_storage: 1000
    policy_ids: [1, 2]
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.public_base_url, "https://drive.example");
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies[1].kind, BackendKind::Qiniu);
        assert_eq!(config.sweeper.interval_secs, 60);
        assert_eq!(config.metadata.db_path, "./data/metadata.db");
    }

    #[test]
    fn test_unknown_policy_in_group() {
        let yaml = r#"
groups:
  - id: 1
    name: default
    max_storage: 1000
    policy_ids: [5]
"#;
        assert!(matches!(AppConfig::from_yaml(yaml), Err(DriveError::InvalidRequest(_))));
    }

    #[test]
    fn test_key_template_without_unique_part() {
        let yaml = r#"
policies:
  - id: 1
    name: local
    kind: local
    key_template: "{uid}/{originname}"
"#;
        assert!(matches!(AppConfig::from_yaml(yaml), Err(DriveError::InvalidRequest(_))));
    }
}
