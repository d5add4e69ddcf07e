//! Storage policies: which backend holds a file, with what credentials and
//! under which constraints.

pub mod registry;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DriveError, DriveResult};

pub type PolicyId = i64;

/// Closed set of supported backends. Adding a backend means adding a
/// variant here and a driver in `credential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Oss,
    Qiniu,
    Upyun,
    OneDrive,
    Remote,
}

impl BackendKind {
    pub const ALL: [BackendKind; 7] = [
        BackendKind::Local,
        BackendKind::S3,
        BackendKind::Oss,
        BackendKind::Qiniu,
        BackendKind::Upyun,
        BackendKind::OneDrive,
        BackendKind::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Oss => "oss",
            BackendKind::Qiniu => "qiniu",
            BackendKind::Upyun => "upyun",
            BackendKind::OneDrive => "onedrive",
            BackendKind::Remote => "remote",
        }
    }

    /// Bytes pass through the application server only for the local backend.
    pub fn is_local(self) -> bool {
        self == BackendKind::Local
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown backend kind: {}", s))
    }
}

/// What to do when a commit finds its destination slot already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictRule {
    #[default]
    Fail,
    Rename,
    Replace,
}

/// Extension allow/deny lists. Empty allow list means "anything not denied".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NamingRule {
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub denied_extensions: Vec<String>,
}

impl NamingRule {
    pub fn check(&self, name: &str) -> DriveResult<()> {
        let ext = extension_of(name).map(|e| e.to_lowercase());
        let matches = |list: &[String]| match &ext {
            Some(ext) => list.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext)),
            None => false,
        };

        if matches(&self.denied_extensions) {
            return Err(DriveError::NamingRejected(format!("extension of '{}' is not allowed", name)));
        }
        if !self.allowed_extensions.is_empty() && !matches(&self.allowed_extensions) {
            return Err(DriveError::NamingRejected(format!("extension of '{}' is not in the allow list", name)));
        }
        Ok(())
    }
}

fn extension_of(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_upload_window() -> u64 {
    3600
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Placeholders that make a rendered key unique per upload.
const UNIQUE_KEY_PARTS: [&str; 2] = ["{session}", "{randomkey8}"];

fn default_key_template() -> String {
    "{uid}/{date}/{session}_{originname}".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub id: PolicyId,
    pub name: String,
    pub kind: BackendKind,
    /// Provider endpoint or remote node base URL. Unused by `local`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    /// Signing region, only meaningful for `s3`.
    #[serde(default = "default_region")]
    pub region: String,
    /// Access key id / operator name, depending on the backend.
    #[serde(default)]
    pub access_key: String,
    /// Credential secret used for signing credentials and verifying callbacks.
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub naming: NamingRule,
    #[serde(default = "default_key_template")]
    pub key_template: String,
    /// Upper bound for a single file in bytes, 0 for unlimited.
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub allowed_origin: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_upload_window")]
    pub upload_window_secs: u64,
    #[serde(default)]
    pub conflict_rule: ConflictRule,
}

impl StoragePolicy {
    /// A local-disk policy with defaults, mostly useful in tests and as the
    /// fallback policy seeded into a fresh configuration.
    pub fn local(id: PolicyId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind: BackendKind::Local,
            endpoint: String::new(),
            bucket: String::new(),
            region: default_region(),
            access_key: String::new(),
            secret: String::new(),
            naming: NamingRule::default(),
            key_template: default_key_template(),
            max_file_size: 0,
            allowed_origin: None,
            chunk_size: default_chunk_size(),
            upload_window_secs: default_upload_window(),
            conflict_rule: ConflictRule::Fail,
        }
    }

    /// Reject settings that would let two uploads render the same key.
    pub fn validate(&self) -> DriveResult<()> {
        if !UNIQUE_KEY_PARTS.iter().any(|part| self.key_template.contains(part)) {
            return Err(DriveError::InvalidRequest(format!(
                "policy {}: key_template '{}' must contain {} or {}",
                self.id, self.key_template, UNIQUE_KEY_PARTS[0], UNIQUE_KEY_PARTS[1]
            )));
        }
        Ok(())
    }

    /// Equal apart from the credentials, the only edit a referenced
    /// policy accepts.
    pub fn same_except_credentials(&self, other: &StoragePolicy) -> bool {
        let mut other = other.clone();
        other.access_key = self.access_key.clone();
        other.secret = self.secret.clone();
        *self == other
    }

    pub fn check_size(&self, size: u64) -> DriveResult<()> {
        if self.max_file_size > 0 && size > self.max_file_size {
            return Err(DriveError::FileTooLarge { size, max: self.max_file_size });
        }
        Ok(())
    }

    /// Render the opaque backend key for a new upload.
    pub fn render_key(&self, user_id: i64, session_id: &str, name: &str, now: DateTime<Utc>) -> String {
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let key = self
            .key_template
            .replace("{uid}", &user_id.to_string())
            .replace("{session}", session_id)
            .replace("{date}", &now.format("%Y%m%d").to_string())
            .replace("{timestamp}", &now.timestamp().to_string())
            .replace("{randomkey8}", &random)
            .replace("{ext}", extension_of(name).unwrap_or(""))
            .replace("{originname}", name);
        key.trim_start_matches('/').to_string()
    }
}
