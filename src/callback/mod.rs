//! Authenticates provider completion callbacks before anything is committed.
//!
//! The session id in the callback URL is the idempotency anchor: a callback
//! for a session that is already committed is recognized as a replay, and a
//! callback that fails any check leaves every piece of state untouched.

use actix_web::HttpRequest;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::credential::DriverSet;
use crate::error::{DriveError, DriveResult};
use crate::ingest::state::UploadStatus;
use crate::metadata::{FileId, MetadataStorage, PendingUpload};
use crate::policy::registry::PolicyRegistry;
use crate::policy::{BackendKind, PolicyId, StoragePolicy};

/// The parts of an inbound callback a driver may sign over.
#[derive(Debug, Clone, Default)]
pub struct CallbackRequest {
    pub path: String,
    pub query: Option<String>,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CallbackRequest {
    pub fn new(path: impl Into<String>, query: Option<String>, body: Bytes) -> Self {
        Self { path: path.into(), query, headers: HashMap::new(), body }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn from_http(req: &HttpRequest, body: Bytes) -> Self {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();
        let query = Some(req.query_string().to_string()).filter(|q| !q.is_empty());
        Self { path: req.path().to_string(), query, headers, body }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body decoded as `application/x-www-form-urlencoded`.
    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }

    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// What a provider says it stored, once its callback is authenticated.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub key: String,
    pub size: u64,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifiedCompletion {
    pub pending: PendingUpload,
    pub policy: Arc<StoragePolicy>,
    pub size: u64,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Verification {
    /// Authentic callback for a session waiting to be committed.
    Fresh(VerifiedCompletion),
    /// Authentic callback for a session committed earlier.
    Replayed { file_id: FileId },
}

pub struct CallbackVerifier {
    store: Arc<dyn MetadataStorage>,
    registry: Arc<PolicyRegistry>,
    drivers: Arc<DriverSet>,
}

impl CallbackVerifier {
    pub fn new(store: Arc<dyn MetadataStorage>, registry: Arc<PolicyRegistry>, drivers: Arc<DriverSet>) -> Self {
        Self { store, registry, drivers }
    }

    /// Authenticate a callback addressed to `/callback/{kind}/{policy}/{session}`.
    pub async fn verify(
        &self,
        kind: &str,
        policy_id: PolicyId,
        session_id: &str,
        request: &CallbackRequest,
        now: DateTime<Utc>,
    ) -> DriveResult<Verification> {
        let result = self.verify_inner(kind, policy_id, session_id, request, now).await;
        if let Err(e) = &result {
            warn!("Rejected {} callback for session {}: {}", kind, session_id, e);
        }
        result
    }

    async fn verify_inner(
        &self,
        kind: &str,
        policy_id: PolicyId,
        session_id: &str,
        request: &CallbackRequest,
        now: DateTime<Utc>,
    ) -> DriveResult<Verification> {
        let kind: BackendKind = kind.parse().map_err(DriveError::InvalidRequest)?;
        let policy = self.registry.resolve(policy_id)?;
        if policy.kind != kind {
            return Err(DriveError::SignatureInvalid(format!(
                "policy {} is {}, callback claims {}",
                policy_id, policy.kind, kind
            )));
        }

        let pending = self
            .store
            .get_pending(session_id)?
            .filter(|pending| pending.policy_id == policy.id)
            .ok_or_else(|| DriveError::SessionNotFound(session_id.to_string()))?;

        // Authenticate first so unauthenticated callers learn nothing about
        // the session.
        let driver = self.drivers.get(kind)?;
        let report = driver.verify_callback(&policy, &pending, request).await?;

        match pending.status {
            UploadStatus::Committed => {
                let file_id = pending
                    .committed_file_id
                    .ok_or_else(|| DriveError::Storage(format!("committed session {} has no file", session_id)))?;
                debug!("Callback replay for committed session {}", session_id);
                return Ok(Verification::Replayed { file_id });
            }
            UploadStatus::Aborted => return Err(DriveError::SessionNotFound(session_id.to_string())),
            _ => {}
        }
        if pending.is_expired(now) {
            return Err(DriveError::SessionExpired(session_id.to_string()));
        }
        if pending.status != UploadStatus::AwaitingCallback {
            return Err(DriveError::SessionNotFound(session_id.to_string()));
        }
        if report.key != pending.backend_key {
            return Err(DriveError::SessionNotFound(format!(
                "{} (callback names key {})",
                session_id, report.key
            )));
        }

        Ok(Verification::Fresh(VerifiedCompletion {
            pending,
            policy,
            size: report.size,
            content_hash: report.content_hash,
        }))
    }
}
