//! Error taxonomy shared by every layer of the upload engine.
//!
//! Handlers keep returning `Result<HttpResponse, actix_web::Error>`; a
//! `DriveError` converts through `ResponseError` so `?` works everywhere.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::ingest::state::UploadStatus;

pub type DriveResult<T> = Result<T, DriveError>;

#[derive(Debug, Error)]
pub enum DriveError {
    /// Reservation would push the user past the group quota.
    #[error("quota exceeded: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("storage policy {0} not found")]
    PolicyNotFound(i64),

    /// Name fails validation or the policy's extension rules.
    #[error("name rejected: {0}")]
    NamingRejected(String),

    #[error("file size {size} exceeds policy limit {max}")]
    FileTooLarge { size: u64, max: u64 },

    /// Destination slot already occupied.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("upload session {0} expired")]
    SessionExpired(String),

    #[error("upload session {0} not found")]
    SessionNotFound(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Finalize was called before every chunk arrived.
    #[error("upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("illegal transition from {from} on {event}")]
    IllegalTransition { from: UploadStatus, event: &'static str },

    #[error("storage error: {0}")]
    Storage(String),
}

impl DriveError {
    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DriveError::QuotaExceeded { .. } => "quota_exceeded",
            DriveError::PolicyNotFound(_) => "policy_not_found",
            DriveError::NamingRejected(_) => "naming_rejected",
            DriveError::FileTooLarge { .. } => "file_too_large",
            DriveError::Conflict(_) => "conflict",
            DriveError::SignatureInvalid(_) => "signature_invalid",
            DriveError::SessionExpired(_) => "session_expired",
            DriveError::SessionNotFound(_) => "session_not_found",
            DriveError::BackendUnavailable(_) => "backend_unavailable",
            DriveError::IncompleteUpload { .. } => "incomplete_upload",
            DriveError::NotFound(_) => "not_found",
            DriveError::InvalidRequest(_) => "invalid_request",
            DriveError::IllegalTransition { .. } => "illegal_transition",
            DriveError::Storage(_) => "storage_error",
        }
    }
}

impl ResponseError for DriveError {
    fn status_code(&self) -> StatusCode {
        match self {
            DriveError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            DriveError::PolicyNotFound(_) | DriveError::NotFound(_) => StatusCode::NOT_FOUND,
            DriveError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            DriveError::NamingRejected(_) | DriveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DriveError::IncompleteUpload { .. } => StatusCode::BAD_REQUEST,
            DriveError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            DriveError::Conflict(_) | DriveError::IllegalTransition { .. } => StatusCode::CONFLICT,
            DriveError::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            DriveError::SessionExpired(_) => StatusCode::GONE,
            DriveError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            DriveError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}

impl From<rusqlite::Error> for DriveError {
    fn from(err: rusqlite::Error) -> Self {
        DriveError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for DriveError {
    fn from(err: std::io::Error) -> Self {
        DriveError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(err: serde_json::Error) -> Self {
        DriveError::Storage(format!("serialization failed: {}", err))
    }
}

impl From<reqwest::Error> for DriveError {
    fn from(err: reqwest::Error) -> Self {
        DriveError::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = DriveError::QuotaExceeded { required: 10, available: 5 };
        assert_eq!(err.status_code(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(err.code(), "quota_exceeded");

        assert_eq!(DriveError::SignatureInvalid("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(DriveError::SessionExpired("s".into()).status_code(), StatusCode::GONE);
        assert!(DriveError::SessionNotFound("s".into()).status_code().is_client_error());
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: DriveError = io.into();
        assert!(matches!(err, DriveError::Storage(msg) if msg.contains("disk gone")));
    }
}
