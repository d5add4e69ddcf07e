//! Upload session state machine.
//!
//! `UploadStatus::apply` is the only place that decides whether a transition
//! is legal. Stores persist the status as text and perform the matching
//! compare-and-set, so a transition computed here is either applied exactly
//! once or lost to a concurrent writer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DriveError, DriveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Issued,
    Chunking,
    AwaitingCallback,
    Committed,
    Aborted,
}

/// Inputs that drive a session forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    /// Credentials for a non-local backend were handed to the client.
    CredentialsIssued,
    /// A chunk landed on the local assembler.
    ChunkReceived,
    /// Finalize succeeded or a verified callback arrived.
    Completed,
    /// Owner cancelled, or the commit could not be applied.
    Cancelled,
    /// The sweeper found the session past its `expires_at`.
    Expired,
}

impl UploadEvent {
    pub fn name(self) -> &'static str {
        match self {
            UploadEvent::CredentialsIssued => "credentials_issued",
            UploadEvent::ChunkReceived => "chunk_received",
            UploadEvent::Completed => "completed",
            UploadEvent::Cancelled => "cancelled",
            UploadEvent::Expired => "expired",
        }
    }
}

impl UploadStatus {
    pub const LIVE: [UploadStatus; 3] = [
        UploadStatus::Issued,
        UploadStatus::Chunking,
        UploadStatus::AwaitingCallback,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Committed | UploadStatus::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Issued => "issued",
            UploadStatus::Chunking => "chunking",
            UploadStatus::AwaitingCallback => "awaiting_callback",
            UploadStatus::Committed => "committed",
            UploadStatus::Aborted => "aborted",
        }
    }

    /// Compute the status after `event`.
    ///
    /// Returning `self` unchanged means the event is an idempotent replay
    /// (a second completion of a committed session, a second expiry of an
    /// aborted one) and callers must not repeat side effects.
    pub fn apply(self, event: UploadEvent) -> DriveResult<UploadStatus> {
        use UploadEvent::*;
        use UploadStatus::*;

        let next = match (self, event) {
            (Issued, CredentialsIssued) => AwaitingCallback,
            (Issued, ChunkReceived) | (Chunking, ChunkReceived) => Chunking,
            (Chunking, Completed) | (AwaitingCallback, Completed) => Committed,
            (Committed, Completed) => Committed,
            (Issued, Cancelled) | (Chunking, Cancelled) | (AwaitingCallback, Cancelled) => Aborted,
            (Issued, Expired) | (Chunking, Expired) | (AwaitingCallback, Expired) => Aborted,
            (Aborted, Expired) | (Aborted, Cancelled) => Aborted,
            (from, event) => {
                return Err(DriveError::IllegalTransition { from, event: event.name() });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issued" => Ok(UploadStatus::Issued),
            "chunking" => Ok(UploadStatus::Chunking),
            "awaiting_callback" => Ok(UploadStatus::AwaitingCallback),
            "committed" => Ok(UploadStatus::Committed),
            "aborted" => Ok(UploadStatus::Aborted),
            _ => Err(format!("Unknown upload status: {}", s)),
        }
    }
}
