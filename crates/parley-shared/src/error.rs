use thiserror::Error;

use crate::types::Scope;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Scope is not open: {0}")]
    ScopeNotOpen(Scope),

    #[error("Push transport is gone")]
    TransportClosed,

    #[error("Sync engine is not running")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure of the send operation. Always surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Message rejected by backend: {0}")]
    Rejected(String),

    #[error("Send abandoned before completion")]
    Abandoned,
}

/// Failure of a read against the backend (seed load, profile fetch).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Fetch timed out")]
    Timeout,
}

/// A change event that cannot be decoded or routed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed change event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Row does not belong to scope {scope}: {reason}")]
    ScopeMismatch { scope: Scope, reason: String },
}
