//! Core error taxonomy (§7). Kept small and `thiserror`-based; anyhow is
//! used at call-site boundaries where errors are only ever logged or
//! surfaced as a user-visible string, never matched on.

use thiserror::Error;

/// Errors the Job Engine and Scheduler classify explicitly, each with its
/// own retry/cancel policy. Worker-level transport failures are normalized
/// into `NetTransient`/`UrlExpired`/`DestMissing` before reaching the engine;
/// nothing else escapes the core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid URL: {0}")]
    UrlInvalid(String),

    #[error("link expired (404)")]
    UrlExpired,

    #[error("destination file missing")]
    DestMissing,

    #[error("failed to pre-allocate destination: {0}")]
    IoPreAllocFailed(#[source] std::io::Error),

    #[error("transient network error: {0}")]
    NetTransient(#[source] anyhow::Error),

    #[error("network unavailable: {0}")]
    NetUnavailable(String),

    #[error("record corrupt: {0}")]
    RecordCorrupt(String),

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("observer callback failed: {0}")]
    ObserverCallbackFailed(String),
}

impl EngineError {
    /// Whether this error, by policy, should pause the job rather than
    /// cancel it outright with no possibility of automatic recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::NetTransient(_) | EngineError::NetUnavailable(_))
    }
}
