//! Failure taxonomy shared by every component boundary.
//!
//! Module errors stay specific (`ClientError`, `LifecycleError`, ...) and are
//! classified into an [`ErrorKind`] when they become a `HandlerResult`, which
//! is what the dispatcher and the health aggregator act on.

use serde::{Deserialize, Serialize};

/// How a failure should be treated by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network timeout or upstream 5xx. Already retried inside the client.
    Transient,
    /// Upstream asked us to slow down. The event is deferred, not retried now.
    RateLimited,
    /// Malformed note or missing field. Logged, note left for manual review.
    Permanent,
    /// Rejected status change. Nothing was written.
    InvalidTransition,
    /// Disk full, queue full, circuit open. The component reports itself unhealthy.
    ResourceExhaustion,
    /// Work aborted by shutdown or a handler panic.
    Cancelled,
}

impl ErrorKind {
    /// Whether the dispatcher should re-submit the event later.
    pub fn is_deferrable(self) -> bool {
        matches!(self, ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Permanent => "permanent",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Classify an I/O error from note or cache writes.
pub fn classify_io(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::StorageFull | Io::QuotaExceeded | Io::OutOfMemory => ErrorKind::ResourceExhaustion,
        Io::NotFound | Io::InvalidData | Io::PermissionDenied => ErrorKind::Permanent,
        _ => ErrorKind::Transient,
    }
}
