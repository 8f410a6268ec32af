//! Outcome of one handler invocation.

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;
use crate::error::{ErrorKind, classify_io};
use crate::notes::LifecycleError;

/// Timing and volume of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HandlerMetrics {
    pub duration: Duration,
    pub bytes_processed: u64,
}

/// Typed failure carried inside a [`HandlerResult`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set for rate limited failures; the dispatcher re-submits after this.
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }
}

impl From<ClientError> for HandlerError {
    fn from(e: ClientError) -> Self {
        let retry_after = e.retry_after();
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retry_after,
        }
    }
}

impl From<LifecycleError> for HandlerError {
    fn from(e: LifecycleError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(classify_io(&e), e.to_string())
    }
}

/// What a handler reports back to the dispatcher and the health aggregator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerResult {
    pub success: bool,
    /// Whether a note was created or modified.
    pub changed: bool,
    pub metrics: HandlerMetrics,
    pub error: Option<HandlerError>,
    /// A non-critical sub-step failed while the primary work succeeded.
    pub optional_step_failed: bool,
}

impl HandlerResult {
    pub fn changed() -> Self {
        Self {
            success: true,
            changed: true,
            ..Default::default()
        }
    }

    /// Successful no-op (e.g. note already processed).
    pub fn unchanged() -> Self {
        Self {
            success: true,
            changed: false,
            ..Default::default()
        }
    }

    pub fn failure(error: HandlerError) -> Self {
        Self {
            success: false,
            changed: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.metrics.duration = duration;
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.metrics.bytes_processed = bytes;
        self
    }

    pub fn with_optional_failure(mut self, failed: bool) -> Self {
        self.optional_step_failed = failed;
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl From<Result<HandlerResult, HandlerError>> for HandlerResult {
    fn from(res: Result<HandlerResult, HandlerError>) -> Self {
        res.unwrap_or_else(HandlerResult::failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_kind() {
        let result = HandlerResult::failure(HandlerError::permanent("missing video_id"));
        assert!(!result.success);
        assert!(!result.changed);
        assert_eq!(result.error_kind(), Some(ErrorKind::Permanent));
    }

    #[test]
    fn test_rate_limited_client_error_keeps_retry_after() {
        let err: HandlerError = ClientError::RateLimited {
            service: "transcript".to_string(),
            retry_after: Duration::from_secs(7),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_builder_sets_metrics() {
        let result = HandlerResult::changed()
            .with_duration(Duration::from_millis(12))
            .with_bytes(2048)
            .with_optional_failure(true);
        assert!(result.success);
        assert_eq!(result.metrics.bytes_processed, 2048);
        assert!(result.optional_step_failed);
    }
}
