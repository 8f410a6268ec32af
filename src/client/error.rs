//! Error types for outbound enrichment calls.

use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;

/// What a backend reported for one attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("HTTP {0}: {1}")]
    Status(u16, String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether the client should retry this attempt with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout | BackendError::Transport(_) => true,
            BackendError::Status(status, _) => *status >= 500,
            BackendError::RateLimited(_) | BackendError::InvalidResponse(_) => false,
        }
    }
}

/// Typed failure returned by [`RateLimitedClient::fetch_with_retry`](super::RateLimitedClient::fetch_with_retry).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("{service} rate limited, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Duration,
    },

    #[error("{service} timed out")]
    Timeout { service: String },

    #[error("{service} upstream error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    UpstreamError {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{service} circuit open, retry in {retry_in:?}")]
    CircuitOpen {
        service: String,
        retry_in: Duration,
    },
}

impl ClientError {
    pub(crate) fn from_backend(service: &str, err: BackendError) -> Self {
        let service = service.to_string();
        match err {
            BackendError::Timeout => ClientError::Timeout { service },
            BackendError::RateLimited(retry_after) => ClientError::RateLimited {
                service,
                retry_after,
            },
            BackendError::Status(status, message) => ClientError::UpstreamError {
                service,
                status: Some(status),
                message,
            },
            BackendError::Transport(message) | BackendError::InvalidResponse(message) => {
                ClientError::UpstreamError {
                    service,
                    status: None,
                    message,
                }
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::RateLimited { .. } => ErrorKind::RateLimited,
            ClientError::Timeout { .. } => ErrorKind::Transient,
            ClientError::UpstreamError {
                status: Some(status),
                ..
            } if *status < 500 => ErrorKind::Permanent,
            ClientError::UpstreamError { .. } => ErrorKind::Transient,
            ClientError::CircuitOpen { .. } => ErrorKind::ResourceExhaustion,
        }
    }

    /// When the caller may try again, if the error says so.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::RateLimited { retry_after, .. } => Some(*retry_after),
            ClientError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}
