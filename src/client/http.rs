//! HTTP implementation of [`EnrichmentBackend`].
//!
//! Each operation is a POST to `<base_url>/<operation>`. Images are sent as
//! the raw request body, everything else as JSON. The response body is an
//! [`EnrichmentResponse`] in JSON.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};

use super::backend::{EnrichmentBackend, EnrichmentRequest, EnrichmentResponse};
use super::error::BackendError;
use crate::config::ServiceConfig;

/// Retry delay used when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &ServiceConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn url(&self, request: &EnrichmentRequest) -> String {
        format!("{}/{}", self.base_url, request.operation())
    }
}

#[async_trait]
impl EnrichmentBackend for HttpBackend {
    async fn invoke(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError> {
        let mut builder = self.client.post(self.url(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        builder = match request {
            EnrichmentRequest::DescribeImage { path, bytes } => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .query(&[("file_name", path.file_name().map(|n| n.to_string_lossy()))])
                .body(bytes.clone()),
            other => builder.json(other),
        };

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(BackendError::RateLimited(retry_after));
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status(status.as_u16(), truncate(&body, 200)));
        }

        resp.json::<EnrichmentResponse>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are not supported.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_url_per_operation() {
        let config = ServiceConfig {
            base_url: "http://localhost:9000/".to_string(),
            ..Default::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        let request = EnrichmentRequest::Embed {
            text: "hello".to_string(),
        };
        assert_eq!(backend.url(&request), "http://localhost:9000/embed");
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(300);
        assert_eq!(truncate(&body, 5), "xxxxx...");
        assert_eq!(truncate("short", 200), "short");
    }
}
