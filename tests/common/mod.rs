//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notewatch::Settings;
use notewatch::client::{BackendError, EnrichmentBackend, EnrichmentRequest, EnrichmentResponse, Quote};
use parking_lot::Mutex;

/// Scripted backend: canned answers per operation, every call recorded.
#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<(&'static str, Instant)>>,
    failures: Mutex<HashMap<&'static str, BackendError>>,
    delay: Duration,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    /// Every call to `operation` fails with `error` from now on.
    pub fn fail(&self, operation: &'static str, error: BackendError) {
        self.failures.lock().insert(operation, error);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|(op, _)| *op == operation).count()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl EnrichmentBackend for MockBackend {
    async fn invoke(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError> {
        let operation = request.operation();
        self.calls.lock().push((operation, Instant::now()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().get(operation) {
            return Err(err.clone());
        }

        Ok(match request {
            EnrichmentRequest::DescribeImage { .. } => EnrichmentResponse::Description {
                description: "Meeting notes".to_string(),
                text: "Q3 goals\nHire two engineers".to_string(),
            },
            EnrichmentRequest::TranscriptQuotes { .. } => EnrichmentResponse::Quotes {
                title: Some("Talk".to_string()),
                quotes: vec![
                    Quote {
                        timestamp_secs: 12,
                        text: "Start with the data.".to_string(),
                    },
                    Quote {
                        timestamp_secs: 95,
                        text: "Small steps compound.".to_string(),
                    },
                ],
            },
            EnrichmentRequest::Embed { text } => EnrichmentResponse::Embedding {
                vector: vec![text.len() as f32, 1.0],
            },
        })
    }
}

/// Settings that keep every file of the daemon inside `dir`.
pub fn settings_in(dir: &Path, vault: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.daemon.pid_file = dir.join("notewatch.pid");
    settings.daemon.status_path = dir.join("health.json");
    settings.daemon.status_interval_ms = 100;
    settings.daemon.state_dir = dir.join("state");
    settings.cache.dir = dir.join("cache");
    settings.watch.roots = vec![vault.to_path_buf()];
    settings.watch.poll = true;
    settings.watch.poll_interval_ms = 50;
    settings.watch.debounce_ms = 150;
    settings.dispatch.shutdown_grace_ms = 1_000;
    for service in settings.services.values_mut() {
        service.cooldown_ms = 0;
        service.backoff_base_ms = 1;
    }
    settings
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
