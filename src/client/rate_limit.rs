//! Cooldown, backoff and circuit breaking around an [`EnrichmentBackend`].
//!
//! Every attempt (first try or retry) reserves a send slot under the state
//! lock, so two requests to the same service are always at least
//! `cooldown_ms` apart no matter how many callers race. Waiting for a slot or
//! a backoff only suspends the calling task. The circuit is checked again
//! once the slot arrives, so callers queued behind the cooldown fail fast if
//! it opened while they waited.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::prelude::*;
use tokio::time::Instant;

use super::backend::{EnrichmentBackend, EnrichmentRequest, EnrichmentResponse};
use super::error::{BackendError, ClientError};
use crate::config::ServiceConfig;
use crate::health::HealthAggregator;
use crate::utils::{get_utc_timestamp_ms, write_atomic};

/// File name of the persisted request timestamps inside the state dir.
pub const RATE_LIMIT_FILE: &str = "rate_limits.json";

/// Durable `last_request_at` per service, in UTC milliseconds.
///
/// Shared by every client so that one file holds all services.
#[derive(Debug)]
pub struct RateLimitStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, i64>>,
}

impl RateLimitStore {
    /// Load the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Store at `<state_dir>/rate_limits.json`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::open(state_dir.join(RATE_LIMIT_FILE))
    }

    pub fn last_request_at(&self, service: &str) -> Option<i64> {
        self.entries.lock().get(service).copied()
    }

    /// Record a request time and write the file.
    pub fn record(&self, service: &str, at_ms: i64) -> std::io::Result<()> {
        let json = {
            let mut entries = self.entries.lock();
            let slot = entries.entry(service.to_string()).or_insert(at_ms);
            *slot = (*slot).max(at_ms);
            serde_json::to_vec_pretty(&*entries)?
        };
        write_atomic(&self.path, &json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed and one probe request is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct RateLimitState {
    /// Earliest instant the next attempt may be sent.
    next_slot: Instant,
    last_request_at: Option<Instant>,
    consecutive_failures: u32,
    circuit: Circuit,
}

/// Typed outcome of one attempt, used to update the state.
enum Attempt {
    Success,
    Failure,
    RateLimited(Duration),
    /// A non-transient error that says nothing about service health.
    Rejected,
}

pub struct RateLimitedClient {
    service: String,
    config: ServiceConfig,
    backend: Arc<dyn EnrichmentBackend>,
    state: Mutex<RateLimitState>,
    store: Option<Arc<RateLimitStore>>,
    health: Option<Arc<HealthAggregator>>,
    attempts: AtomicU64,
}

impl RateLimitedClient {
    pub fn new(
        service: impl Into<String>,
        config: ServiceConfig,
        backend: Arc<dyn EnrichmentBackend>,
    ) -> Self {
        Self {
            service: service.into(),
            config,
            backend,
            state: Mutex::new(RateLimitState {
                next_slot: Instant::now(),
                last_request_at: None,
                consecutive_failures: 0,
                circuit: Circuit::Closed,
            }),
            store: None,
            health: None,
            attempts: AtomicU64::new(0),
        }
    }

    /// Persist request times in `store` and resume the cooldown from it.
    pub fn with_store(mut self, store: Arc<RateLimitStore>) -> Self {
        if let Some(last_ms) = store.last_request_at(&self.service) {
            let elapsed_ms = (get_utc_timestamp_ms() - last_ms).max(0) as u64;
            let remaining = self
                .config
                .cooldown()
                .saturating_sub(Duration::from_millis(elapsed_ms));
            self.state.get_mut().next_slot = Instant::now() + remaining;
        }
        self.store = Some(store);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthAggregator>) -> Self {
        health.set_component_healthy(&self.component(), true);
        self.health = Some(health);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attempts that actually reached the backend.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn component(&self) -> String {
        format!("client:{}", self.service)
    }

    /// Send `request`, retrying transient failures with backoff.
    pub async fn fetch_with_retry(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<EnrichmentResponse, ClientError> {
        let mut retries = 0;

        loop {
            self.check_circuit()?;
            let slot = self.reserve_slot();
            tokio::time::sleep_until(slot).await;
            self.admit()?;
            self.persist_request_time(slot).await;

            self.attempts.fetch_add(1, Ordering::Relaxed);
            self.count("requests");
            let result =
                match tokio::time::timeout(self.config.timeout(), self.backend.invoke(request)).await
                {
                    Ok(res) => res,
                    Err(_) => Err(BackendError::Timeout),
                };

            let err = match result {
                Ok(response) => {
                    self.settle(Attempt::Success);
                    return Ok(response);
                }
                Err(e) => e,
            };

            let transient = err.is_transient();
            match &err {
                BackendError::RateLimited(retry_after) => {
                    self.settle(Attempt::RateLimited(*retry_after));
                    self.count("rate_limited");
                }
                _ if transient => self.settle(Attempt::Failure),
                _ => self.settle(Attempt::Rejected),
            }

            let client_err = ClientError::from_backend(&self.service, err);
            if !transient || retries >= self.config.max_retries || self.is_open() {
                return Err(client_err);
            }

            retries += 1;
            self.count("retries");
            let delay = self.backoff(retries);
            crate::debug_event!(
                "client",
                "retrying",
                "{} attempt {} in {delay:?}: {client_err}",
                self.service,
                retries + 1
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Fail fast while the circuit is open or a probe is already out. Does
    /// not change the circuit.
    fn check_circuit(&self) -> Result<(), ClientError> {
        let state = self.state.lock();
        match state.circuit {
            Circuit::Open { until } if Instant::now() < until => Err(ClientError::CircuitOpen {
                service: self.service.clone(),
                retry_in: until - Instant::now(),
            }),
            Circuit::HalfOpen => Err(ClientError::CircuitOpen {
                service: self.service.clone(),
                retry_in: self.config.cooldown(),
            }),
            _ => Ok(()),
        }
    }

    /// Decide, right before sending, whether this attempt may reach the
    /// backend. After the circuit cooldown exactly one caller is admitted
    /// as the half-open probe.
    fn admit(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.circuit {
            Circuit::Closed => Ok(()),
            Circuit::Open { until } if now >= until => {
                state.circuit = Circuit::HalfOpen;
                crate::debug_event!("client", "half-open probe", "{}", self.service);
                Ok(())
            }
            Circuit::Open { until } => Err(ClientError::CircuitOpen {
                service: self.service.clone(),
                retry_in: until - now,
            }),
            Circuit::HalfOpen => Err(ClientError::CircuitOpen {
                service: self.service.clone(),
                retry_in: self.config.cooldown(),
            }),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state.lock().circuit, Circuit::Open { .. })
    }

    /// Claim the next send slot and push the following one out by the cooldown.
    fn reserve_slot(&self) -> Instant {
        let mut state = self.state.lock();
        let slot = state.next_slot.max(Instant::now());
        state.next_slot = slot + self.config.cooldown();
        state.last_request_at = Some(slot);
        slot
    }

    fn settle(&self, attempt: Attempt) {
        let mut opened = false;
        let mut closed = false;
        {
            let mut state = self.state.lock();
            match attempt {
                Attempt::Success => {
                    closed = state.circuit != Circuit::Closed;
                    state.consecutive_failures = 0;
                    state.circuit = Circuit::Closed;
                }
                Attempt::Failure => {
                    state.consecutive_failures += 1;
                    let probe_failed = state.circuit == Circuit::HalfOpen;
                    if probe_failed || state.consecutive_failures >= self.config.failure_threshold {
                        state.circuit = Circuit::Open {
                            until: Instant::now() + self.config.circuit_cooldown(),
                        };
                        opened = true;
                    }
                }
                Attempt::RateLimited(retry_after) => {
                    let earliest = Instant::now() + retry_after;
                    state.next_slot = state.next_slot.max(earliest);
                    if state.circuit == Circuit::HalfOpen {
                        state.circuit = Circuit::Open { until: earliest };
                    }
                }
                Attempt::Rejected => {
                    // The service answered, so a pending probe counts as recovered
                    if state.circuit == Circuit::HalfOpen {
                        state.circuit = Circuit::Closed;
                        state.consecutive_failures = 0;
                        closed = true;
                    }
                }
            }
        }

        if opened {
            tracing::warn!(
                "[client] circuit opened for {} for {:?}",
                self.service,
                self.config.circuit_cooldown()
            );
            self.count("circuit_opened");
            if let Some(health) = &self.health {
                health.set_component_healthy(&self.component(), false);
                health.record_component_error(&self.component(), "circuit open");
            }
        }
        if closed {
            crate::log_event!("client", "circuit closed", "{}", self.service);
            if let Some(health) = &self.health {
                health.set_component_healthy(&self.component(), true);
            }
        }
    }

    /// `base * 2^attempt`, capped, plus up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms;
        let delay = base
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.config.backoff_max_ms);
        let jitter = rand::rng().random_range(0..=delay / 4);
        Duration::from_millis(delay + jitter)
    }

    async fn persist_request_time(&self, slot: Instant) {
        let Some(store) = &self.store else {
            return;
        };
        let ahead = slot.saturating_duration_since(Instant::now()).as_millis() as i64;
        let at_ms = get_utc_timestamp_ms() + ahead;
        let store = store.clone();
        let service = self.service.clone();
        // Synced write, kept off the runtime threads
        match tokio::task::spawn_blocking(move || store.record(&service, at_ms)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("[client] failed to persist rate limit state: {e}"),
            Err(e) => tracing::warn!("[client] rate limit persist task failed: {e}"),
        }
    }

    fn count(&self, counter: &str) {
        if let Some(health) = &self.health {
            health.add_component_counter(&self.component(), counter, 1);
        }
    }
}
