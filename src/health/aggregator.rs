//! Running counters for handlers and components.
//!
//! Every stage reports through the `record_*` / `*_component_*` methods,
//! which take one lock. Nothing reads handler internals. Durations are kept
//! in a fixed-size window so snapshots stay cheap no matter how long the
//! daemon runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dispatch::HandlerResult;
use crate::error::ErrorKind;

/// Number of recent durations used for the rolling average.
pub const HEALTH_WINDOW: usize = 128;

#[derive(Debug, Default)]
struct HandlerCounters {
    running: u32,
    last_run_at: Option<DateTime<Utc>>,
    success: u64,
    failure: u64,
    optional_failures: u64,
    bytes_processed: u64,
    durations_ms: VecDeque<u64>,
    duration_sum_ms: u64,
    errors: HashMap<ErrorKind, u64>,
    last_error: Option<String>,
}

impl HandlerCounters {
    fn push_duration(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        if self.durations_ms.len() == HEALTH_WINDOW
            && let Some(old) = self.durations_ms.pop_front()
        {
            self.duration_sum_ms -= old;
        }
        self.durations_ms.push_back(ms);
        self.duration_sum_ms += ms;
    }

    fn avg_duration_ms(&self) -> f64 {
        if self.durations_ms.is_empty() {
            0.0
        } else {
            self.duration_sum_ms as f64 / self.durations_ms.len() as f64
        }
    }
}

#[derive(Debug)]
struct ComponentCounters {
    healthy: bool,
    counters: BTreeMap<String, u64>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

impl Default for ComponentCounters {
    fn default() -> Self {
        Self {
            healthy: true,
            counters: BTreeMap::new(),
            last_error: None,
            last_error_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    handlers: HashMap<String, HandlerCounters>,
    components: HashMap<String, ComponentCounters>,
}

/// Point-in-time view of one handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerHealth {
    pub running: bool,
    pub in_flight: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub invocation_count: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub optional_step_failures: u64,
    pub bytes_processed: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub last_error: Option<String>,
}

/// Point-in-time view of one component (watcher root, queue, client, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub healthy: bool,
    pub counters: BTreeMap<String, u64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Immutable snapshot, safe to hand to any reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub per_handler: BTreeMap<String, HandlerHealth>,
    pub components: BTreeMap<String, ComponentHealth>,
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn handler(&self, name: &str) -> Option<&HandlerHealth> {
        self.per_handler.get(name)
    }

    /// True when no component has marked itself unhealthy.
    pub fn is_healthy(&self) -> bool {
        self.components.values().all(|c| c.healthy)
    }
}

#[derive(Debug, Default)]
pub struct HealthAggregator {
    state: Mutex<State>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler invocation began.
    pub fn handler_started(&self, handler: &str) {
        let mut state = self.state.lock();
        let counters = state.handlers.entry(handler.to_string()).or_default();
        counters.running += 1;
        counters.last_run_at = Some(Utc::now());
    }

    /// A handler invocation finished (successfully or not).
    pub fn record_result(&self, handler: &str, result: &HandlerResult) {
        let mut state = self.state.lock();
        let counters = state.handlers.entry(handler.to_string()).or_default();
        counters.running = counters.running.saturating_sub(1);
        counters.push_duration(result.metrics.duration);
        counters.bytes_processed += result.metrics.bytes_processed;

        if result.success {
            counters.success += 1;
        } else {
            counters.failure += 1;
        }
        if result.optional_step_failed {
            counters.optional_failures += 1;
        }
        if let Some(err) = &result.error {
            *counters.errors.entry(err.kind).or_default() += 1;
            counters.last_error = Some(err.message.clone());
        }
    }

    /// Work for `handler` was abandoned without a result (shutdown).
    pub fn record_incomplete(&self, handler: &str, started: bool) {
        let mut state = self.state.lock();
        let counters = state.handlers.entry(handler.to_string()).or_default();
        if started {
            counters.running = counters.running.saturating_sub(1);
        }
        counters.failure += 1;
        *counters.errors.entry(ErrorKind::Cancelled).or_default() += 1;
        counters.last_error = Some("cancelled during shutdown".to_string());
    }

    pub fn add_component_counter(&self, component: &str, counter: &str, n: u64) {
        let mut state = self.state.lock();
        let entry = state.components.entry(component.to_string()).or_default();
        *entry.counters.entry(counter.to_string()).or_default() += n;
    }

    pub fn set_component_healthy(&self, component: &str, healthy: bool) {
        let mut state = self.state.lock();
        state
            .components
            .entry(component.to_string())
            .or_default()
            .healthy = healthy;
    }

    pub fn record_component_error(&self, component: &str, error: &str) {
        let mut state = self.state.lock();
        let entry = state.components.entry(component.to_string()).or_default();
        entry.last_error = Some(error.to_string());
        entry.last_error_at = Some(Utc::now());
        *entry.counters.entry("errors".to_string()).or_default() += 1;
    }

    /// Copy the current counters into an immutable snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock();

        let per_handler = state
            .handlers
            .iter()
            .map(|(name, c)| {
                let invocations = c.success + c.failure;
                let success_rate = if invocations > 0 {
                    c.success as f64 / invocations as f64
                } else {
                    0.0
                };
                let health = HandlerHealth {
                    running: c.running > 0,
                    in_flight: c.running,
                    last_run_at: c.last_run_at,
                    success_count: c.success,
                    failure_count: c.failure,
                    invocation_count: invocations,
                    success_rate,
                    avg_duration_ms: c.avg_duration_ms(),
                    optional_step_failures: c.optional_failures,
                    bytes_processed: c.bytes_processed,
                    errors_by_kind: c
                        .errors
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                    last_error: c.last_error.clone(),
                };
                (name.clone(), health)
            })
            .collect();

        let components = state
            .components
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    ComponentHealth {
                        healthy: c.healthy,
                        counters: c.counters.clone(),
                        last_error: c.last_error.clone(),
                        last_error_at: c.last_error_at,
                    },
                )
            })
            .collect();

        HealthSnapshot {
            per_handler,
            components,
            generated_at: Utc::now(),
        }
    }
}
