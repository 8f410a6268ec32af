//! Debouncing of raw change events.
//!
//! Cloud sync clients and editors write a file several times per logical
//! save. Every new event for a key resets that key's timer and replaces the
//! stored event, so a settled event always carries the final state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event::{ChangeEvent, SettledEvent, debounce_key};
use super::queue::EventQueue;
use crate::health::HealthAggregator;

/// Component name used for health reporting.
pub const COMPONENT: &str = "debounce";

#[derive(Debug)]
struct Pending {
    first_seen_at: Instant,
    last_change: Instant,
    last_event: ChangeEvent,
}

/// Debounces change events by canonical path.
#[derive(Debug)]
pub struct Debouncer {
    /// Pending changes: debounce key -> latest event.
    pending: HashMap<PathBuf, Pending>,
    /// How long a key must be quiet before it settles.
    duration: Duration,
}

impl Debouncer {
    /// Create a new debouncer with the given quiet period.
    pub fn new(duration: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            duration,
        }
    }

    /// Record a change event, resetting the timer for its key.
    pub fn record(&mut self, event: ChangeEvent) {
        let key = debounce_key(&event.path);
        self.record_with_key(key, event);
    }

    fn record_with_key(&mut self, key: PathBuf, event: ChangeEvent) {
        let now = Instant::now();
        match self.pending.get_mut(&key) {
            Some(pending) => {
                pending.last_change = now;
                pending.last_event = event;
            }
            None => {
                self.pending.insert(
                    key,
                    Pending {
                        first_seen_at: event.observed_at.min(now),
                        last_change: now,
                        last_event: event,
                    },
                );
            }
        }
    }

    /// Take all keys that have been quiet for the debounce duration.
    pub fn take_ready(&mut self) -> Vec<SettledEvent> {
        let now = Instant::now();
        let mut ready = Vec::new();

        self.pending.retain(|key, pending| {
            if now.duration_since(pending.last_change) >= self.duration {
                ready.push(SettledEvent {
                    path: pending.last_event.path.clone(),
                    kind: pending.last_event.kind,
                    first_seen_at: pending.first_seen_at,
                    settled_at: SystemTime::now(),
                    debounce_key: key.clone(),
                });
                false
            } else {
                true
            }
        });

        ready
    }

    /// Check if there are any pending changes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Get the number of pending changes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// How often the coordinator should check for settled keys.
    pub fn tick_interval(&self) -> Duration {
        (self.duration / 4).clamp(Duration::from_millis(5), Duration::from_millis(100))
    }
}

/// Owns every per-key timer and turns the raw queue into settled events.
pub struct DebounceCoordinator {
    debouncer: Debouncer,
    queue: Arc<EventQueue>,
    settled_tx: mpsc::Sender<SettledEvent>,
    health: Arc<HealthAggregator>,
}

impl DebounceCoordinator {
    pub fn new(
        duration: Duration,
        queue: Arc<EventQueue>,
        settled_tx: mpsc::Sender<SettledEvent>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            debouncer: Debouncer::new(duration),
            queue,
            settled_tx,
            health,
        }
    }

    /// Run until cancelled or until the dispatcher goes away.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.debouncer.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_dropped = 0;

        crate::debug_event!(COMPONENT, "started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = self.queue.wait() => {
                    for event in self.queue.drain() {
                        self.debouncer.record(event);
                    }
                    let dropped = self.queue.dropped_count();
                    if dropped > last_dropped {
                        self.health.add_component_counter(
                            super::path_watcher::COMPONENT,
                            "dropped_events",
                            dropped - last_dropped,
                        );
                        last_dropped = dropped;
                    }
                }

                _ = ticker.tick() => {
                    for settled in self.debouncer.take_ready() {
                        crate::debug_event!(COMPONENT, "settled", "{}", settled.debounce_key.display());
                        self.health.add_component_counter(COMPONENT, "settled", 1);
                        if self.settled_tx.send(settled).await.is_err() {
                            crate::debug_event!(COMPONENT, "dispatcher gone, stopping");
                            return;
                        }
                    }
                }
            }
        }

        if self.debouncer.has_pending() {
            tracing::info!(
                "[{COMPONENT}] dropping {} unsettled changes on shutdown",
                self.debouncer.pending_count()
            );
        }
    }
}
