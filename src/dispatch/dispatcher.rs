//! Routes settled events to handlers.
//!
//! Events are queued per debounce key and each queue is drained by a single
//! task, so one path is never handled twice at the same time and its events
//! run in settlement order. Different paths run concurrently, bounded by the
//! worker semaphore. Every `handle` call runs in its own task, which turns a
//! panic into a failed result instead of taking the dispatcher down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handler::{EnrichmentHandler, HandlerKind};
use super::registry::CapabilityRegistry;
use super::result::{HandlerError, HandlerResult};
use crate::config::DispatchConfig;
use crate::error::ErrorKind;
use crate::health::HealthAggregator;
use crate::notes::Note;
use crate::watcher::{ChangeKind, SettledEvent};

/// Component name used for health reporting.
pub const COMPONENT: &str = "dispatch";

/// Deferral delay when a rate limited result carries no retry hint.
const DEFAULT_DEFER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Job {
    event: SettledEvent,
    /// Set for re-submitted work: only this handler runs again.
    only: Option<HandlerKind>,
    deferrals: u32,
}

struct Inner {
    registry: CapabilityRegistry,
    health: Arc<HealthAggregator>,
    workers: Semaphore,
    max_deferrals: u32,
    queues: Mutex<HashMap<PathBuf, VecDeque<Job>>>,
    running: Mutex<HashMap<u64, (&'static str, AbortHandle)>>,
    active_paths: Mutex<HashSet<PathBuf>>,
    interleavings: AtomicU64,
    next_id: AtomicU64,
    tracker: TaskTracker,
    /// Intake is closed.
    stopping: CancellationToken,
    /// Grace period is over; abandon everything.
    abort: CancellationToken,
}

pub struct EventDispatcher {
    inner: Arc<Inner>,
    grace: Duration,
}

impl EventDispatcher {
    pub fn new(
        registry: CapabilityRegistry,
        health: Arc<HealthAggregator>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                health,
                workers: Semaphore::new(config.workers.max(1)),
                max_deferrals: config.max_deferrals,
                queues: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                active_paths: Mutex::new(HashSet::new()),
                interleavings: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                tracker: TaskTracker::new(),
                stopping: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
            grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }

    /// Consume settled events until cancelled or the channel closes, then
    /// shut down gracefully.
    pub async fn run(&self, mut rx: mpsc::Receiver<SettledEvent>, cancel: CancellationToken) {
        crate::log_event!(
            COMPONENT,
            "started",
            "{} handlers, {} workers, mode {:?}",
            self.inner.registry.len(),
            self.inner.workers.available_permits(),
            self.inner.registry.mode()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.submit(event),
                    None => break,
                },
            }
        }

        rx.close();
        self.shutdown().await;
    }

    /// Queue one settled event for dispatch.
    pub fn submit(&self, event: SettledEvent) {
        self.inner.enqueue(Job {
            event,
            only: None,
            deferrals: 0,
        });
    }

    /// Times two `handle` calls for the same path overlapped. Always zero
    /// unless path serialization is broken.
    pub fn interleavings(&self) -> u64 {
        self.inner.interleavings.load(Ordering::Relaxed)
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.queues.lock().is_empty() && self.inner.running.lock().is_empty();
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop intake, give in-flight work the grace period, then abort the rest
    /// and record it as incomplete.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.stopping.cancel();
        inner.tracker.close();

        if tokio::time::timeout(self.grace, inner.tracker.wait())
            .await
            .is_err()
        {
            let running: Vec<_> = inner.running.lock().values().cloned().collect();
            tracing::warn!(
                "[{COMPONENT}] grace period elapsed, aborting {} running handlers",
                running.len()
            );
            inner.abort.cancel();
            for (_, handle) in running {
                handle.abort();
            }
            inner.tracker.wait().await;
        }

        crate::debug_event!(COMPONENT, "stopped");
    }
}

impl Inner {
    fn enqueue(self: &Arc<Self>, job: Job) {
        if self.stopping.is_cancelled() {
            self.abandon(&job);
            return;
        }

        let key = job.event.debounce_key.clone();
        let mut queues = self.queues.lock();
        match queues.get_mut(&key) {
            // A drain task already owns this path
            Some(queue) => queue.push_back(job),
            None => {
                queues.insert(key.clone(), VecDeque::from([job]));
                let inner = self.clone();
                self.tracker.spawn(async move { inner.drain(key).await });
            }
        }
    }

    async fn drain(self: Arc<Self>, key: PathBuf) {
        loop {
            let job = {
                let mut queues = self.queues.lock();
                match queues.get_mut(&key).and_then(|q| q.pop_front()) {
                    Some(job) => job,
                    None => {
                        queues.remove(&key);
                        return;
                    }
                }
            };

            if self.abort.is_cancelled() {
                self.abandon(&job);
                continue;
            }

            let permit = tokio::select! {
                permit = self.workers.acquire() => permit.ok(),
                _ = self.abort.cancelled() => None,
            };
            let Some(_permit) = permit else {
                self.abandon(&job);
                continue;
            };

            self.process(job).await;
        }
    }

    fn handlers_for(&self, job: &Job) -> Vec<Arc<dyn EnrichmentHandler>> {
        let note = read_snapshot(&job.event);
        match job.only {
            Some(kind) => self
                .registry
                .get(kind)
                .filter(|h| h.can_handle(&job.event, note.as_ref()))
                .cloned()
                .into_iter()
                .collect(),
            None => self.registry.matching(&job.event, note.as_ref()),
        }
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let handlers = self.handlers_for(&job);
        if handlers.is_empty() {
            crate::debug_event!(COMPONENT, "no handler", "{}", job.event.path.display());
            self.health.add_component_counter(COMPONENT, "unmatched", 1);
            return;
        }

        for handler in handlers {
            if self.abort.is_cancelled() {
                self.health.record_incomplete(handler.name(), false);
                continue;
            }
            self.invoke(handler, &job).await;
        }
    }

    async fn invoke(self: &Arc<Self>, handler: Arc<dyn EnrichmentHandler>, job: &Job) {
        let name = handler.name();
        let key = job.event.debounce_key.clone();

        let overlapped = !self.active_paths.lock().insert(key.clone());
        if overlapped {
            self.interleavings.fetch_add(1, Ordering::Relaxed);
            tracing::error!("[{COMPONENT}] overlapping handle on {}", key.display());
        }

        self.health.handler_started(name);
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let event = job.event.clone();
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle(&event).await })
        };
        self.running.lock().insert(id, (name, task.abort_handle()));

        let outcome = task.await;

        self.running.lock().remove(&id);
        if !overlapped {
            self.active_paths.lock().remove(&key);
        }

        let result = match outcome {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!("[{COMPONENT}] handler {name} panicked on {}: {message}", job.event.path.display());
                HandlerResult::failure(HandlerError::new(
                    ErrorKind::Permanent,
                    format!("handler panicked: {message}"),
                ))
            }
            Err(_) => {
                tracing::warn!("[{COMPONENT}] handler {name} aborted on {}", job.event.path.display());
                self.health.record_incomplete(name, true);
                return;
            }
        }
        .with_duration(started.elapsed());

        self.health.record_result(name, &result);
        self.report(name, job, &result);

        if let Some(err) = &result.error
            && err.kind.is_deferrable()
        {
            let retry = Job {
                event: job.event.clone(),
                only: Some(handler.kind()),
                deferrals: job.deferrals + 1,
            };
            self.defer(retry, err.retry_after.unwrap_or(DEFAULT_DEFER));
        }
    }

    fn report(&self, name: &str, job: &Job, result: &HandlerResult) {
        let path = job.event.path.display();
        match &result.error {
            None if result.changed => crate::log_event!(name, "processed", "{path}"),
            None => crate::debug_event!(name, "no change", "{path}"),
            Some(err) => match err.kind {
                ErrorKind::Permanent | ErrorKind::InvalidTransition => {
                    tracing::warn!("[{name}] {path} left for manual review: {err}")
                }
                ErrorKind::RateLimited => tracing::info!("[{name}] {path} deferred: {err}"),
                _ => tracing::warn!("[{name}] {path} failed: {err}"),
            },
        }
        if result.optional_step_failed {
            tracing::info!("[{name}] {path}: optional step failed");
        }
    }

    /// Re-submit `job` after `delay` unless it has been deferred too often.
    fn defer(self: &Arc<Self>, job: Job, delay: Duration) {
        if job.deferrals > self.max_deferrals {
            tracing::warn!(
                "[{COMPONENT}] giving up on {} after {} deferrals",
                job.event.path.display(),
                self.max_deferrals
            );
            self.health.add_component_counter(COMPONENT, "deferrals_exhausted", 1);
            return;
        }

        self.health.add_component_counter(COMPONENT, "deferred", 1);
        let inner = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = inner.stopping.cancelled() => inner.abandon(&job),
                _ = tokio::time::sleep(delay) => inner.enqueue(job),
            }
        });
    }

    /// Record queued work that will never run.
    fn abandon(&self, job: &Job) {
        for handler in self.handlers_for(job) {
            self.health.record_incomplete(handler.name(), false);
        }
        self.health.add_component_counter(COMPONENT, "abandoned", 1);
    }
}

/// Current note contents for markdown events, if readable.
fn read_snapshot(event: &SettledEvent) -> Option<Note> {
    if event.kind == ChangeKind::Removed || !event.is_markdown() {
        return None;
    }
    let content = std::fs::read_to_string(&event.path).ok()?;
    match Note::parse(&content) {
        Ok(note) => Some(note),
        Err(e) => {
            tracing::debug!("[{COMPONENT}] unparsable note {}: {e}", event.path.display());
            None
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchMode;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        kind: HandlerKind,
        calls: AtomicUsize,
        delay: Duration,
        behavior: fn(usize) -> HandlerResult,
    }

    impl Probe {
        fn new(kind: HandlerKind, behavior: fn(usize) -> HandlerResult) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                behavior,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EnrichmentHandler for Probe {
        fn kind(&self) -> HandlerKind {
            self.kind
        }

        fn can_handle(&self, _: &SettledEvent, _: Option<&Note>) -> bool {
            true
        }

        async fn handle(&self, _: &SettledEvent) -> HandlerResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.behavior)(n)
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            workers: 4,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        }
    }

    fn dispatcher(
        handlers: Vec<Arc<Probe>>,
        mode: DispatchMode,
        config: &DispatchConfig,
    ) -> (EventDispatcher, Arc<HealthAggregator>) {
        let mut registry = CapabilityRegistry::new(mode);
        for h in handlers {
            registry.register(h);
        }
        let health = Arc::new(HealthAggregator::new());
        (EventDispatcher::new(registry, health.clone(), config), health)
    }

    fn event(name: &str) -> SettledEvent {
        SettledEvent::now(format!("/vault/{name}"), ChangeKind::Modified)
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let panicky = Probe::new(HandlerKind::Transcript, |n| {
            if n == 0 {
                panic!("boom");
            }
            HandlerResult::changed()
        });
        let (dispatcher, health) = dispatcher(vec![panicky.clone()], DispatchMode::First, &config());

        dispatcher.submit(event("a.md"));
        dispatcher.wait_idle().await;
        dispatcher.submit(event("b.md"));
        dispatcher.wait_idle().await;

        let snapshot = health.snapshot();
        let h = snapshot.handler("transcript").unwrap();
        assert_eq!(h.failure_count, 1);
        assert_eq!(h.success_count, 1);
        assert!(h.last_error.as_deref().unwrap().contains("boom"));
        assert_eq!(panicky.calls(), 2);
    }

    #[tokio::test]
    async fn test_first_mode_runs_one_handler() {
        let first = Probe::new(HandlerKind::Screenshot, |_| HandlerResult::changed());
        let second = Probe::new(HandlerKind::SmartLink, |_| HandlerResult::changed());
        let (dispatcher, _) =
            dispatcher(vec![first.clone(), second.clone()], DispatchMode::First, &config());

        dispatcher.submit(event("a.md"));
        dispatcher.wait_idle().await;
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_result_is_deferred() {
        let limited = Probe::new(HandlerKind::Transcript, |n| {
            if n == 0 {
                let mut err = HandlerError::new(ErrorKind::RateLimited, "slow down");
                err.retry_after = Some(Duration::from_millis(20));
                HandlerResult::failure(err)
            } else {
                HandlerResult::changed()
            }
        });
        let (dispatcher, health) = dispatcher(vec![limited.clone()], DispatchMode::First, &config());

        dispatcher.submit(event("a.md"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.wait_idle().await;

        assert_eq!(limited.calls(), 2);
        let snapshot = health.snapshot();
        assert_eq!(snapshot.components[COMPONENT].counters["deferred"], 1);
        assert_eq!(snapshot.handler("transcript").unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn test_deferrals_are_bounded() {
        let always_limited = Probe::new(HandlerKind::Transcript, |_| {
            let mut err = HandlerError::new(ErrorKind::RateLimited, "slow down");
            err.retry_after = Some(Duration::from_millis(1));
            HandlerResult::failure(err)
        });
        let config = DispatchConfig {
            max_deferrals: 2,
            ..config()
        };
        let (dispatcher, _) = dispatcher(vec![always_limited.clone()], DispatchMode::First, &config);

        dispatcher.submit(event("a.md"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.wait_idle().await;

        // Initial attempt plus two re-submissions
        assert_eq!(always_limited.calls(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace_and_records_incomplete() {
        let slow = Arc::new(Probe {
            kind: HandlerKind::SmartLink,
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
            behavior: |_| HandlerResult::changed(),
        });
        let config = DispatchConfig {
            workers: 1,
            shutdown_grace_ms: 50,
            ..config()
        };
        let (dispatcher, health) = dispatcher(vec![slow.clone()], DispatchMode::First, &config);

        dispatcher.submit(event("a.md"));
        dispatcher.submit(event("b.md"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), dispatcher.shutdown())
            .await
            .expect("shutdown must finish after the grace period");

        let snapshot = health.snapshot();
        let h = snapshot.handler("smart_link").unwrap();
        assert!(!h.running);
        assert_eq!(h.failure_count, 2);
        assert_eq!(h.errors_by_kind["cancelled"], 2);
    }
}
