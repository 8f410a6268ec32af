//! Daemon wiring.
//!
//! [`Daemon::run`] builds every stage from [`Settings`] and runs them until
//! the cancellation token fires:
//!
//! ```text
//! PathWatcher x roots -> EventQueue -> DebounceCoordinator -> EventDispatcher
//!                                                                  |
//!                        handlers -> Enricher (ResultCache + RateLimitedClient)
//!                                 -> NoteLifecycleManager
//! ```
//!
//! Shutdown order: watchers and the debouncer stop first, the dispatcher
//! drains (bounded by the grace period), then a last health snapshot is
//! written and the PID file is released.

mod pid;

pub use pid::{PidFile, is_process_alive, read_pid};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::ResultCache;
use crate::client::{
    BackendError, EnrichmentBackend, HttpBackend, RateLimitStore, RateLimitedClient,
};
use crate::config::Settings;
use crate::dispatch::EventDispatcher;
use crate::handlers::{HandlerContext, HandlerSet, HandlerSetError};
use crate::health::{HealthAggregator, StatusExporter};
use crate::notes::NoteLifecycleManager;
use crate::watcher::{DebounceCoordinator, EventQueue, PathWatcher, WatchError};

const COMPONENT: &str = "daemon";

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Another instance is running (pid {pid}, {})", pid_file.display())]
    AlreadyRunning { pid: u32, pid_file: PathBuf },

    #[error("Cannot write pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Handlers(#[from] HandlerSetError),

    #[error("Service '{service}' unavailable: {source}")]
    Backend {
        service: String,
        #[source]
        source: BackendError,
    },
}

pub struct Daemon {
    settings: Settings,
    health: Arc<HealthAggregator>,
    backends: HashMap<String, Arc<dyn EnrichmentBackend>>,
}

impl Daemon {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            health: Arc::new(HealthAggregator::new()),
            backends: HashMap::new(),
        }
    }

    /// Use `backend` for `service` instead of the HTTP backend.
    pub fn with_backend(mut self, service: &str, backend: Arc<dyn EnrichmentBackend>) -> Self {
        self.backends.insert(service.to_string(), backend);
        self
    }

    /// The aggregator every stage reports to.
    pub fn health(&self) -> Arc<HealthAggregator> {
        self.health.clone()
    }

    fn backend_for(&self, service: &str) -> Result<Arc<dyn EnrichmentBackend>, DaemonError> {
        if let Some(backend) = self.backends.get(service) {
            return Ok(backend.clone());
        }
        let backend =
            HttpBackend::new(&self.settings.service(service)).map_err(|source| {
                DaemonError::Backend {
                    service: service.to_string(),
                    source,
                }
            })?;
        Ok(Arc::new(backend))
    }

    fn build_clients(&self) -> Result<HashMap<String, Arc<RateLimitedClient>>, DaemonError> {
        let store = Arc::new(RateLimitStore::in_dir(&self.settings.daemon.state_dir));
        let handlers = &self.settings.handlers;

        let mut services: Vec<&str> = Vec::new();
        for (enabled, service) in [
            (handlers.screenshot.enabled, handlers.screenshot.service.as_str()),
            (handlers.transcript.enabled, handlers.transcript.service.as_str()),
            (handlers.smart_link.enabled, handlers.smart_link.service.as_str()),
        ] {
            if enabled && !services.contains(&service) {
                services.push(service);
            }
        }

        let mut clients = HashMap::new();
        for service in services {
            let client = RateLimitedClient::new(
                service,
                self.settings.service(service),
                self.backend_for(service)?,
            )
            .with_store(store.clone())
            .with_health(self.health.clone());
            clients.insert(service.to_string(), Arc::new(client));
        }
        Ok(clients)
    }

    /// Run until `cancel` fires. Returns after a graceful shutdown.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let settings = &self.settings;
        let _pid_file = PidFile::acquire(&settings.daemon.pid_file)?;

        if settings.watch.roots.is_empty() {
            return Err(WatchError::NoRoots.into());
        }
        let roots: Vec<PathBuf> = settings
            .watch
            .roots
            .iter()
            .map(|root| std::fs::canonicalize(root).unwrap_or_else(|_| root.clone()))
            .collect();

        let cache = match ResultCache::open(&settings.cache.dir) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(
                    "[{COMPONENT}] cache at {} unavailable, using memory only: {e}",
                    settings.cache.dir.display()
                );
                self.health.record_component_error("cache", &e.to_string());
                ResultCache::in_memory()
            }
        };
        let cache = Arc::new(cache);
        match cache.purge_expired() {
            Ok(0) => {}
            Ok(n) => crate::debug_event!(COMPONENT, "purged", "{n} expired cache entries"),
            Err(e) => tracing::warn!("[{COMPONENT}] cache purge failed: {e}"),
        }

        let mut lifecycle = NoteLifecycleManager::new();
        if let Some(journal) = &settings.lifecycle.journal_path {
            lifecycle = lifecycle.with_journal(journal);
        }

        let ctx = HandlerContext {
            lifecycle: Arc::new(lifecycle),
            cache,
            clients: self.build_clients()?,
            cache_ttl: settings.cache_ttl(),
            roots: roots.clone(),
        };
        let handlers = HandlerSet::from_settings(settings, &ctx)?;
        crate::log_event!(COMPONENT, "handlers", "{}", handlers.names().join(", "));
        let dispatcher = EventDispatcher::new(
            handlers.into_registry(settings.dispatch.mode),
            self.health.clone(),
            &settings.dispatch,
        );

        let queue = EventQueue::new(settings.watch.queue_capacity);
        let (settled_tx, settled_rx) = mpsc::channel(settings.dispatch.settled_capacity.max(1));

        let watchers = roots
            .iter()
            .map(|root| {
                PathWatcher::new(root.clone(), &settings.watch, queue.clone(), self.health.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tracker = TaskTracker::new();
        for watcher in watchers {
            tracker.spawn(watcher.run(cancel.clone()));
        }
        tracker.spawn(
            DebounceCoordinator::new(settings.debounce(), queue, settled_tx, self.health.clone())
                .run(cancel.clone()),
        );
        tracker.close();

        let exporter_cancel = CancellationToken::new();
        let exporter = tokio::spawn(
            StatusExporter::new(
                self.health.clone(),
                settings.daemon.status_path.clone(),
                Duration::from_millis(settings.daemon.status_interval_ms),
            )
            .run(exporter_cancel.clone()),
        );

        crate::log_event!(
            COMPONENT,
            "started",
            "{} ({} roots, pid {})",
            settings.daemon.name,
            roots.len(),
            std::process::id()
        );

        dispatcher.run(settled_rx, cancel.clone()).await;
        tracker.wait().await;

        exporter_cancel.cancel();
        if let Err(e) = exporter.await {
            tracing::warn!("[{COMPONENT}] status exporter ended abnormally: {e}");
        }

        crate::log_event!(COMPONENT, "stopped", "{}", settings.daemon.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.daemon.pid_file = dir.join("notewatch.pid");
        settings.daemon.status_path = dir.join("health.json");
        settings.daemon.state_dir = dir.join("state");
        settings.cache.dir = dir.join("cache");
        settings
    }

    #[tokio::test]
    async fn test_no_roots_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let pid_file = settings.daemon.pid_file.clone();

        let result = Daemon::new(settings).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(DaemonError::Watch(WatchError::NoRoots))));
        // Guard released on the error path
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_second_instance_refused() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        std::fs::write(&settings.daemon.pid_file, "1\n").unwrap();

        let result = Daemon::new(settings).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(DaemonError::AlreadyRunning { pid: 1, .. })));
    }

    #[tokio::test]
    async fn test_clean_shutdown_writes_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault");
        std::fs::create_dir_all(&vault).unwrap();
        let mut settings = settings_in(dir.path());
        settings.watch.roots = vec![vault];
        settings.watch.poll = true;
        settings.watch.poll_interval_ms = 50;
        let status_path = settings.daemon.status_path.clone();
        let pid_file = settings.daemon.pid_file.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Daemon::new(settings).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(pid_file.exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let snapshot = crate::health::read_snapshot(&status_path).unwrap();
        assert!(snapshot.components.keys().any(|k| k.starts_with("watcher:")));
        assert!(!pid_file.exists());
    }
}
