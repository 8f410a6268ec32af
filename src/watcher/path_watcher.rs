//! Per-root filesystem watcher.
//!
//! Each root gets its own task holding a `notify` watcher. The notify
//! callback only filters and pushes onto the shared [`EventQueue`]; it never
//! waits on consumers. If the subscription fails or the root disappears the
//! task re-subscribes with exponential backoff, and gives up (marking the
//! root unhealthy) after `max_resubscribe_attempts` consecutive failures.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use notify::{Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::event::{ChangeEvent, ChangeKind};
use super::queue::EventQueue;
use crate::config::WatchConfig;
use crate::health::HealthAggregator;

/// Component name used for health reporting.
pub const COMPONENT: &str = "watcher";

/// How often a live subscription checks that its root still exists.
const ROOT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound for the re-subscription delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Why a live subscription ended.
enum Outcome {
    Cancelled,
    Failed(String),
}

/// Watches one root directory recursively.
pub struct PathWatcher {
    root: PathBuf,
    ignore: Arc<Vec<Pattern>>,
    queue: Arc<EventQueue>,
    health: Arc<HealthAggregator>,
    poll: bool,
    poll_interval: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl PathWatcher {
    /// Create a watcher for `root`. Fails only on invalid ignore patterns.
    pub fn new(
        root: PathBuf,
        config: &WatchConfig,
        queue: Arc<EventQueue>,
        health: Arc<HealthAggregator>,
    ) -> Result<Self, WatchError> {
        let ignore = config
            .ignore_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| WatchError::ConfigError {
                    reason: format!("invalid ignore pattern '{p}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root,
            ignore: Arc::new(ignore),
            queue,
            health,
            poll: config.poll,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_attempts: config.max_resubscribe_attempts.max(1),
            backoff: Duration::from_millis(config.resubscribe_backoff_ms),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn component(&self) -> String {
        format!("{COMPONENT}:{}", self.root.display())
    }

    /// Run until cancelled or until the root is given up on.
    pub async fn run(self, cancel: CancellationToken) {
        let component = self.component();
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (err_tx, err_rx) = mpsc::unbounded_channel();
            let reason = match self.subscribe(err_tx) {
                Ok(watcher) => {
                    failures = 0;
                    self.health.set_component_healthy(&component, true);
                    crate::log_event!(COMPONENT, "watching", "{}", self.root.display());

                    match self.supervise(watcher, err_rx, &cancel).await {
                        Outcome::Cancelled => break,
                        Outcome::Failed(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            tracing::warn!(
                "[{COMPONENT}] {} failed ({failures}/{}): {reason}",
                self.root.display(),
                self.max_attempts
            );
            self.health.record_component_error(&component, &reason);
            self.health.add_component_counter(COMPONENT, "failures", 1);

            if failures >= self.max_attempts {
                tracing::error!(
                    "[{COMPONENT}] giving up on {} after {failures} attempts",
                    self.root.display()
                );
                self.health.set_component_healthy(&component, false);
                break;
            }

            let delay = backoff_delay(self.backoff, failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        crate::debug_event!(COMPONENT, "stopped", "{}", self.root.display());
    }

    /// Create a watcher for the root, falling back to polling when native
    /// notifications are unavailable.
    fn subscribe(
        &self,
        err_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn Watcher + Send>, WatchError> {
        if !self.root.is_dir() {
            return Err(WatchError::PathWatchFailed {
                path: self.root.clone(),
                reason: "not a directory".to_string(),
            });
        }

        let mut watcher: Box<dyn Watcher + Send> = if self.poll {
            Box::new(self.poll_watcher(err_tx)?)
        } else {
            match RecommendedWatcher::new(
                self.event_handler(err_tx.clone()),
                notify::Config::default(),
            ) {
                Ok(w) => Box::new(w),
                Err(e) => {
                    tracing::warn!("[{COMPONENT}] native watcher unavailable ({e}), polling instead");
                    Box::new(self.poll_watcher(err_tx)?)
                }
            }
        };

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: self.root.clone(),
                reason: e.to_string(),
            })?;

        Ok(watcher)
    }

    fn poll_watcher(
        &self,
        err_tx: mpsc::UnboundedSender<String>,
    ) -> Result<PollWatcher, WatchError> {
        let config = notify::Config::default().with_poll_interval(self.poll_interval);
        Ok(PollWatcher::new(self.event_handler(err_tx), config)?)
    }

    /// Build the notify callback. It must stay non-blocking.
    fn event_handler(
        &self,
        err_tx: mpsc::UnboundedSender<String>,
    ) -> impl FnMut(notify::Result<Event>) + Send + 'static {
        let queue = self.queue.clone();
        let ignore = self.ignore.clone();
        let root = self.root.clone();

        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    // Only files are handled; directory mtime changes are noise
                    if path == root || path.is_dir() || is_ignored(&root, &ignore, &path) {
                        continue;
                    }
                    queue.push(ChangeEvent::new(path, kind));
                }
            }
            Err(e) => {
                let _ = err_tx.send(e.to_string());
            }
        }
    }

    async fn supervise(
        &self,
        _watcher: Box<dyn Watcher + Send>,
        mut err_rx: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut check = tokio::time::interval(ROOT_CHECK_INTERVAL);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,

                Some(err) = err_rx.recv() => {
                    return Outcome::Failed(format!("watch error: {err}"));
                }

                _ = check.tick() => {
                    if !self.root.is_dir() {
                        return Outcome::Failed("root directory disappeared".to_string());
                    }
                }
            }
        }
    }
}

/// Whether `path` matches one of the ignore patterns relative to `root`.
pub fn is_ignored(root: &Path, patterns: &[Pattern], path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    patterns.iter().any(|p| p.matches_path(relative))
}

/// `base * 2^(attempt-1)`, capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<Pattern> {
        list.iter().map(|p| Pattern::new(p).unwrap()).collect()
    }

    #[test]
    fn test_default_ignore_patterns() {
        let config = WatchConfig::default();
        let pats: Vec<Pattern> = config
            .ignore_patterns
            .iter()
            .map(|p| Pattern::new(p).unwrap())
            .collect();
        let root = Path::new("/vault");

        assert!(is_ignored(root, &pats, Path::new("/vault/.obsidian/workspace.json")));
        assert!(is_ignored(root, &pats, Path::new("/vault/inbox/.draft.md")));
        assert!(is_ignored(root, &pats, Path::new("/vault/inbox/note.md~")));
        assert!(is_ignored(root, &pats, Path::new("/vault/inbox/x.tmp")));
        assert!(!is_ignored(root, &pats, Path::new("/vault/inbox/note.md")));
        assert!(!is_ignored(root, &pats, Path::new("/vault/shots/shot.png")));
    }

    #[test]
    fn test_custom_ignore_pattern() {
        let pats = patterns(&["archive/**"]);
        let root = Path::new("/vault");
        assert!(is_ignored(root, &pats, Path::new("/vault/archive/old.md")));
        assert!(!is_ignored(root, &pats, Path::new("/vault/inbox/new.md")));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut config = WatchConfig::default();
        config.ignore_patterns = vec!["[".to_string()];
        let result = PathWatcher::new(
            PathBuf::from("/vault"),
            &config,
            EventQueue::new(4),
            Arc::new(HealthAggregator::new()),
        );
        assert!(matches!(result, Err(WatchError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_missing_root_is_marked_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatchConfig::default();
        config.max_resubscribe_attempts = 2;
        config.resubscribe_backoff_ms = 5;

        let health = Arc::new(HealthAggregator::new());
        let watcher = PathWatcher::new(
            dir.path().join("missing"),
            &config,
            EventQueue::new(4),
            health.clone(),
        )
        .unwrap();
        let component = watcher.component();

        tokio::time::timeout(Duration::from_secs(2), watcher.run(CancellationToken::new()))
            .await
            .expect("watcher should give up");

        let snapshot = health.snapshot();
        let status = &snapshot.components[&component];
        assert!(!status.healthy);
        assert!(status.last_error.is_some());
        assert_eq!(snapshot.components[COMPONENT].counters["failures"], 2);
    }

    #[tokio::test]
    async fn test_reports_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WatchConfig::default();
        config.poll = true;
        config.poll_interval_ms = 50;

        let queue = EventQueue::new(64);
        let watcher = PathWatcher::new(
            dir.path().to_path_buf(),
            &config,
            queue.clone(),
            Arc::new(HealthAggregator::new()),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(cancel.clone()));

        // Let the poll watcher take its initial scan
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(dir.path().join("note.md"), "hello").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                queue.wait().await;
                if queue
                    .drain()
                    .iter()
                    .any(|e| e.path.file_name().is_some_and(|n| n == "note.md"))
                {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(found);

        cancel.cancel();
        task.await.unwrap();
    }
}
