//! Health snapshot export for external status tooling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::aggregator::{HealthAggregator, HealthSnapshot};
use crate::utils::write_atomic;

const COMPONENT: &str = "health";

/// Write `snapshot` as pretty JSON, atomically.
pub fn write_snapshot(path: &Path, snapshot: &HealthSnapshot) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &json)
}

/// Read a previously exported snapshot (used by the `status` command).
pub fn read_snapshot(path: &Path) -> std::io::Result<HealthSnapshot> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(std::io::Error::from)
}

/// Periodically writes the aggregator's snapshot to `path`.
pub struct StatusExporter {
    health: Arc<HealthAggregator>,
    path: PathBuf,
    interval: Duration,
}

impl StatusExporter {
    pub fn new(health: Arc<HealthAggregator>, path: PathBuf, interval: Duration) -> Self {
        Self {
            health,
            path,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Export once. Failures are logged and reported, never propagated.
    pub fn export_now(&self) {
        let snapshot = self.health.snapshot();
        if let Err(e) = write_snapshot(&self.path, &snapshot) {
            tracing::warn!("[{COMPONENT}] failed to export {}: {e}", self.path.display());
            self.health.record_component_error(COMPONENT, &e.to_string());
        }
    }

    /// Export on every interval until cancelled, then once more.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.export_now(),
            }
        }

        self.export_now();
        crate::debug_event!(COMPONENT, "final snapshot written", "{}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerResult;

    #[test]
    fn test_write_and_read_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("health.json");

        let health = HealthAggregator::new();
        health.handler_started("screenshot");
        health.record_result("screenshot", &HandlerResult::changed());
        let snapshot = health.snapshot();

        write_snapshot(&path, &snapshot).unwrap();
        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_exporter_writes_final_snapshot_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.json");
        let health = Arc::new(HealthAggregator::new());

        let exporter = StatusExporter::new(health.clone(), path.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(exporter.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        health.handler_started("transcript");
        health.record_result("transcript", &HandlerResult::unchanged());
        cancel.cancel();
        task.await.unwrap();

        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded.handler("transcript").unwrap().success_count, 1);
    }
}
