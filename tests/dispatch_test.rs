//! Dispatcher ordering and isolation under load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use notewatch::config::{DispatchConfig, DispatchMode};
use notewatch::dispatch::{
    CapabilityRegistry, EnrichmentHandler, EventDispatcher, HandlerKind, HandlerResult,
};
use notewatch::health::HealthAggregator;
use notewatch::notes::Note;
use notewatch::watcher::{ChangeKind, SettledEvent};
use parking_lot::Mutex;

/// Slow handler that tracks how many calls are in flight per path.
#[derive(Default)]
struct Tracking {
    in_flight: Mutex<HashMap<PathBuf, usize>>,
    max_per_path: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    order: Mutex<HashMap<PathBuf, Vec<u32>>>,
    calls: AtomicUsize,
}

#[async_trait]
impl EnrichmentHandler for Tracking {
    fn kind(&self) -> HandlerKind {
        HandlerKind::SmartLink
    }

    fn can_handle(&self, _event: &SettledEvent, _note: Option<&Note>) -> bool {
        true
    }

    async fn handle(&self, event: &SettledEvent) -> HandlerResult {
        let key = event.path.clone();
        {
            let mut in_flight = self.in_flight.lock();
            let n = in_flight.entry(key.clone()).or_default();
            *n += 1;
            self.max_per_path.fetch_max(*n, Ordering::SeqCst);
        }
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5)).await;

        // Sequence number travels in the settle time's sub-second part
        let seq = event
            .settled_at
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        self.order.lock().entry(key.clone()).or_default().push(seq);

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        *self.in_flight.lock().entry(key).or_default() -= 1;
        self.calls.fetch_add(1, Ordering::SeqCst);
        HandlerResult::unchanged()
    }
}

#[tokio::test]
async fn test_same_path_never_interleaves() {
    let handler = Arc::new(Tracking::default());
    let mut registry = CapabilityRegistry::new(DispatchMode::First);
    registry.register(handler.clone());

    let config = DispatchConfig {
        workers: 4,
        ..Default::default()
    };
    let dispatcher = EventDispatcher::new(registry, Arc::new(HealthAggregator::new()), &config);

    let paths: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("/vault/note-{i}.md"))).collect();
    for seq in 0..20u32 {
        for path in &paths {
            let mut event = SettledEvent::now(path, ChangeKind::Modified);
            event.settled_at = std::time::UNIX_EPOCH + Duration::new(1, seq);
            dispatcher.submit(event);
        }
    }

    tokio::time::timeout(Duration::from_secs(10), dispatcher.wait_idle())
        .await
        .unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 60);
    assert_eq!(dispatcher.interleavings(), 0);
    assert_eq!(handler.max_per_path.load(Ordering::SeqCst), 1);
    // Different paths do run side by side
    assert!(handler.max_concurrent.load(Ordering::SeqCst) >= 2);

    // Per path, events ran in submission order
    for (path, seqs) in handler.order.lock().iter() {
        let expected: Vec<u32> = (0..20).collect();
        assert_eq!(seqs, &expected, "{}", path.display());
    }

    dispatcher.shutdown().await;
}
