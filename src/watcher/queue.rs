//! Bounded raw event queue shared by all watcher roots.
//!
//! `push` never blocks: it is called from notify's callback thread. When the
//! queue is full the oldest event is discarded and counted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::event::ChangeEvent;

#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<VecDeque<ChangeEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Enqueue an event. Returns `true` if an older event had to be dropped.
    pub fn push(&self, event: ChangeEvent) -> bool {
        let dropped = {
            let mut queue = self.inner.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        self.inner.lock().drain(..).collect()
    }

    /// Wait until at least one event has been pushed since the last drain.
    pub async fn wait(&self) {
        if !self.inner.lock().is_empty() {
            return;
        }
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
