//! File change detection and debouncing.
//!
//! # Architecture
//!
//! ```text
//! PathWatcher (one per root) --push--> EventQueue (bounded, drop-oldest)
//!                                           |
//!                                  DebounceCoordinator
//!                                           |
//!                                  mpsc<SettledEvent> --> EventDispatcher
//! ```

mod debouncer;
mod error;
mod event;
mod path_watcher;
mod queue;

pub use debouncer::{DebounceCoordinator, Debouncer};
pub use error::WatchError;
pub use event::{ChangeEvent, ChangeKind, SettledEvent, debounce_key};
pub use path_watcher::{PathWatcher, is_ignored};
pub use queue::EventQueue;
