//! Note enrichment daemon.
//!
//! Watches a notes vault, debounces file changes and routes each settled
//! change to the enrichment handlers that claim it. Handlers reach external
//! AI services through a cached, rate limited client and write notes only
//! through the [`NoteLifecycleManager`](notes::NoteLifecycleManager).

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod notes;
pub mod utils;
pub mod watcher;

pub use config::Settings;
pub use daemon::{Daemon, DaemonError};
pub use error::ErrorKind;
