//! Run command - the daemon in the foreground.

use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::daemon::Daemon;

/// Start the daemon and block until Ctrl-C.
pub async fn run_daemon(mut settings: Settings, roots: Vec<PathBuf>, poll: bool) -> Result<()> {
    for root in roots {
        if !settings.watch.roots.contains(&root) {
            settings.watch.roots.push(root);
        }
    }
    if poll {
        settings.watch.poll = true;
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => crate::log_event!("daemon", "interrupt", "shutting down"),
            Err(e) => tracing::error!("[daemon] failed to listen for Ctrl-C: {e}"),
        }
        signal_cancel.cancel();
    });

    Daemon::new(settings).run(cancel).await?;
    Ok(())
}
