//! Status command - print the last exported health snapshot as JSON.

use anyhow::{Context, Result};
use serde_json::json;

use crate::config::Settings;
use crate::daemon::{is_process_alive, read_pid};
use crate::health::read_snapshot;

pub fn run_status(settings: &Settings) -> Result<()> {
    let path = &settings.daemon.status_path;
    let snapshot = read_snapshot(path).with_context(|| {
        format!("No health snapshot at {} (is the daemon running?)", path.display())
    })?;

    let daemon = &settings.daemon;
    let pid = read_pid(&daemon.pid_file);
    let report = json!({
        "daemon": {
            "name": daemon.name,
            "description": daemon.description,
            "pid": pid,
            "running": pid.is_some_and(is_process_alive),
        },
        "healthy": snapshot.is_healthy(),
        "health": snapshot,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
