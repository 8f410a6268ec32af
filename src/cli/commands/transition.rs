//! Transition command - move a note through its lifecycle by hand.

use std::path::Path;

use anyhow::Result;

use crate::config::Settings;
use crate::notes::{NoteLifecycleManager, NoteStatus};

pub async fn run_transition(
    settings: &Settings,
    path: &Path,
    to: NoteStatus,
    reason: Option<&str>,
) -> Result<()> {
    let mut manager = NoteLifecycleManager::new();
    if let Some(journal) = &settings.lifecycle.journal_path {
        manager = manager.with_journal(journal);
    }

    let record = manager.update_status(path, to, reason, Vec::new()).await?;
    println!("{}: {} -> {}", record.path.display(), record.from, record.to);
    Ok(())
}
