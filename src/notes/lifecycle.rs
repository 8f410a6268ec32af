//! Serialized, atomic note mutations.
//!
//! Every write to a note goes through [`NoteLifecycleManager`]. Writes for one
//! path are serialized by a per-path async lock, re-read the file under that
//! lock, and replace it via temp file + fsync + rename so a crash never
//! leaves a half-written note.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

use super::frontmatter::{Note, is_known_key};
use super::status::NoteStatus;
use crate::error::{ErrorKind, classify_io};
use crate::utils::{note_timestamp, write_atomic};
use crate::watcher::debounce_key;

/// Transition records kept in memory. Older ones are still in the journal.
const HISTORY_LIMIT: usize = 10_000;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Note not found: {0}")]
    NotFound(PathBuf),

    #[error("Note already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Malformed frontmatter in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Unknown status '{value}' in {path}")]
    UnknownStatus { path: PathBuf, value: String },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: NoteStatus, to: NoteStatus },

    #[error("Undocumented frontmatter key '{0}'")]
    UndocumentedKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            LifecycleError::Io(e) => classify_io(e),
            _ => ErrorKind::Permanent,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// One applied status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub path: PathBuf,
    pub from: NoteStatus,
    pub to: NoteStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A content change produced by a handler: documented field updates plus
/// optional appended body sections.
#[derive(Debug, Clone, Default)]
pub struct NoteDelta {
    pub fields: Vec<(String, Value)>,
    pub sections: Vec<(String, String)>,
    /// Skip the write if the note is already `ai_processed` when re-read.
    pub only_if_unprocessed: bool,
}

impl NoteDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn append_section(mut self, heading: &str, content: impl Into<String>) -> Self {
        self.sections.push((heading.to_string(), content.into()));
        self
    }

    pub fn only_if_unprocessed(mut self) -> Self {
        self.only_if_unprocessed = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.sections.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct NoteLifecycleManager {
    locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    history: Mutex<VecDeque<TransitionRecord>>,
    journal: Option<PathBuf>,
}

impl NoteLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also append every transition as a JSON line to `path`.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(debounce_key(path))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Read and parse a note.
    pub async fn read_note(&self, path: &Path) -> LifecycleResult<Note> {
        read_note_file(path)
    }

    /// Move a note to `new_status`.
    ///
    /// Rejected transitions and undocumented metadata keys leave the file
    /// untouched. A note without `status` counts as `inbox`.
    pub async fn update_status(
        &self,
        path: &Path,
        new_status: NoteStatus,
        reason: Option<&str>,
        metadata: Vec<(String, Value)>,
    ) -> LifecycleResult<TransitionRecord> {
        if let Some((key, _)) = metadata
            .iter()
            .find(|(k, _)| !is_known_key(k) || k == "status")
        {
            return Err(LifecycleError::UndocumentedKey(key.clone()));
        }

        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut note = read_note_file(path)?;
        let current = current_status(path, &note)?;
        if !current.can_transition_to(new_status) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: new_status,
            });
        }

        for (key, value) in metadata {
            note.set(&key, value);
        }
        note.set("status", new_status.as_str());
        if let Some(field) = new_status.timestamp_field() {
            note.set(field, note_timestamp());
        }
        if let Some(reason) = reason {
            note.set("status_reason", reason);
        }

        write_note_file(path, &note)?;

        let record = TransitionRecord {
            path: path.to_path_buf(),
            from: current,
            to: new_status,
            reason: reason.map(str::to_string),
            at: Utc::now(),
        };
        self.record(&record);
        crate::log_event!("lifecycle", "transition", "{} {current} -> {new_status}", path.display());
        Ok(record)
    }

    /// Create a new note. Fails if the file already exists.
    pub async fn create_note(&self, path: &Path, note: &Note) -> LifecycleResult<()> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        if path.exists() {
            return Err(LifecycleError::AlreadyExists(path.to_path_buf()));
        }
        write_note_file(path, note)?;
        crate::debug_event!("lifecycle", "created", "{}", path.display());
        Ok(())
    }

    /// Apply a handler's delta. Returns whether the file was written.
    pub async fn apply_delta(&self, path: &Path, delta: &NoteDelta) -> LifecycleResult<bool> {
        if let Some((key, _)) = delta
            .fields
            .iter()
            .find(|(k, _)| !is_known_key(k) || k == "status")
        {
            return Err(LifecycleError::UndocumentedKey(key.clone()));
        }
        if delta.is_empty() {
            return Ok(false);
        }

        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut note = read_note_file(path)?;
        if delta.only_if_unprocessed && note.is_ai_processed() {
            return Ok(false);
        }

        for (key, value) in &delta.fields {
            note.set(key, value.clone());
        }
        for (heading, content) in &delta.sections {
            note.append_section(heading, content);
        }

        write_note_file(path, &note)?;
        crate::debug_event!("lifecycle", "updated", "{}", path.display());
        Ok(true)
    }

    /// Transitions applied to `path` since start, oldest first.
    pub fn history(&self, path: &Path) -> Vec<TransitionRecord> {
        let key = debounce_key(path);
        self.history
            .lock()
            .iter()
            .filter(|r| r.path == path || debounce_key(&r.path) == key)
            .cloned()
            .collect()
    }

    pub fn all_history(&self) -> Vec<TransitionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    fn record(&self, record: &TransitionRecord) {
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        if let Some(journal) = &self.journal
            && let Err(e) = append_journal(journal, record)
        {
            tracing::warn!("[lifecycle] failed to append journal {}: {e}", journal.display());
        }
    }
}

fn current_status(path: &Path, note: &Note) -> LifecycleResult<NoteStatus> {
    match note.get_str("status") {
        None => Ok(NoteStatus::Inbox),
        Some(value) => value
            .parse()
            .map_err(|_| LifecycleError::UnknownStatus {
                path: path.to_path_buf(),
                value,
            }),
    }
}

fn read_note_file(path: &Path) -> LifecycleResult<Note> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LifecycleError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    Note::parse(&content).map_err(|e| LifecycleError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_note_file(path: &Path, note: &Note) -> LifecycleResult<()> {
    let rendered = note.render().map_err(|e| LifecycleError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(path, rendered.as_bytes())?;
    Ok(())
}

fn append_journal(journal: &Path, record: &TransitionRecord) -> std::io::Result<()> {
    if let Some(parent) = journal.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(journal)?;
    file.write_all(line.as_bytes())
}
