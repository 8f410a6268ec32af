//! Raw and settled change events.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    /// Map a notify event kind. Access and unknown kinds are dropped.
    pub fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Created),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Removed),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
            EventKind::Modify(ModifyKind::Metadata(_)) => None,
            EventKind::Modify(_) => Some(ChangeKind::Modified),
            EventKind::Remove(_) => Some(ChangeKind::Removed),
            _ => None,
        }
    }
}

/// A single raw observation from a [`PathWatcher`](super::PathWatcher).
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: Instant::now(),
        }
    }
}

/// One coalesced event per debounce key, emitted after the quiet period.
///
/// `path` and `kind` come from the most recent raw event for the key.
#[derive(Debug, Clone)]
pub struct SettledEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub first_seen_at: Instant,
    pub settled_at: SystemTime,
    pub debounce_key: PathBuf,
}

impl SettledEvent {
    /// Build a settled event directly (tests, manual re-submission).
    pub fn now(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        let path = path.into();
        Self {
            debounce_key: debounce_key(&path),
            path,
            kind,
            first_seen_at: Instant::now(),
            settled_at: SystemTime::now(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    pub fn is_markdown(&self) -> bool {
        self.extension().as_deref() == Some("md")
    }
}

/// Canonical form of a path used to coalesce events.
///
/// Removed files cannot be canonicalized, so the parent is canonicalized and
/// the file name re-attached. If that fails too the lexical path is used.
pub fn debounce_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(ChangeKind::Created)
        );
        assert_eq!(ChangeKind::from_notify(&EventKind::Any), None);
    }

    #[test]
    fn test_debounce_key_for_removed_file() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone.md");
        let key = debounce_key(&gone);
        assert_eq!(key, dir.path().canonicalize().unwrap().join("gone.md"));
    }

    #[test]
    fn test_debounce_key_is_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "x").unwrap();
        let dotted = dir.path().join(".").join("a.md");
        assert_eq!(debounce_key(&dotted), debounce_key(&file));
    }
}
