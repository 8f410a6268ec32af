//! Screenshot import: turns a new image into an inbox note.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::containing_root;
use crate::cache::CacheKey;
use crate::client::{EnrichmentRequest, EnrichmentResponse, Enricher};
use crate::config::ScreenshotConfig;
use crate::dispatch::{EnrichmentHandler, HandlerError, HandlerKind, HandlerResult};
use crate::notes::{LifecycleError, Note, NoteLifecycleManager};
use crate::utils::{note_timestamp, sha256_hex};
use crate::watcher::{ChangeKind, SettledEvent};

pub struct ScreenshotHandler {
    config: ScreenshotConfig,
    roots: Vec<PathBuf>,
    enricher: Enricher,
    lifecycle: Arc<NoteLifecycleManager>,
}

impl ScreenshotHandler {
    pub fn new(
        config: ScreenshotConfig,
        roots: Vec<PathBuf>,
        enricher: Enricher,
        lifecycle: Arc<NoteLifecycleManager>,
    ) -> Self {
        Self {
            config,
            roots,
            enricher,
            lifecycle,
        }
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.config.extensions.iter().any(|x| x.eq_ignore_ascii_case(&ext)))
    }

    /// Where the note for `image` lives: `notes_dir/<stem>.md`, with a
    /// relative `notes_dir` resolved against the image's watch root.
    pub fn note_path(&self, image: &Path) -> Option<PathBuf> {
        let stem = image.file_stem()?.to_string_lossy();
        let dir = if self.config.notes_dir.is_absolute() {
            self.config.notes_dir.clone()
        } else {
            let base = containing_root(&self.roots, image).or_else(|| image.parent())?;
            base.join(&self.config.notes_dir)
        };
        Some(dir.join(format!("{stem}.md")))
    }

    fn build_note(&self, image: &Path, description: &str, text: &str) -> Note {
        let shown = containing_root(&self.roots, image)
            .and_then(|root| image.strip_prefix(root).ok())
            .unwrap_or(image);

        let mut note = Note::default();
        note.set("type", "fleeting");
        note.set("status", "inbox");
        note.set("created", note_timestamp());
        note.set("source", "screenshot");
        note.set("screenshot", shown.to_string_lossy().to_string());
        note.set("ai_processed", true);

        let title = image
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_name = image
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        note.body = format!("# {title}\n\n![[{file_name}]]\n");
        note.append_section("Description", description.trim());
        if !text.trim().is_empty() {
            note.append_section("Extracted Text", text.trim());
        }
        note
    }

    async fn import(&self, event: &SettledEvent) -> Result<HandlerResult, HandlerError> {
        let note_path = self
            .note_path(&event.path)
            .ok_or_else(|| HandlerError::permanent("image path has no file name"))?;
        if note_path.exists() {
            return Ok(HandlerResult::unchanged());
        }

        let bytes = tokio::fs::read(&event.path).await?;
        let size = bytes.len() as u64;
        let key = CacheKey::new("vision", &sha256_hex(&bytes));
        let request = EnrichmentRequest::DescribeImage {
            path: event.path.clone(),
            bytes,
        };

        let (response, _) = self.enricher.fetch(&key, &request).await?;
        let EnrichmentResponse::Description { description, text } = response else {
            return Err(HandlerError::permanent("vision service returned a non-description response"));
        };

        let note = self.build_note(&event.path, &description, &text);
        match self.lifecycle.create_note(&note_path, &note).await {
            Ok(()) => Ok(HandlerResult::changed().with_bytes(size)),
            // Someone else imported it meanwhile
            Err(LifecycleError::AlreadyExists(_)) => Ok(HandlerResult::unchanged()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EnrichmentHandler for ScreenshotHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Screenshot
    }

    fn can_handle(&self, event: &SettledEvent, _note: Option<&Note>) -> bool {
        event.kind != ChangeKind::Removed
            && self.is_image(&event.path)
            && self.note_path(&event.path).is_some_and(|p| !p.exists())
    }

    async fn handle(&self, event: &SettledEvent) -> HandlerResult {
        self.import(event).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::client::{BackendError, EnrichmentBackend, RateLimitedClient};
    use crate::config::ServiceConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Vision(AtomicUsize);

    #[async_trait]
    impl EnrichmentBackend for Vision {
        async fn invoke(&self, _: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(EnrichmentResponse::Description {
                description: "Meeting notes".to_string(),
                text: "Q3 goals".to_string(),
            })
        }
    }

    fn handler(root: &Path, backend: Arc<Vision>) -> ScreenshotHandler {
        let client = RateLimitedClient::new(
            "vision",
            ServiceConfig {
                cooldown_ms: 0,
                ..Default::default()
            },
            backend,
        );
        ScreenshotHandler::new(
            ScreenshotConfig::default(),
            vec![root.to_path_buf()],
            Enricher::new(
                Arc::new(client),
                Arc::new(ResultCache::in_memory()),
                Duration::from_secs(60),
            ),
            Arc::new(NoteLifecycleManager::new()),
        )
    }

    #[test]
    fn test_can_handle_only_new_images() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path(), Arc::new(Vision(AtomicUsize::new(0))));
        let shot = dir.path().join("shots").join("shot.PNG");

        assert!(handler.can_handle(&SettledEvent::now(&shot, ChangeKind::Created), None));
        assert!(!handler.can_handle(&SettledEvent::now(&shot, ChangeKind::Removed), None));
        assert!(!handler.can_handle(
            &SettledEvent::now(dir.path().join("a.md"), ChangeKind::Created),
            None
        ));

        std::fs::create_dir_all(dir.path().join("inbox")).unwrap();
        std::fs::write(dir.path().join("inbox").join("shot.md"), "").unwrap();
        assert!(!handler.can_handle(&SettledEvent::now(&shot, ChangeKind::Created), None));
    }

    #[tokio::test]
    async fn test_second_handle_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot.png");
        std::fs::write(&shot, b"\x89PNG fake").unwrap();
        let backend = Arc::new(Vision(AtomicUsize::new(0)));
        let handler = handler(dir.path(), backend.clone());
        let event = SettledEvent::now(&shot, ChangeKind::Created);

        let first = handler.handle(&event).await;
        assert!(first.success && first.changed);
        let note_path = dir.path().join("inbox").join("shot.md");
        let written = std::fs::read(&note_path).unwrap();

        let second = handler.handle(&event).await;
        assert!(second.success && !second.changed);
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&note_path).unwrap(), written);
    }
}
