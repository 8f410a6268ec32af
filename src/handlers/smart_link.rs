//! Smart link suggestions from embedding similarity.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{containing_root, markdown_files};
use crate::cache::CacheKey;
use crate::client::{EnrichmentRequest, EnrichmentResponse, Enricher};
use crate::config::SmartLinkConfig;
use crate::dispatch::{EnrichmentHandler, HandlerError, HandlerKind, HandlerResult};
use crate::notes::{Note, NoteDelta, NoteLifecycleManager};
use crate::utils::sha256_hex;
use crate::watcher::{ChangeKind, SettledEvent};

/// Cosine similarity of two vectors; 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

pub struct SmartLinkHandler {
    config: SmartLinkConfig,
    roots: Vec<PathBuf>,
    enricher: Enricher,
    lifecycle: Arc<NoteLifecycleManager>,
}

impl SmartLinkHandler {
    pub fn new(
        config: SmartLinkConfig,
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

    fn accepts(note: &Note) -> bool {
        !note.is_ai_processed() && note.get_bool("ready_for_processing")
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, HandlerError> {
        let key = CacheKey::new("embedding", &sha256_hex(text.as_bytes()));
        let request = EnrichmentRequest::Embed {
            text: text.to_string(),
        };
        match self.enricher.fetch(&key, &request).await? {
            (EnrichmentResponse::Embedding { vector }, _) => Ok(vector),
            _ => Err(HandlerError::permanent(
                "embedding service returned a non-embedding response",
            )),
        }
    }

    fn candidate_root(&self, path: &Path) -> Option<PathBuf> {
        self.config
            .link_root
            .clone()
            .or_else(|| containing_root(&self.roots, path).map(Path::to_path_buf))
            .or_else(|| path.parent().map(Path::to_path_buf))
    }

    async fn suggest(&self, event: &SettledEvent) -> Result<HandlerResult, HandlerError> {
        let note = self.lifecycle.read_note(&event.path).await?;
        if !Self::accepts(&note) {
            return Ok(HandlerResult::unchanged());
        }
        let text = note.body.trim();
        if text.is_empty() {
            return Err(HandlerError::permanent("note body is empty"));
        }

        let target = self.embed(text).await?;

        let mut optional_failed = false;
        let candidates = match self.candidate_root(&event.path) {
            Some(root) => markdown_files(&root, &event.path, self.config.max_candidates)
                .unwrap_or_else(|e| {
                    tracing::info!("[smart_link] candidate scan failed: {e}");
                    optional_failed = true;
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let existing = note.wikilinks();
        let mut scored = Vec::new();
        for path in candidates {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if existing.contains(&stem) {
                continue;
            }
            let Ok(candidate) = self.lifecycle.read_note(&path).await else {
                continue;
            };
            let body = candidate.body.trim();
            if body.is_empty() {
                continue;
            }
            match self.embed(body).await {
                Ok(vector) => {
                    let score = cosine_similarity(&target, &vector);
                    if score >= self.config.threshold {
                        scored.push((stem, score));
                    }
                }
                Err(e) => {
                    crate::debug_event!("smart_link", "candidate skipped", "{}: {e}", path.display());
                    optional_failed = true;
                }
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(self.config.max_links);

        let mut delta = NoteDelta::new().set("ai_processed", true).only_if_unprocessed();
        if !scored.is_empty() {
            let links = scored
                .iter()
                .map(|(stem, score)| format!("- [[{stem}]] ({score:.2})"))
                .collect::<Vec<_>>()
                .join("\n");
            delta = delta.append_section("Related Notes", links);
        }

        let changed = self.lifecycle.apply_delta(&event.path, &delta).await?;
        let result = if changed {
            HandlerResult::changed()
        } else {
            HandlerResult::unchanged()
        };
        Ok(result
            .with_bytes(text.len() as u64)
            .with_optional_failure(optional_failed))
    }
}

#[async_trait]
impl EnrichmentHandler for SmartLinkHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::SmartLink
    }

    fn can_handle(&self, event: &SettledEvent, note: Option<&Note>) -> bool {
        event.kind != ChangeKind::Removed && event.is_markdown() && note.is_some_and(Self::accepts)
    }

    async fn handle(&self, event: &SettledEvent) -> HandlerResult {
        self.suggest(event).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::client::{BackendError, EnrichmentBackend, RateLimitedClient};
    use crate::config::ServiceConfig;
    use std::time::Duration;

    /// Embeds by keyword so similarity is predictable.
    struct Keywords;

    #[async_trait]
    impl EnrichmentBackend for Keywords {
        async fn invoke(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError> {
            let EnrichmentRequest::Embed { text } = request else {
                return Err(BackendError::Status(400, "unsupported".into()));
            };
            if text.contains("broken") {
                return Err(BackendError::Status(422, "cannot embed".into()));
            }
            let vector = ["rust", "async", "garden"]
                .iter()
                .map(|w| if text.contains(w) { 1.0 } else { 0.0 })
                .collect();
            Ok(EnrichmentResponse::Embedding { vector })
        }
    }

    fn handler(root: &Path) -> SmartLinkHandler {
        let client = RateLimitedClient::new(
            "embedding",
            ServiceConfig {
                cooldown_ms: 0,
                max_retries: 0,
                ..Default::default()
            },
            Arc::new(Keywords),
        );
        SmartLinkHandler::new(
            SmartLinkConfig::default(),
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
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_links_similar_notes_and_flags_failed_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.md");
        std::fs::write(&target, "---\nready_for_processing: true\n---\nrust async runtimes\n").unwrap();
        std::fs::write(dir.path().join("similar.md"), "---\n---\nrust async tasks\n").unwrap();
        std::fs::write(dir.path().join("other.md"), "---\n---\ngarden plans\n").unwrap();
        std::fs::write(dir.path().join("bad.md"), "---\n---\nbroken rust\n").unwrap();

        let handler = handler(dir.path());
        let event = SettledEvent::now(&target, ChangeKind::Modified);
        let note = Note::parse(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert!(handler.can_handle(&event, Some(&note)));

        let result = handler.handle(&event).await;
        assert!(result.success && result.changed);
        assert!(result.optional_step_failed);

        let updated = Note::parse(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert!(updated.is_ai_processed());
        assert_eq!(updated.wikilinks(), vec!["similar"]);

        // Processed notes are left alone
        assert!(!handler.can_handle(&event, Some(&updated)));
        let again = handler.handle(&event).await;
        assert!(again.success && !again.changed);
    }
}
