//! Transcript quote extraction for video notes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use super::{containing_root, markdown_files};
use crate::cache::CacheKey;
use crate::client::{EnrichmentRequest, EnrichmentResponse, Enricher, Quote};
use crate::config::TranscriptConfig;
use crate::dispatch::{EnrichmentHandler, HandlerError, HandlerKind, HandlerResult};
use crate::error::ErrorKind;
use crate::notes::{Note, NoteDelta, NoteLifecycleManager};
use crate::watcher::{ChangeKind, SettledEvent};

/// Upper bound on notes scanned when cross-linking.
const MAX_SCAN: usize = 5_000;

static VIDEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|embed/|live/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .expect("valid regex")
});

/// Extract a YouTube video id from a URL.
pub fn parse_video_id(url: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `video_id`, or one parsed from `url`.
fn video_id(note: &Note) -> Option<String> {
    note.get_str("video_id")
        .or_else(|| note.get_str("url").as_deref().and_then(parse_video_id))
}

fn format_timestamp(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

fn render_quotes(video_id: &str, quotes: &[Quote]) -> String {
    if quotes.is_empty() {
        return "_No quotes returned for this video._".to_string();
    }
    quotes
        .iter()
        .map(|q| {
            format!(
                "- [{}](https://www.youtube.com/watch?v={video_id}&t={}s) {}",
                format_timestamp(q.timestamp_secs),
                q.timestamp_secs,
                q.text.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct TranscriptHandler {
    config: TranscriptConfig,
    roots: Vec<PathBuf>,
    enricher: Enricher,
    lifecycle: Arc<NoteLifecycleManager>,
}

impl TranscriptHandler {
    pub fn new(
        config: TranscriptConfig,
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

    fn accepts(&self, note: &Note) -> bool {
        !note.is_ai_processed()
            && note
                .get_str("source")
                .is_some_and(|s| s.eq_ignore_ascii_case(&self.config.source))
            && video_id(note).is_some()
    }

    async fn extract(&self, event: &SettledEvent) -> Result<HandlerResult, HandlerError> {
        let note = self.lifecycle.read_note(&event.path).await?;
        if note.is_ai_processed() {
            return Ok(HandlerResult::unchanged());
        }
        if !self.accepts(&note) {
            return Err(HandlerError::permanent(format!(
                "note is not a {} note with a video id",
                self.config.source
            )));
        }
        let Some(video_id) = video_id(&note) else {
            return Err(HandlerError::permanent("missing video_id"));
        };

        let key = CacheKey::new("transcript", &video_id);
        let request = EnrichmentRequest::TranscriptQuotes {
            video_id: video_id.clone(),
            max_quotes: self.config.max_quotes,
        };
        let (response, _) = self.enricher.fetch(&key, &request).await?;
        let EnrichmentResponse::Quotes { quotes, .. } = response else {
            return Err(HandlerError::permanent("transcript service returned a non-quote response"));
        };

        let mut delta = NoteDelta::new()
            .set("ai_processed", true)
            .append_section("Key Quotes", render_quotes(&video_id, &quotes))
            .only_if_unprocessed();
        if note.get_str("video_id").is_none() {
            delta = delta.set("video_id", video_id.as_str());
        }

        if !self.lifecycle.apply_delta(&event.path, &delta).await? {
            return Ok(HandlerResult::unchanged());
        }

        let bytes: usize = quotes.iter().map(|q| q.text.len()).sum();
        let cross_linked = self.cross_link(&event.path, &video_id, &note).await;
        if let Err(e) = &cross_linked {
            tracing::info!("[transcript] cross-linking {} failed: {e}", event.path.display());
        }

        Ok(HandlerResult::changed()
            .with_bytes(bytes as u64)
            .with_optional_failure(cross_linked.is_err()))
    }

    /// Link other notes about the same video. Optional: errors never fail
    /// the quote extraction.
    async fn cross_link(&self, path: &Path, video_id: &str, note: &Note) -> Result<usize, HandlerError> {
        let Some(root) = self
            .config
            .link_root
            .as_deref()
            .or_else(|| containing_root(&self.roots, path))
        else {
            return Ok(0);
        };

        let existing = note.wikilinks();
        let files = markdown_files(root, path, MAX_SCAN)
            .map_err(|e| HandlerError::new(ErrorKind::Transient, e.to_string()))?;

        let mut links = Vec::new();
        for file in files {
            let Ok(other) = self.lifecycle.read_note(&file).await else {
                continue;
            };
            if video_id_matches(&other, video_id)
                && let Some(stem) = file.file_stem().map(|s| s.to_string_lossy().to_string())
                && !existing.contains(&stem)
            {
                links.push(format!("- [[{stem}]]"));
            }
        }

        if links.is_empty() {
            return Ok(0);
        }
        let count = links.len();
        let delta = NoteDelta::new().append_section("Same Video", links.join("\n"));
        self.lifecycle.apply_delta(path, &delta).await?;
        Ok(count)
    }
}

fn video_id_matches(note: &Note, id: &str) -> bool {
    video_id(note).is_some_and(|v| v == id)
}

#[async_trait]
impl EnrichmentHandler for TranscriptHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Transcript
    }

    fn can_handle(&self, event: &SettledEvent, note: Option<&Note>) -> bool {
        event.kind != ChangeKind::Removed && event.is_markdown() && note.is_some_and(|n| self.accepts(n))
    }

    async fn handle(&self, event: &SettledEvent) -> HandlerResult {
        self.extract(event).await.into()
    }
}
