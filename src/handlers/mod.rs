//! Feature handlers.
//!
//! [`HandlerSet::from_settings`] is the only place handlers are constructed:
//! an explicit, ordered list (screenshot, transcript, smart link) with
//! disabled handlers left out.

mod screenshot;
mod smart_link;
mod transcript;

pub use screenshot::ScreenshotHandler;
pub use smart_link::{SmartLinkHandler, cosine_similarity};
pub use transcript::{TranscriptHandler, parse_video_id};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::ResultCache;
use crate::client::{Enricher, RateLimitedClient};
use crate::config::{DispatchMode, Settings};
use crate::dispatch::{CapabilityRegistry, EnrichmentHandler};
use crate::notes::NoteLifecycleManager;

#[derive(Error, Debug)]
pub enum HandlerSetError {
    #[error("handler {handler} uses service '{service}' which has no client")]
    UnknownService { handler: String, service: String },
}

/// Shared state injected into every handler.
pub struct HandlerContext {
    pub lifecycle: Arc<NoteLifecycleManager>,
    pub cache: Arc<ResultCache>,
    pub clients: HashMap<String, Arc<RateLimitedClient>>,
    pub cache_ttl: Duration,
    pub roots: Vec<PathBuf>,
}

impl HandlerContext {
    fn enricher(&self, handler: &str, service: &str) -> Result<Enricher, HandlerSetError> {
        let client = self
            .clients
            .get(service)
            .ok_or_else(|| HandlerSetError::UnknownService {
                handler: handler.to_string(),
                service: service.to_string(),
            })?;
        Ok(Enricher::new(client.clone(), self.cache.clone(), self.cache_ttl))
    }
}

/// The enabled handlers in registration order.
pub struct HandlerSet {
    handlers: Vec<Arc<dyn EnrichmentHandler>>,
}

impl HandlerSet {
    pub fn from_settings(settings: &Settings, ctx: &HandlerContext) -> Result<Self, HandlerSetError> {
        let mut handlers: Vec<Arc<dyn EnrichmentHandler>> = Vec::new();
        let config = &settings.handlers;

        if config.screenshot.enabled {
            handlers.push(Arc::new(ScreenshotHandler::new(
                config.screenshot.clone(),
                ctx.roots.clone(),
                ctx.enricher("screenshot", &config.screenshot.service)?,
                ctx.lifecycle.clone(),
            )));
        }
        if config.transcript.enabled {
            handlers.push(Arc::new(TranscriptHandler::new(
                config.transcript.clone(),
                ctx.roots.clone(),
                ctx.enricher("transcript", &config.transcript.service)?,
                ctx.lifecycle.clone(),
            )));
        }
        if config.smart_link.enabled {
            handlers.push(Arc::new(SmartLinkHandler::new(
                config.smart_link.clone(),
                ctx.roots.clone(),
                ctx.enricher("smart_link", &config.smart_link.service)?,
                ctx.lifecycle.clone(),
            )));
        }

        Ok(Self { handlers })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn into_registry(self, mode: DispatchMode) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new(mode);
        for handler in self.handlers {
            registry.register(handler);
        }
        registry
    }
}

/// The watch root that contains `path`, if any.
pub(crate) fn containing_root<'a>(roots: &'a [PathBuf], path: &Path) -> Option<&'a Path> {
    roots
        .iter()
        .filter(|root| path.starts_with(root))
        .max_by_key(|root| root.components().count())
        .map(PathBuf::as_path)
}

/// Markdown files under `root` (hidden entries skipped), excluding `exclude`,
/// in file name order, at most `limit`.
pub(crate) fn markdown_files(
    root: &Path,
    exclude: &Path,
    limit: usize,
) -> Result<Vec<PathBuf>, walkdir::Error> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().is_none_or(|e| e != "md")
            || path == exclude
        {
            continue;
        }
        files.push(path.to_path_buf());
        if files.len() >= limit {
            break;
        }
    }
    Ok(files)
}
