//! Ordered handler registry.

use std::sync::Arc;

use super::handler::{EnrichmentHandler, HandlerKind};
use crate::config::DispatchMode;
use crate::notes::Note;
use crate::watcher::SettledEvent;

/// Handlers in registration order, evaluated front to back.
pub struct CapabilityRegistry {
    handlers: Vec<Arc<dyn EnrichmentHandler>>,
    mode: DispatchMode,
}

impl CapabilityRegistry {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            handlers: Vec::new(),
            mode,
        }
    }

    /// Append a handler. A second handler of the same kind is ignored.
    pub fn register(&mut self, handler: Arc<dyn EnrichmentHandler>) -> &mut Self {
        if self.get(handler.kind()).is_some() {
            tracing::warn!("[dispatch] handler {} already registered", handler.kind());
        } else {
            self.handlers.push(handler);
        }
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn get(&self, kind: HandlerKind) -> Option<&Arc<dyn EnrichmentHandler>> {
        self.handlers.iter().find(|h| h.kind() == kind)
    }

    pub fn kinds(&self) -> Vec<HandlerKind> {
        self.handlers.iter().map(|h| h.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handlers that accept the event: the first match, or every match in
    /// registration order when the mode is [`DispatchMode::All`].
    pub fn matching(
        &self,
        event: &SettledEvent,
        note: Option<&Note>,
    ) -> Vec<Arc<dyn EnrichmentHandler>> {
        let mut matches = self
            .handlers
            .iter()
            .filter(|h| h.can_handle(event, note))
            .cloned();

        match self.mode {
            DispatchMode::First => matches.next().into_iter().collect(),
            DispatchMode::All => matches.collect(),
        }
    }
}
