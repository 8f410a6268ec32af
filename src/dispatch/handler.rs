//! The capability interface every feature handler implements.

use async_trait::async_trait;

use super::result::HandlerResult;
use crate::notes::Note;
use crate::watcher::SettledEvent;

/// Closed set of handler variants, in default registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Screenshot,
    Transcript,
    SmartLink,
}

impl HandlerKind {
    pub fn name(self) -> &'static str {
        match self {
            HandlerKind::Screenshot => "screenshot",
            HandlerKind::Transcript => "transcript",
            HandlerKind::SmartLink => "smart_link",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A feature handler.
///
/// `can_handle` must be side-effect free and may only look at the event and
/// the note snapshot the dispatcher read from disk. `handle` re-checks its
/// own guard so that a second call on an already processed note does
/// nothing.
#[async_trait]
pub trait EnrichmentHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn can_handle(&self, event: &SettledEvent, note: Option<&Note>) -> bool;

    async fn handle(&self, event: &SettledEvent) -> HandlerResult;
}
