//! Capability-based dispatch of settled events to feature handlers.

mod dispatcher;
mod handler;
mod registry;
mod result;

pub use dispatcher::{COMPONENT, EventDispatcher};
pub use handler::{EnrichmentHandler, HandlerKind};
pub use registry::CapabilityRegistry;
pub use result::{HandlerError, HandlerMetrics, HandlerResult};
