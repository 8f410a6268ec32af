//! Health and metrics aggregation.
//!
//! Every stage of the pipeline reports into one [`HealthAggregator`]. Readers
//! only ever see immutable [`HealthSnapshot`]s, which the daemon also exports
//! as JSON for external status tooling.

mod aggregator;
mod export;

pub use aggregator::{
    ComponentHealth, HEALTH_WINDOW, HandlerHealth, HealthAggregator, HealthSnapshot,
};
pub use export::{StatusExporter, read_snapshot, write_snapshot};
