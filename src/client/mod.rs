//! Outbound calls to external enrichment services.
//!
//! Handlers never talk to a backend directly. They go through an
//! [`Enricher`], which consults the [`ResultCache`](crate::cache::ResultCache)
//! first and only then a [`RateLimitedClient`].

mod backend;
mod enricher;
mod error;
mod http;
mod rate_limit;

pub use backend::{EnrichmentBackend, EnrichmentRequest, EnrichmentResponse, Quote};
pub use enricher::{Enricher, Source};
pub use error::{BackendError, ClientError};
pub use http::HttpBackend;
pub use rate_limit::{RATE_LIMIT_FILE, RateLimitStore, RateLimitedClient};
