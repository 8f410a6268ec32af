//! The outbound seam: requests, responses and the backend trait.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BackendError;

/// One enrichment operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum EnrichmentRequest {
    /// OCR and description of an image.
    DescribeImage {
        path: PathBuf,
        /// Raw image bytes; sent as the request body, not as JSON.
        #[serde(skip)]
        bytes: Vec<u8>,
    },
    /// Embedding vector for a text.
    Embed { text: String },
    /// Timestamped quotes from a video transcript.
    TranscriptQuotes { video_id: String, max_quotes: usize },
}

impl EnrichmentRequest {
    /// Endpoint name appended to the service base URL.
    pub fn operation(&self) -> &'static str {
        match self {
            EnrichmentRequest::DescribeImage { .. } => "describe_image",
            EnrichmentRequest::Embed { .. } => "embed",
            EnrichmentRequest::TranscriptQuotes { .. } => "transcript_quotes",
        }
    }
}

/// A transcript quote with its offset into the video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub timestamp_secs: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrichmentResponse {
    Description {
        description: String,
        #[serde(default)]
        text: String,
    },
    Embedding {
        vector: Vec<f32>,
    },
    Quotes {
        #[serde(default)]
        title: Option<String>,
        quotes: Vec<Quote>,
    },
}

/// Something that can perform an enrichment request.
///
/// Implementations make exactly one attempt per call; retries, cooldown and
/// circuit breaking belong to [`RateLimitedClient`](super::RateLimitedClient).
#[async_trait]
pub trait EnrichmentBackend: Send + Sync {
    async fn invoke(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError>;
}
