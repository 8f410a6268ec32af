//! Cache-then-client lookups used by the feature handlers.
//!
//! Lookups for the same key are single-flight: while one caller fetches,
//! the others wait on that key's lock and then read the cached result.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::backend::{EnrichmentRequest, EnrichmentResponse};
use super::error::ClientError;
use super::rate_limit::RateLimitedClient;
use crate::cache::{CacheKey, ResultCache};

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Upstream,
}

/// One service's client paired with the shared result cache.
#[derive(Clone)]
pub struct Enricher {
    client: Arc<RateLimitedClient>,
    cache: Arc<ResultCache>,
    ttl: Duration,
    in_flight: Arc<DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Enricher {
    pub fn new(client: Arc<RateLimitedClient>, cache: Arc<ResultCache>, ttl: Duration) -> Self {
        Self {
            client,
            cache,
            ttl,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn service(&self) -> &str {
        self.client.service()
    }

    /// Return the cached response for `key`, or fetch and cache it.
    ///
    /// A hit never touches the client. A failure to write the cache is
    /// logged; the fetched response is still returned.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        request: &EnrichmentRequest,
    ) -> Result<(EnrichmentResponse, Source), ClientError> {
        if let Some(response) = self.cached(key) {
            return Ok((response, Source::Cache));
        }

        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            // Filled by the caller we waited on
            match self.cached(key) {
                Some(response) => Ok((response, Source::Cache)),
                None => self.fetch_and_store(key, request).await,
            }
        };
        drop(lock);
        // Only the map still holds it: nobody else is waiting on this key
        self.in_flight
            .remove_if(key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    fn cached(&self, key: &CacheKey) -> Option<EnrichmentResponse> {
        let value = self.cache.get(key)?;
        match serde_json::from_value::<EnrichmentResponse>(value) {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!("[cache] stale entry shape for {}, refetching: {e}", self.service());
                None
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        request: &EnrichmentRequest,
    ) -> Result<(EnrichmentResponse, Source), ClientError> {
        let response = self.client.fetch_with_retry(request).await?;

        match serde_json::to_value(&response) {
            Ok(value) => {
                let cache = self.cache.clone();
                let key = key.clone();
                let ttl = self.ttl;
                // The write is synced to disk
                match tokio::task::spawn_blocking(move || cache.set(&key, value, ttl)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!("[cache] failed to store {} result: {e}", self.service())
                    }
                    Err(e) => tracing::warn!("[cache] store task for {} failed: {e}", self.service()),
                }
            }
            Err(e) => tracing::warn!("[cache] cannot serialize {} result: {e}", self.service()),
        }

        Ok((response, Source::Upstream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BackendError, EnrichmentBackend, Quote};
    use crate::config::ServiceConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EnrichmentBackend for Counting {
        async fn invoke(&self, _: &EnrichmentRequest) -> Result<EnrichmentResponse, BackendError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(EnrichmentResponse::Quotes {
                title: None,
                quotes: vec![Quote {
                    timestamp_secs: 42,
                    text: "ship it".to_string(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn test_second_fetch_is_a_cache_hit() {
        let backend = Arc::new(Counting(AtomicUsize::new(0)));
        let client = Arc::new(RateLimitedClient::new(
            "transcript",
            ServiceConfig {
                cooldown_ms: 0,
                ..Default::default()
            },
            backend.clone(),
        ));
        let enricher = Enricher::new(
            client,
            Arc::new(ResultCache::in_memory()),
            Duration::from_secs(60),
        );

        let key = CacheKey::new("transcript", "abc123");
        let request = EnrichmentRequest::TranscriptQuotes {
            video_id: "abc123".to_string(),
            max_quotes: 5,
        };

        let (first, src1) = enricher.fetch(&key, &request).await.unwrap();
        let (second, src2) = enricher.fetch(&key, &request).await.unwrap();

        assert_eq!(src1, Source::Upstream);
        assert_eq!(src2, Source::Cache);
        assert_eq!(first, second);
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let backend = Arc::new(Counting(AtomicUsize::new(0)));
        let client = Arc::new(RateLimitedClient::new(
            "transcript",
            ServiceConfig {
                cooldown_ms: 0,
                ..Default::default()
            },
            backend.clone(),
        ));
        let enricher = Enricher::new(
            client,
            Arc::new(ResultCache::in_memory()),
            Duration::from_secs(60),
        );

        let key = CacheKey::new("transcript", "shared");
        let request = EnrichmentRequest::TranscriptQuotes {
            video_id: "shared".to_string(),
            max_quotes: 5,
        };

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let enricher = enricher.clone();
            let key = key.clone();
            let request = request.clone();
            tasks.push(tokio::spawn(async move {
                enricher.fetch(&key, &request).await.unwrap().1
            }));
        }
        let mut sources = Vec::new();
        for task in tasks {
            sources.push(task.await.unwrap());
        }

        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
        assert_eq!(sources.iter().filter(|s| **s == Source::Upstream).count(), 1);
        assert!(enricher.in_flight.is_empty());
    }
}
