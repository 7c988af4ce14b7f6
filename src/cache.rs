//! A local response cache in front of any [`Transport`].
//!
//! Only GET queries that carry a [`CachePolicy`] are cached. A hit is returned without a
//! response URI, which is how [`Response::is_from_cache`](crate::Response::is_from_cache)
//! tells it apart from a round trip.
//!
//! Entries are keyed by URL and request headers, so callers with different credentials
//! never read each other's responses.

use crate::classify::classify;
use crate::normalize::Normalizer;
use crate::query::CachePolicy;
use crate::transport::{AttemptOutcome, StreamingAttempt, Transport, TransportRequest};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Clone)]
struct CacheEntry {
    body: String,
    status: StatusCode,
    content_type: Option<String>,
    headers: HeaderMap,
    policy: CachePolicy,
    last_access: SystemTime,
}

impl CacheEntry {
    fn is_fresh(&self, now: SystemTime) -> bool {
        if self.policy.absolute_expiration.is_some_and(|at| now >= at) {
            return false;
        }
        if let Some(window) = self.policy.sliding_expiration {
            let idle = now.duration_since(self.last_access).unwrap_or_default();
            if idle >= window {
                return false;
            }
        }
        true
    }
}

/// The URL plus every request header, in a stable order.
fn cache_key(request: &TransportRequest) -> String {
    let mut headers: Vec<String> = request
        .headers
        .iter()
        .map(|(name, value)| format!("{}:{}", name, String::from_utf8_lossy(value.as_bytes())))
        .collect();
    headers.sort();

    let mut key = request.url.to_string();
    for header in headers {
        key.push('\n');
        key.push_str(&header);
    }
    key
}

/// Wraps a transport with an LRU cache of successful GET bodies.
pub struct CachingTransport {
    inner: Arc<dyn Transport>,
    entries: Mutex<LruCache<String, CacheEntry>>,
    normalizer: Normalizer,
}

impl CachingTransport {
    /// Caches up to `capacity` responses (at least one).
    pub fn new(inner: Arc<dyn Transport>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            normalizer: Normalizer::json(),
        }
    }

    /// Sets the normalizer used to spot errors reported inside successful bodies.
    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Drops every cached response.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// The number of cached responses, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> Option<AttemptOutcome> {
        let now = SystemTime::now();
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if !entry.is_fresh(now) {
            entries.pop(key);
            return None;
        }
        entry.last_access = now;

        let mut outcome = AttemptOutcome::with_response(
            entry.status,
            entry.content_type.as_deref(),
            entry.body.clone(),
        );
        outcome.headers = entry.headers.clone();
        Some(outcome)
    }

    fn store(&self, key: String, request: &TransportRequest, outcome: &AttemptOutcome) {
        let Some(policy) = request.cache else {
            return;
        };
        let Some(status) = outcome.status.filter(StatusCode::is_success) else {
            return;
        };
        if outcome.body.is_empty() || classify(outcome).is_service_error {
            return;
        }
        let normalizer = self.normalizer.for_format(request.format);
        if normalizer.body_error(&outcome.body).is_some() {
            tracing::debug!(url = %request.url, "Not caching a response that reports an error");
            return;
        }
        self.entries.lock().put(
            key,
            CacheEntry {
                body: outcome.body.clone(),
                status,
                content_type: outcome.content_type.clone(),
                headers: outcome.headers.clone(),
                policy,
                last_access: SystemTime::now(),
            },
        );
    }
}

#[async_trait]
impl Transport for CachingTransport {
    async fn send(&self, request: &TransportRequest) -> AttemptOutcome {
        if request.cache.is_none() || request.method != Method::GET {
            return self.inner.send(request).await;
        }
        let key = cache_key(request);

        if let Some(hit) = self.lookup(&key) {
            tracing::debug!(url = %request.url, "Serving response from local cache");
            return hit;
        }

        let outcome = self.inner.send(request).await;
        self.store(key, request, &outcome);
        outcome
    }

    async fn open_stream(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<StreamingAttempt, AttemptOutcome> {
        self.inner.open_stream(request).await
    }
}
