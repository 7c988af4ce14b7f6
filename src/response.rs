//! The value handed back to the caller after the retry loop ends.
//!
//! A [`Response`] keeps everything about the last attempt (raw body, status, headers,
//! fault) together with the classifier flags and the retry count. Failures are reported
//! here, not as errors: check the flags or test an accessor for `None`.

use crate::classify::classify;
use crate::models::{
    ApiError, Cursored, DirectMessage, List, SavedSearch, SearchResult, Status, TrendsResult,
    User, WhereOnEarthLocation,
};
use crate::normalize::Normalizer;
use crate::rate_limit::RateLimitStatus;
use crate::transport::{AttemptOutcome, Fault};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime};
use url::Url;

/// The result of executing a query.
///
/// # Examples
///
/// ```no_run
/// use chirpwire::{Client, Query, RetryOn};
///
/// # async fn example() -> Result<(), chirpwire::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/1/")?
///     .build()?;
///
/// let query = Query::get("statuses/home_timeline").retry_on(RetryOn::OUTAGE_PAGE, 3);
/// let response = client.execute(&query).await?;
///
/// if response.is_outage_page {
///     eprintln!("fail whale after {} retries", response.retries);
/// } else if let Some(statuses) = response.as_statuses() {
///     println!("{} statuses", statuses.len());
/// } else if let Some(error) = response.as_error() {
///     eprintln!("upstream said: {}", error);
/// } else {
///     eprintln!("unrecognized body: {}", response.body);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    /// The raw body of the last attempt.
    pub body: String,

    /// The HTTP status of the last attempt, if a response arrived.
    pub status: Option<StatusCode>,

    /// The declared content type.
    pub content_type: Option<String>,

    /// The response headers.
    pub headers: HeaderMap,

    /// The transport-level failure of the last attempt, if any.
    pub fault: Option<Fault>,

    /// Where the response came from. `None` when served locally.
    pub response_uri: Option<Url>,

    /// When the last attempt was dispatched.
    pub requested_at: Option<SystemTime>,

    /// When the last attempt finished.
    pub responded_at: Option<SystemTime>,

    /// Time from the first dispatch to the end of the last attempt.
    pub latency: Duration,

    /// How many retry-worthy attempts preceded the final one.
    pub retries: usize,

    /// The upstream served a degraded page.
    pub is_outage_page: bool,

    /// The upstream reported an error, or the attempt failed.
    pub is_service_error: bool,

    /// The transport failed below the HTTP layer.
    pub is_network_error: bool,

    /// The last attempt timed out.
    pub timed_out: bool,

    /// The body was served from the local cache.
    pub is_from_cache: bool,

    /// The query was skipped by its rate limiting rule; nothing was sent.
    pub is_rate_limited: bool,

    /// Budget reported by the `X-RateLimit-*` headers of the last attempt.
    pub rate_limit_status: Option<RateLimitStatus>,

    normalizer: Normalizer,
}

impl Response {
    /// Builds a response from the final attempt.
    ///
    /// The body is inspected with `normalizer` first, so an error reported inside a
    /// successful response sets `is_service_error` whatever the wire format.
    pub fn new(mut outcome: AttemptOutcome, retries: usize, normalizer: Normalizer) -> Self {
        normalizer.inspect(&mut outcome);
        let flags = classify(&outcome);
        let latency = outcome.elapsed().unwrap_or_default();
        let rate_limit_status = RateLimitStatus::from_headers(&outcome.headers);
        Self {
            body: outcome.body,
            status: outcome.status,
            content_type: outcome.content_type,
            headers: outcome.headers,
            fault: outcome.fault,
            response_uri: outcome.response_uri,
            requested_at: Some(outcome.requested_at),
            responded_at: outcome.responded_at,
            latency,
            retries,
            is_outage_page: flags.is_outage_page,
            is_service_error: flags.is_service_error,
            is_network_error: flags.is_network_error,
            timed_out: flags.timed_out,
            is_from_cache: flags.is_from_cache,
            is_rate_limited: false,
            rate_limit_status,
            normalizer,
        }
    }

    /// A response for a query the rate limiter suppressed.
    pub(crate) fn rate_limited(status: Option<RateLimitStatus>, normalizer: Normalizer) -> Self {
        Self {
            body: String::new(),
            status: None,
            content_type: None,
            headers: HeaderMap::new(),
            fault: None,
            response_uri: None,
            requested_at: None,
            responded_at: None,
            latency: Duration::ZERO,
            retries: 0,
            is_outage_page: false,
            is_service_error: false,
            is_network_error: false,
            timed_out: false,
            is_from_cache: false,
            is_rate_limited: true,
            rate_limit_status: status,
            normalizer,
        }
    }

    /// A response describing the end of a streaming session.
    pub(crate) fn streamed(
        outcome: AttemptOutcome,
        retries: usize,
        normalizer: Normalizer,
    ) -> Self {
        let mut response = Self::new(outcome, retries, normalizer);
        response.is_from_cache = false;
        response
    }

    /// Returns `true` for a 2xx response that is neither an outage page nor an error.
    pub fn is_success(&self) -> bool {
        !self.is_rate_limited
            && !self.is_service_error
            && self.status.is_some_and(|s| s.is_success())
    }

    /// Returns `true` if the query needed more than one attempt.
    pub fn was_retried(&self) -> bool {
        self.retries > 0
    }

    /// Returns a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// The normalizer this response decodes with.
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Decodes the body as a single `T`.
    pub fn as_single<T: DeserializeOwned>(&self) -> Option<T> {
        self.normalizer.single(self)
    }

    /// Decodes the body as a collection of `T`, bare or wrapped under `name`.
    pub fn as_collection<T: DeserializeOwned>(&self, name: &str) -> Option<Vec<T>> {
        self.normalizer.collection(self, name)
    }

    /// Decodes a cursor-paginated page of `T` wrapped under `name`.
    pub fn as_cursored<T: DeserializeOwned>(&self, name: &str) -> Option<Cursored<T>> {
        self.normalizer.cursored(self, name)
    }

    /// Reads the `next_cursor` value.
    pub fn next_cursor(&self) -> Option<i64> {
        self.normalizer.cursor(self, "next_cursor")
    }

    /// Reads the `previous_cursor` value.
    pub fn previous_cursor(&self) -> Option<i64> {
        self.normalizer.cursor(self, "previous_cursor")
    }

    /// Decodes a single account.
    pub fn as_user(&self) -> Option<User> {
        self.as_single()
    }

    /// Decodes accounts, bare or wrapped under `users`.
    pub fn as_users(&self) -> Option<Vec<User>> {
        self.as_collection("users")
    }

    /// Decodes a single status.
    pub fn as_status(&self) -> Option<Status> {
        self.as_single()
    }

    /// Decodes statuses, bare or wrapped under `statuses`.
    pub fn as_statuses(&self) -> Option<Vec<Status>> {
        self.as_collection("statuses")
    }

    /// Decodes a line-delimited streaming body, skipping control messages.
    pub fn as_streamed_statuses(&self) -> Option<Vec<Status>> {
        if self.is_outage_page {
            return None;
        }
        Some(self.normalizer.stream_collection(&self.body))
    }

    /// Decodes a single list.
    pub fn as_list(&self) -> Option<List> {
        self.as_single()
    }

    /// Decodes lists, bare or wrapped under `lists`.
    pub fn as_lists(&self) -> Option<Vec<List>> {
        self.as_collection("lists")
    }

    /// Decodes a single direct message.
    pub fn as_direct_message(&self) -> Option<DirectMessage> {
        self.as_single()
    }

    /// Decodes direct messages, bare or wrapped under `direct_messages`.
    pub fn as_direct_messages(&self) -> Option<Vec<DirectMessage>> {
        self.as_collection("direct_messages")
    }

    /// Decodes a single saved search.
    pub fn as_saved_search(&self) -> Option<SavedSearch> {
        self.as_single()
    }

    /// Decodes saved searches, bare or wrapped under `saved_searches`.
    pub fn as_saved_searches(&self) -> Option<Vec<SavedSearch>> {
        self.as_collection("saved_searches")
    }

    /// Decodes trend locations, bare or wrapped under `locations`.
    pub fn as_locations(&self) -> Option<Vec<WhereOnEarthLocation>> {
        self.as_collection("locations")
    }

    /// Decodes an upstream error in the current or legacy schema.
    pub fn as_error(&self) -> Option<ApiError> {
        self.normalizer.error(self)
    }

    /// Decodes a page of search results.
    pub fn as_search_result(&self) -> Option<SearchResult> {
        self.normalizer.search(self)
    }

    /// Decodes trending topics from any of the dated layouts.
    pub fn as_trends(&self) -> Option<TrendsResult> {
        self.normalizer.trends(self)
    }

    /// Decodes a rate limit status body.
    pub fn as_rate_limit_status(&self) -> Option<RateLimitStatus> {
        self.normalizer.rate_limit_status(self)
    }

    /// Decodes a page of raw ids.
    pub fn as_ids(&self) -> Option<Cursored<u64>> {
        self.normalizer.ids(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_response_flags_and_header_status() {
        let mut outcome =
            AttemptOutcome::with_response(StatusCode::OK, Some("application/json"), "[]");
        outcome.response_uri = Some(Url::parse("http://api.example.com/1/a.json").unwrap());
        outcome
            .headers
            .insert("x-ratelimit-limit", HeaderValue::from_static("150"));
        outcome
            .headers
            .insert("x-ratelimit-remaining", HeaderValue::from_static("149"));

        let response = Response::new(outcome, 2, Normalizer::json());
        assert!(response.is_success());
        assert!(response.was_retried());
        assert_eq!(response.rate_limit_status.as_ref().unwrap().remaining_hits, 149);
        assert_eq!(response.as_statuses(), Some(Vec::new()));
    }

    #[test]
    fn test_rate_limited_response() {
        let response = Response::rate_limited(None, Normalizer::json());
        assert!(response.is_rate_limited);
        assert!(!response.is_service_error);
        assert!(!response.is_success());
        assert_eq!(response.retries, 0);
        assert!(response.as_user().is_none());
    }

    #[test]
    fn test_streamed_response_never_from_cache() {
        let outcome = AttemptOutcome::with_response(StatusCode::OK, None, "{\"id\":1}");
        let response = Response::streamed(outcome, 0, Normalizer::json());
        assert!(!response.is_from_cache);
    }
}
