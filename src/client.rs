//! The execution engine.
//!
//! The [`Client`] type runs [`Query`] values through the pipeline: rate limit check,
//! dispatch, classification, retry. Use [`ClientBuilder`] to configure and create clients.

use crate::cache::CachingTransport;
use crate::normalize::{Normalizer, Serializer};
use crate::query::Query;
use crate::rate_limit::{RateLimitStatus, RateLimitStatusSource, RateLimitingRule};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::stream::{
    Cancellation, Feed, Session, StreamEvent, StreamHandle, StreamLimits, StreamSummary,
    STREAM_BUFFER,
};
use crate::transport::{ReqwestTransport, Transport, TransportRequest};
use crate::{Error, Result};
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

const DEFAULT_RATE_LIMIT_STATUS_ACTION: &str = "account/rate_limit_status";

/// Executes queries against the upstream API.
///
/// The client is designed to be reused across many queries. It is cheap to clone and
/// every clone shares the same transport, cache and configuration.
///
/// Upstream and network failures never surface as [`Error`]: they are classified on the
/// returned [`Response`]. `Error` is reserved for queries that cannot be sent at all.
///
/// # Examples
///
/// ```no_run
/// use chirpwire::{Client, Query, RetryOn, RetryPolicy, RetryStrategy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), chirpwire::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/1/")?
///     .timeout(Duration::from_secs(30))
///     .user_agent("my-app/1.0")?
///     .retry_policy(
///         RetryPolicy::new(RetryOn::OUTAGE_PAGE_OR_NETWORK, 4).strategy(
///             RetryStrategy::ExponentialBackoff {
///                 initial_delay: Duration::from_millis(200),
///                 max_delay: Duration::from_secs(10),
///                 jitter: true,
///             },
///         ),
///     )
///     .build()?;
///
/// let response = client
///     .execute(&Query::get("users/show").param("screen_name", "jack"))
///     .await?;
/// if let Some(user) = response.as_user() {
///     println!("{:?} has {:?} followers", user.screen_name, user.followers_count);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Url,
    stream_base_url: Url,
    default_headers: HeaderMap,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    normalizer: Normalizer,
    rate_limit_source: Option<Arc<dyn RateLimitStatusSource>>,
    rate_limit_status_action: String,
}

/// A running [`Client::begin_execute`] call.
#[derive(Debug)]
pub struct ExecutionHandle {
    cancel: Cancellation,
    task: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Cancels the call.
    ///
    /// No further attempts are dispatched and the callback is not invoked, even if an
    /// attempt already in flight completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `true` once the call finished, callback included.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the call to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Background execution task failed");
        }
    }
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chirpwire::Client;
    ///
    /// # async fn example() -> Result<(), chirpwire::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://api.example.com/1/")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The normalizer responses from this client decode with, before a query's format
    /// is applied.
    pub fn normalizer(&self) -> &Normalizer {
        &self.inner.normalizer
    }

    /// Executes a query and returns the classified response of its last attempt.
    ///
    /// The query's rate limiting rule is consulted once, before the first attempt. If it
    /// says to skip, nothing is sent and the response has `is_rate_limited` set. Otherwise
    /// attempts are made until the retry policy (the query's, else the client default)
    /// stops matching or the attempt budget runs out.
    ///
    /// # Errors
    ///
    /// Returns an error only for queries that cannot be sent: no action, an unsupported
    /// method, or credentials that fail to apply.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chirpwire::{Client, Query, RateLimitingRule, RetryOn};
    ///
    /// # async fn example() -> Result<(), chirpwire::Error> {
    /// # let client = Client::builder().base_url("https://api.example.com/1/")?.build()?;
    /// let query = Query::get("statuses/home_timeline")
    ///     .retry_on(RetryOn::OUTAGE_PAGE | RetryOn::TIMEOUT, 3)
    ///     .rate_limit(RateLimitingRule::percentage(10.0));
    ///
    /// let response = client.execute(&query).await?;
    /// if response.is_rate_limited {
    ///     println!("skipped to save budget");
    /// } else {
    ///     println!("{} retries", response.retries);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, query: &Query) -> Result<Response> {
        let request = self.prepare(query, self.rest_base(query))?;
        Ok(self.run(query, request, None).await)
    }

    /// Executes a query in the background and hands the response to `callback`.
    ///
    /// Misuse is reported immediately, before anything is spawned. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus a configuration error when no runtime is
    /// available.
    pub fn begin_execute<F>(&self, query: Query, callback: F) -> Result<ExecutionHandle>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let runtime = current_runtime()?;
        let request = self.prepare(&query, self.rest_base(&query))?;
        let cancel = Cancellation::new();

        let client = self.clone();
        let token = cancel.clone();
        let task = runtime.spawn(async move {
            if token.is_cancelled() {
                return;
            }
            let response = client.run(&query, request, Some(&token)).await;
            if token.is_cancelled() {
                tracing::debug!(action = ?query.action, "Execution cancelled, dropping response");
                return;
            }
            callback(response);
        });

        Ok(ExecutionHandle { cancel, task })
    }

    /// Opens a streaming session and returns its event feed.
    ///
    /// Items arrive as [`StreamEvent::Item`]; the last event is always a
    /// [`StreamEvent::Finished`] carrying the summary. The query's retry policy decides
    /// whether a dropped connection is reopened. Limits span reconnects.
    ///
    /// # Errors
    ///
    /// Returns an error for queries that cannot be sent, or when no Tokio runtime is
    /// available.
    pub fn stream<T>(&self, query: &Query, limits: StreamLimits) -> Result<Feed<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let runtime = current_runtime()?;
        if query.method != Method::GET && query.method != Method::POST {
            return Err(Error::InvalidMethod(query.method.clone()));
        }
        let request = self.prepare(query, &self.inner.stream_base_url)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = Cancellation::new();
        let session = Session {
            transport: self.inner.transport.clone(),
            request,
            policy: self.policy_for(query).cloned(),
            limits,
            normalizer: self.inner.normalizer.for_format(query.format),
            cancel: cancel.clone(),
        };
        runtime.spawn(session.run::<T>(tx));

        Ok(Feed::new(rx, cancel))
    }

    /// Runs a streaming session in the background with callbacks.
    ///
    /// `on_item` is called for every decoded item in arrival order. `on_complete` is
    /// called exactly once when the session ends, for any reason.
    ///
    /// # Errors
    ///
    /// Same as [`stream`](Self::stream).
    pub fn begin_stream<T, I, C>(
        &self,
        query: &Query,
        limits: StreamLimits,
        mut on_item: I,
        on_complete: C,
    ) -> Result<StreamHandle>
    where
        T: DeserializeOwned + Send + 'static,
        I: FnMut(T) + Send + 'static,
        C: FnOnce(StreamSummary) + Send + 'static,
    {
        let runtime = current_runtime()?;
        let mut feed = self.stream::<T>(query, limits)?;
        let handle = feed.handle();

        runtime.spawn(async move {
            while let Some(event) = feed.next().await {
                match event {
                    StreamEvent::Item(item) => on_item(item),
                    StreamEvent::Finished(summary) => {
                        on_complete(summary);
                        return;
                    }
                }
            }
        });

        Ok(handle)
    }

    fn rest_base(&self, query: &Query) -> &Url {
        if query.streaming {
            &self.inner.stream_base_url
        } else {
            &self.inner.base_url
        }
    }

    fn policy_for<'a>(&'a self, query: &'a Query) -> Option<&'a RetryPolicy> {
        query
            .retry_policy
            .as_ref()
            .or(self.inner.retry_policy.as_ref())
    }

    /// Validates a query and turns it into a wire request.
    fn prepare(&self, query: &Query, base: &Url) -> Result<TransportRequest> {
        let allowed = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
        if !allowed.contains(&query.method) {
            return Err(Error::InvalidMethod(query.method.clone()));
        }

        let url = query.url(base)?;

        let mut headers = self.inner.default_headers.clone();
        for (name, value) in &query.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut request = TransportRequest {
            method: query.method.clone(),
            url,
            headers,
            body: query.form_body(),
            timeout: query.timeout.or(self.inner.timeout),
            proxy: query.proxy.clone(),
            cache: query.cache,
            format: query.format,
        };

        if let Some(credentials) = &query.credentials {
            credentials.authorize(&mut request)?;
        }

        Ok(request)
    }

    /// The rate limit check and retry loop.
    async fn run(
        &self,
        query: &Query,
        request: TransportRequest,
        cancel: Option<&Cancellation>,
    ) -> Response {
        let normalizer = self.inner.normalizer.for_format(query.format);

        if let Some(rule) = &query.rate_limit {
            let status = self.rate_limit_status(rule, query).await;
            if rule.should_skip(status.as_ref()) {
                tracing::warn!(
                    action = ?query.action,
                    remaining = status.as_ref().map(|s| s.remaining_hits),
                    limit = status.as_ref().map(|s| s.hourly_limit),
                    "Rate limit budget low, skipping request"
                );
                return Response::rate_limited(status, normalizer);
            }
        }

        let policy = self.policy_for(query);
        let start_time = Instant::now();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;

            tracing::debug!(
                method = %request.method,
                url = %request.url,
                attempt = attempt,
                "Executing HTTP request"
            );
            let mut outcome = self.inner.transport.send(&request).await;
            normalizer.inspect(&mut outcome);

            let Some(policy) = policy.filter(|p| p.should_retry(&outcome, attempt)) else {
                break outcome;
            };
            if cancel.is_some_and(Cancellation::is_cancelled) {
                break outcome;
            }

            let delay = policy.delay_after(&outcome, attempt);
            tracing::warn!(
                attempt = attempt,
                status = ?outcome.status,
                fault = ?outcome.fault.as_ref().map(|f| f.kind),
                delay_ms = delay.as_millis(),
                "Request failed, retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if cancel.is_some_and(Cancellation::is_cancelled) {
                break outcome;
            }
        };

        let latency = start_time.elapsed();
        tracing::info!(
            status = ?outcome.status,
            latency_ms = latency.as_millis(),
            attempts = attempt,
            "Received HTTP response"
        );

        let mut response = Response::new(outcome, attempt - 1, normalizer);
        response.latency = latency;
        response
    }

    /// Fetches the budget for a rate limiting rule, at most once per call.
    async fn rate_limit_status(
        &self,
        rule: &RateLimitingRule,
        query: &Query,
    ) -> Option<RateLimitStatus> {
        if let Some(getter) = rule.status_getter() {
            return getter.fetch().await;
        }
        if let Some(source) = &self.inner.rate_limit_source {
            return source.fetch().await;
        }

        let status_query = Query::get(self.inner.rate_limit_status_action.clone());
        let mut request = self.prepare(&status_query, &self.inner.base_url).ok()?;
        if let Some(credentials) = &query.credentials {
            if let Err(e) = credentials.authorize(&mut request) {
                tracing::debug!(error = %e, "Could not authorize rate limit status request");
                return None;
            }
        }

        let outcome = self.inner.transport.send(&request).await;
        let response = Response::new(outcome, 0, self.inner.normalizer.clone());
        response
            .as_rate_limit_status()
            .or_else(|| response.rate_limit_status.clone())
    }
}

fn current_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| {
        Error::ConfigurationError(format!("Background execution needs a Tokio runtime: {}", e))
    })
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use chirpwire::{ClientBuilder, RetryOn, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), chirpwire::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com/1/")?
///     .stream_base_url("https://stream.example.com/1/")?
///     .timeout(Duration::from_secs(30))
///     .retry_policy(RetryPolicy::new(RetryOn::OUTAGE_PAGE, 3))
///     .response_cache(256)
///     .default_header("Accept-Language", "en")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    stream_base_url: Option<Url>,
    default_headers: HeaderMap,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
    serializer: Option<Arc<dyn Serializer>>,
    xml_serializer: Option<Arc<dyn Serializer>>,
    cache_capacity: Option<usize>,
    rate_limit_source: Option<Arc<dyn RateLimitStatusSource>>,
    rate_limit_status_action: String,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            stream_base_url: None,
            default_headers: HeaderMap::new(),
            retry_policy: None,
            timeout: None,
            transport: None,
            serializer: None,
            xml_serializer: None,
            cache_capacity: None,
            rate_limit_source: None,
            rate_limit_status_action: DEFAULT_RATE_LIMIT_STATUS_ACTION.to_string(),
        }
    }

    /// Sets the base URL actions are resolved against.
    ///
    /// Actions are joined as relative paths, so the URL should end with `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Sets the base URL for streaming queries. Defaults to the base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn stream_base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.stream_base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the `User-Agent` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn user_agent(self, user_agent: impl AsRef<str>) -> Result<Self> {
        self.default_header(http::header::USER_AGENT.as_str(), user_agent)
    }

    /// Sets the retry policy for queries that carry none of their own.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the serializer JSON responses are decoded with.
    ///
    /// The serializer also decides which successful bodies report an error, and so
    /// feeds the service-error retry condition.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Replaces the serializer used for queries in [`Format::Xml`](crate::Format::Xml).
    pub fn xml_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.xml_serializer = Some(serializer);
        self
    }

    /// Keeps up to `capacity` GET responses in a local cache.
    ///
    /// Only queries with a [`CachePolicy`](crate::CachePolicy) are cached.
    pub fn response_cache(mut self, capacity: usize) -> Self {
        self.cache_capacity = Some(capacity);
        self
    }

    /// Sets where rate limiting rules without their own getter read the budget from.
    ///
    /// Without a source, the client asks the rate limit status endpoint.
    pub fn rate_limit_source(mut self, source: impl RateLimitStatusSource + 'static) -> Self {
        self.rate_limit_source = Some(Arc::new(source));
        self
    }

    /// Sets the action of the rate limit status endpoint.
    pub fn rate_limit_status_action(mut self, action: impl Into<String>) -> Self {
        self.rate_limit_status_action = action.into();
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided or if the HTTP client cannot be built.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;
        let stream_base_url = self.stream_base_url.unwrap_or_else(|| base_url.clone());

        let mut normalizer = match self.serializer {
            Some(serializer) => Normalizer::new(serializer),
            None => Normalizer::json(),
        };
        if let Some(serializer) = self.xml_serializer {
            normalizer = normalizer.with_xml_serializer(serializer);
        }

        let mut transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        if let Some(capacity) = self.cache_capacity {
            transport =
                Arc::new(CachingTransport::new(transport, capacity).normalizer(normalizer.clone()));
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                stream_base_url,
                default_headers: self.default_headers,
                retry_policy: self.retry_policy,
                timeout: self.timeout,
                normalizer,
                rate_limit_source: self.rate_limit_source,
                rate_limit_status_action: self.rate_limit_status_action,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
