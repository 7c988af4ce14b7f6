//! The query descriptor: everything needed to issue one API call.

use crate::rate_limit::RateLimitingRule;
use crate::retry::{RetryOn, RetryPolicy};
use crate::transport::TransportRequest;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use url::Url;

/// Wire format requested from the upstream API.
///
/// The format picks the extension appended to the action (`statuses/show.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// `application/json`
    #[default]
    Json,
    /// `application/xml`
    Xml,
}

impl Format {
    /// The URL extension for this format, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Xml => "xml",
        }
    }
}

/// Local caching hints for a query.
///
/// Only consulted when the client was built with a response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    /// The cached body is discarded at this instant.
    pub absolute_expiration: Option<SystemTime>,
    /// The cached body is discarded once it has not been read for this long.
    pub sliding_expiration: Option<Duration>,
}

impl CachePolicy {
    /// Cache until a fixed point in time.
    pub fn absolute(at: SystemTime) -> Self {
        Self {
            absolute_expiration: Some(at),
            sliding_expiration: None,
        }
    }

    /// Cache for as long as the entry keeps being read within `window`.
    pub fn sliding(window: Duration) -> Self {
        Self {
            absolute_expiration: None,
            sliding_expiration: Some(window),
        }
    }
}

/// Signs or otherwise authorizes an outgoing request.
///
/// Credentials are opaque to the execution pipeline. OAuth signing lives outside this
/// crate and plugs in by implementing this trait.
pub trait Authenticator: Send + Sync {
    /// Mutates the request (usually its headers) to carry credentials.
    fn authorize(&self, request: &mut TransportRequest) -> crate::Result<()>;
}

/// Sends a fixed `Authorization: Bearer <token>` header.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wraps an already-issued bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(..)")
    }
}

impl Authenticator for BearerToken {
    fn authorize(&self, request: &mut TransportRequest) -> crate::Result<()> {
        let value = HeaderValue::try_from(format!("Bearer {}", self.0)).map_err(|e| {
            crate::Error::ConfigurationError(format!("Invalid bearer token: {}", e))
        })?;
        request.headers.insert(http::header::AUTHORIZATION, value);
        Ok(())
    }
}

/// A declarative description of one API call.
///
/// A `Query` is built by the caller and handed to [`Client::execute`](crate::Client::execute),
/// which only reads it. Parameters keep their insertion order and may repeat for
/// multi-valued parameters.
///
/// # Examples
///
/// ```
/// use chirpwire::{Query, RetryOn};
/// use std::time::Duration;
///
/// let query = Query::get("statuses/home_timeline")
///     .param("count", "50")
///     .param("include_entities", "true")
///     .retry_on(RetryOn::OUTAGE_PAGE_OR_NETWORK, 3)
///     .timeout(Duration::from_secs(10));
///
/// assert_eq!(query.action.as_deref(), Some("statuses/home_timeline"));
/// assert_eq!(query.params.len(), 2);
/// ```
#[derive(Clone)]
pub struct Query {
    /// The endpoint path relative to the base URL, without the format extension.
    pub action: Option<String>,

    /// The HTTP method.
    pub method: Method,

    /// Ordered request parameters. Duplicate keys are allowed.
    pub params: Vec<(String, String)>,

    /// Requested wire format.
    pub format: Format,

    /// Credentials applied right before dispatch.
    pub credentials: Option<Arc<dyn Authenticator>>,

    /// When to retry and how many attempts to make.
    pub retry_policy: Option<RetryPolicy>,

    /// Client-side pre-flight rate limiting.
    pub rate_limit: Option<RateLimitingRule>,

    /// Local caching hints.
    pub cache: Option<CachePolicy>,

    /// Per-attempt timeout. Falls back to the client default.
    pub timeout: Option<Duration>,

    /// Forces `https` (`true`) or `http` (`false`) regardless of the base URL.
    pub use_https: Option<bool>,

    /// Proxy to route this query through.
    pub proxy: Option<Url>,

    /// Extra headers for this query.
    pub headers: HeaderMap,

    /// Whether the query targets the long-lived streaming endpoint.
    pub streaming: bool,
}

impl Query {
    /// Creates an empty GET query with no action.
    pub fn new() -> Self {
        Self {
            action: None,
            method: Method::GET,
            params: Vec::new(),
            format: Format::Json,
            credentials: None,
            retry_policy: None,
            rate_limit: None,
            cache: None,
            timeout: None,
            use_https: None,
            proxy: None,
            headers: HeaderMap::new(),
            streaming: false,
        }
    }

    /// Creates a GET query for `action`.
    pub fn get(action: impl Into<String>) -> Self {
        Self::new().action(action)
    }

    /// Creates a POST query for `action`.
    pub fn post(action: impl Into<String>) -> Self {
        Self::new().action(action).method(Method::POST)
    }

    /// Sets the endpoint path.
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a parameter. Existing parameters with the same key are kept.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Appends several parameters in order.
    pub fn params(mut self, params: impl IntoIterator<Item = (String, String)>) -> Self {
        self.params.extend(params);
        self
    }

    /// Sets the wire format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Attaches credentials.
    pub fn credentials(mut self, credentials: Arc<dyn Authenticator>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Shorthand for a flag-selected retry policy with `max_attempts` total attempts.
    pub fn retry_on(self, retry_on: RetryOn, max_attempts: usize) -> Self {
        self.retry(RetryPolicy::new(retry_on, max_attempts))
    }

    /// Sets the client-side rate limiting rule.
    pub fn rate_limit(mut self, rule: RateLimitingRule) -> Self {
        self.rate_limit = Some(rule);
        self
    }

    /// Sets caching hints.
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the URL scheme.
    pub fn use_https(mut self, use_https: bool) -> Self {
        self.use_https = Some(use_https);
        self
    }

    /// Routes the query through a proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy URL is invalid.
    pub fn proxy(mut self, proxy: impl AsRef<str>) -> crate::Result<Self> {
        self.proxy = Some(Url::parse(proxy.as_ref())?);
        Ok(self)
    }

    /// Adds a header to the query.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> crate::Result<Self> {
        let name = HeaderName::try_from(name.as_ref()).map_err(|e| {
            crate::Error::ConfigurationError(format!("Invalid header name: {}", e))
        })?;
        let value = HeaderValue::try_from(value.as_ref()).map_err(|e| {
            crate::Error::ConfigurationError(format!("Invalid header value: {}", e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Marks the query as a streaming query.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Builds the absolute URL for this query against `base`.
    pub(crate) fn url(&self, base: &Url) -> crate::Result<Url> {
        let action = self
            .action
            .as_deref()
            .map(|a| a.trim_matches('/'))
            .filter(|a| !a.is_empty())
            .ok_or(crate::Error::MissingAction)?;

        let mut url = base.join(&format!("{}.{}", action, self.format.extension()))?;

        if let Some(https) = self.use_https {
            let scheme = if https { "https" } else { "http" };
            url.set_scheme(scheme).map_err(|_| {
                crate::Error::ConfigurationError(format!("Cannot switch scheme to {}", scheme))
            })?;
        }

        if !sends_form_body(&self.method) && !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }

        Ok(url)
    }

    /// The form-encoded body, for methods that carry parameters in the body.
    pub(crate) fn form_body(&self) -> Option<String> {
        if !sends_form_body(&self.method) || self.params.is_empty() {
            return None;
        }
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish(),
        )
    }
}

fn sends_form_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("action", &self.action)
            .field("method", &self.method)
            .field("params", &self.params)
            .field("format", &self.format)
            .field("credentials", &self.credentials.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("rate_limit", &self.rate_limit)
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("use_https", &self.use_https)
            .field("proxy", &self.proxy)
            .field("streaming", &self.streaming)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("http://api.example.com/1/").unwrap()
    }

    #[test]
    fn test_get_url_keeps_duplicate_params_in_order() {
        let query = Query::get("statuses/lookup")
            .param("id", 1)
            .param("id", 2)
            .param("trim_user", "true");

        let url = query.url(&base()).unwrap();
        assert_eq!(
            url.as_str(),
            "http://api.example.com/1/statuses/lookup.json?id=1&id=2&trim_user=true"
        );
        assert!(query.form_body().is_none());
    }

    #[test]
    fn test_post_params_go_to_body() {
        let query = Query::post("statuses/update").param("status", "hello world");

        let url = query.url(&base()).unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(query.form_body().as_deref(), Some("status=hello+world"));
    }

    #[test]
    fn test_format_and_scheme_override() {
        let query = Query::get("/users/show/")
            .format(Format::Xml)
            .use_https(true);

        let url = query.url(&base()).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/1/users/show.xml");
    }

    #[test]
    fn test_missing_action_is_rejected() {
        assert!(matches!(
            Query::new().url(&base()),
            Err(crate::Error::MissingAction)
        ));
        assert!(matches!(
            Query::get("  ").action("/").url(&base()),
            Err(crate::Error::MissingAction)
        ));
    }
}
