//! The transport seam and the raw product of one round trip.
//!
//! [`Transport`] is the only place the pipeline touches the network. The default
//! [`ReqwestTransport`] never returns an error for upstream or network problems; it folds
//! them into an [`AttemptOutcome`] so the retry loop and classifier can reason about them.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use http::{HeaderMap, Method, StatusCode};
use std::time::{Duration, SystemTime};
use url::Url;

use crate::models::ApiError;
use crate::query::{CachePolicy, Format};

/// What went wrong at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The server answered with an HTTP error status (>= 400).
    ProtocolError,
    /// The attempt exceeded its configured timeout.
    Timeout,
    /// The request was cancelled before it completed.
    RequestCanceled,
    /// The host name could not be resolved.
    NameResolutionFailure,
    /// A connection could not be established.
    ConnectFailure,
    /// The remote end closed the connection before the response was complete.
    ConnectionClosed,
    /// The request could not be written.
    SendFailure,
    /// The response could not be read.
    ReceiveFailure,
    /// Anything the transport could not categorize.
    Unknown,
}

/// A transport-level failure captured on an [`AttemptOutcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// The failure category.
    pub kind: FaultKind,
    /// The HTTP status of the response attached to the fault, if any.
    pub status: Option<StatusCode>,
    /// Human-readable description for diagnostics.
    pub message: String,
}

impl Fault {
    /// Creates a fault without an attached response.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Creates a protocol fault for an HTTP error status.
    pub fn protocol(status: StatusCode) -> Self {
        Self {
            kind: FaultKind::ProtocolError,
            status: Some(status),
            message: format!("HTTP {}", status),
        }
    }

    /// Categorizes a `reqwest` error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FaultKind::Timeout
        } else if let Some(kind) = kind_from_sources(err) {
            kind
        } else if err.is_connect() {
            FaultKind::ConnectFailure
        } else if err.is_body() || err.is_decode() {
            FaultKind::ReceiveFailure
        } else if err.is_request() {
            FaultKind::SendFailure
        } else if err.is_status() {
            FaultKind::ProtocolError
        } else {
            FaultKind::Unknown
        };

        Self {
            kind,
            status: err.status(),
            message: err.to_string(),
        }
    }
}

/// Walks the error source chain looking for closed connections and DNS failures.
fn kind_from_sources(err: &(dyn std::error::Error + 'static)) -> Option<FaultKind> {
    let mut source = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return Some(FaultKind::ConnectionClosed),
                std::io::ErrorKind::TimedOut => return Some(FaultKind::Timeout),
                _ => {}
            }
        }
        let text = current.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return Some(FaultKind::NameResolutionFailure);
        }
        if text.contains("connection closed") || text.contains("incomplete message") {
            return Some(FaultKind::ConnectionClosed);
        }
        source = current.source();
    }
    None
}

/// A fully prepared request, ready for the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// The HTTP method.
    pub method: Method,
    /// The absolute URL including the query string.
    pub url: Url,
    /// All headers, defaults merged with per-query headers.
    pub headers: HeaderMap,
    /// Form-encoded body for POST/PUT.
    pub body: Option<String>,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Proxy to route through.
    pub proxy: Option<Url>,
    /// Local caching hints.
    pub cache: Option<CachePolicy>,
    /// The wire format the body is expected in.
    pub format: Format,
}

/// The raw product of one transport round trip.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// Response body, possibly empty.
    pub body: String,
    /// HTTP status, absent when no response was received.
    pub status: Option<StatusCode>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Response headers.
    pub headers: HeaderMap,
    /// Transport-level failure, if any.
    pub fault: Option<Fault>,
    /// The URI the response came from. `None` when served locally.
    pub response_uri: Option<Url>,
    /// When the request was dispatched.
    pub requested_at: SystemTime,
    /// When the response (or failure) arrived.
    pub responded_at: Option<SystemTime>,
    /// The timeout the attempt ran under.
    pub timeout: Option<Duration>,
    /// An error the upstream reported inside the body, filled in by
    /// [`Normalizer::inspect`](crate::normalize::Normalizer::inspect).
    pub body_error: Option<ApiError>,
}

impl AttemptOutcome {
    /// An outcome with no response yet, stamped with the current time.
    pub fn empty() -> Self {
        Self {
            body: String::new(),
            status: None,
            content_type: None,
            headers: HeaderMap::new(),
            fault: None,
            response_uri: None,
            requested_at: SystemTime::now(),
            responded_at: None,
            timeout: None,
            body_error: None,
        }
    }

    /// An outcome carrying a response.
    pub fn with_response(
        status: StatusCode,
        content_type: Option<&str>,
        body: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::empty();
        outcome.status = Some(status);
        outcome.content_type = content_type.map(str::to_owned);
        outcome.body = body.into();
        outcome.responded_at = Some(SystemTime::now());
        if status.is_client_error() || status.is_server_error() {
            outcome.fault = Some(Fault::protocol(status));
        }
        outcome
    }

    /// An outcome carrying only a fault.
    pub fn with_fault(fault: Fault) -> Self {
        let mut outcome = Self::empty();
        outcome.fault = Some(fault);
        outcome.responded_at = Some(SystemTime::now());
        outcome
    }

    /// How long the attempt took, if it finished.
    pub fn elapsed(&self) -> Option<Duration> {
        self.responded_at?.duration_since(self.requested_at).ok()
    }
}

/// Line-delimited body fragments of a streaming attempt.
pub type FragmentStream = BoxStream<'static, std::result::Result<Bytes, Fault>>;

/// An open streaming connection.
pub struct StreamingAttempt {
    /// Status, headers and timestamps of the connection. The body is empty.
    pub outcome: AttemptOutcome,
    /// The body, delivered as it arrives.
    pub body: FragmentStream,
}

/// Sends requests and reports what happened.
///
/// Implementations must not panic or return errors for upstream failures. Every
/// failure mode is reported through [`AttemptOutcome::fault`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one complete round trip.
    async fn send(&self, request: &TransportRequest) -> AttemptOutcome;

    /// Opens a long-lived connection.
    ///
    /// Returns the finished outcome instead when the connection could not be opened or
    /// the server answered with an error status.
    async fn open_stream(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<StreamingAttempt, AttemptOutcome>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with a default `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built.
    pub fn new() -> crate::Result<Self> {
        let http_client = reqwest::Client::builder().build().map_err(|e| {
            crate::Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { http_client })
    }

    /// Wraps an existing `reqwest` client.
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    fn client_for(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<reqwest::Client, Fault> {
        let Some(proxy) = &request.proxy else {
            return Ok(self.http_client.clone());
        };
        reqwest::Proxy::all(proxy.as_str())
            .and_then(|proxy| reqwest::Client::builder().proxy(proxy).build())
            .map_err(|e| Fault::new(FaultKind::SendFailure, format!("Invalid proxy: {}", e)))
    }

    fn build(
        &self,
        request: &TransportRequest,
        with_timeout: bool,
    ) -> std::result::Result<reqwest::RequestBuilder, Fault> {
        let client = self.client_for(request)?;
        let mut builder = client.request(request.method.clone(), request.url.clone());

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if with_timeout {
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(
                    http::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(body.clone());
        }

        Ok(builder)
    }
}

fn head_of(response: &reqwest::Response, mut outcome: AttemptOutcome) -> AttemptOutcome {
    let status = response.status();
    outcome.status = Some(status);
    outcome.headers = response.headers().clone();
    outcome.content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    outcome.response_uri = Some(response.url().clone());
    outcome.responded_at = Some(SystemTime::now());
    if status.is_client_error() || status.is_server_error() {
        outcome.fault = Some(Fault::protocol(status));
    }
    outcome
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &TransportRequest) -> AttemptOutcome {
        let mut outcome = AttemptOutcome::empty();
        outcome.timeout = request.timeout;

        let builder = match self.build(request, true) {
            Ok(builder) => builder,
            Err(fault) => {
                outcome.fault = Some(fault);
                return outcome;
            }
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                outcome.fault = Some(Fault::from_reqwest(&e));
                outcome.responded_at = Some(SystemTime::now());
                return outcome;
            }
        };

        let mut outcome = head_of(&response, outcome);
        match response.text().await {
            Ok(body) => outcome.body = body,
            Err(e) => {
                // Keep a protocol fault if one was already recorded.
                if outcome.fault.is_none() {
                    outcome.fault = Some(Fault::from_reqwest(&e));
                }
            }
        }
        outcome.responded_at = Some(SystemTime::now());
        outcome
    }

    async fn open_stream(
        &self,
        request: &TransportRequest,
    ) -> std::result::Result<StreamingAttempt, AttemptOutcome> {
        let mut outcome = AttemptOutcome::empty();
        outcome.timeout = request.timeout;

        // The session duration is enforced by the reader, not as a request timeout.
        let builder = match self.build(request, false) {
            Ok(builder) => builder,
            Err(fault) => {
                outcome.fault = Some(fault);
                return Err(outcome);
            }
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                outcome.fault = Some(Fault::from_reqwest(&e));
                outcome.responded_at = Some(SystemTime::now());
                return Err(outcome);
            }
        };

        let mut outcome = head_of(&response, outcome);
        if outcome.fault.is_some() {
            outcome.body = response.text().await.unwrap_or_default();
            return Err(outcome);
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Fault::from_reqwest(&e)))
            .boxed();

        Ok(StreamingAttempt { outcome, body })
    }
}
