//! Streaming sessions over a long-lived connection.
//!
//! The upstream's streaming endpoints keep one connection open and write one JSON
//! document per line. A session reads the body as it arrives, decodes each line on its
//! own, drops control messages, and forwards the rest through a channel. It ends when an
//! item or duration limit is hit, the caller cancels, or the connection drops and the
//! query's retry policy does not allow a restart.
//!
//! # Examples
//!
//! ```no_run
//! use chirpwire::{Client, Query, RetryOn};
//! use chirpwire::models::Status;
//! use chirpwire::stream::{StreamEvent, StreamLimits};
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), chirpwire::Error> {
//! let client = Client::builder()
//!     .base_url("https://api.example.com/1/")?
//!     .stream_base_url("https://stream.example.com/1/")?
//!     .build()?;
//!
//! let query = Query::get("statuses/sample")
//!     .streaming()
//!     .retry_on(RetryOn::CONNECTION_CLOSED | RetryOn::NETWORK, 3);
//! let limits = StreamLimits::unbounded()
//!     .items(100)
//!     .duration(Duration::from_secs(60));
//!
//! let mut feed = client.stream::<Status>(&query, limits)?;
//! while let Some(event) = feed.next().await {
//!     match event {
//!         StreamEvent::Item(status) => println!("{:?}", status.text),
//!         StreamEvent::Finished(summary) => println!("done: {:?}", summary.end),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::normalize::Normalizer;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{
    AttemptOutcome, Fault, FaultKind, FragmentStream, StreamingAttempt, Transport,
    TransportRequest,
};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

/// Capacity of the channel between the reader task and the consumer.
pub(crate) const STREAM_BUFFER: usize = 100;

/// Longest line a session buffers unless [`StreamLimits::line_limit`] says otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// A shared cancellation flag that can also be awaited.
#[derive(Clone, Debug)]
pub(crate) struct Cancellation {
    flag: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub(crate) fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub(crate) fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    pub(crate) async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// When a streaming session should stop on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamLimits {
    /// Stop after this much wall-clock time, restarts included.
    pub duration: Option<Duration>,
    /// Stop after delivering this many items, restarts included.
    pub item_limit: Option<usize>,
    /// Longest line accepted before the connection is treated as broken.
    /// Defaults to [`DEFAULT_MAX_LINE_BYTES`].
    pub max_line_bytes: Option<usize>,
}

impl StreamLimits {
    /// No limits: run until cancelled or disconnected.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Sets the duration limit.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the item limit.
    pub fn items(mut self, item_limit: usize) -> Self {
        self.item_limit = Some(item_limit);
        self
    }

    /// Sets the longest line the session buffers.
    ///
    /// A longer line is discarded and the connection is reported as a
    /// [`FaultKind::ReceiveFailure`], which the retry policy may restart.
    pub fn line_limit(mut self, bytes: usize) -> Self {
        self.max_line_bytes = Some(bytes);
        self
    }

    fn max_line(&self) -> usize {
        self.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES)
    }

    fn reached(&self, items: usize) -> bool {
        self.item_limit.is_some_and(|limit| items >= limit)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The item limit was reached.
    ItemLimit,
    /// The duration limit elapsed.
    Duration,
    /// The caller cancelled or dropped the feed.
    Cancelled,
    /// The connection dropped and no restart was allowed.
    Disconnected,
    /// The connection could not be opened and no retry was allowed.
    Failed,
}

/// The final signal of a session.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    /// Items delivered across all connections.
    pub items: usize,
    /// Why the session ended.
    pub end: StreamEnd,
    /// The classified last connection attempt. `retries` counts restarts.
    pub response: Response,
}

/// One event of a streaming session.
#[derive(Debug, Clone)]
pub enum StreamEvent<T> {
    /// A decoded item.
    Item(T),
    /// The session is over; no further events follow.
    Finished(StreamSummary),
}

/// Cancels a running session.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    cancel: Cancellation,
}

impl StreamHandle {
    /// Asks the session to stop. Takes effect at the next fragment or timer tick.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The consumer side of a session, as a [`Stream`] of [`StreamEvent`]s.
///
/// Dropping the feed cancels the session.
pub struct Feed<T> {
    receiver: ReceiverStream<StreamEvent<T>>,
    handle: StreamHandle,
}

impl<T> Feed<T> {
    pub(crate) fn new(receiver: mpsc::Receiver<StreamEvent<T>>, cancel: Cancellation) -> Self {
        Self {
            receiver: ReceiverStream::new(receiver),
            handle: StreamHandle { cancel },
        }
    }

    /// A handle that can cancel the session from elsewhere.
    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    /// Cancels the session.
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Stream for Feed<T> {
    type Item = StreamEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// How reading one connection ended.
enum ReadEnd {
    /// The session is over.
    Stop(StreamEnd),
    /// The connection dropped; the fault describes how.
    Dropped(Fault),
}

/// Everything a reader task needs.
pub(crate) struct Session {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) request: TransportRequest,
    pub(crate) policy: Option<RetryPolicy>,
    pub(crate) limits: StreamLimits,
    pub(crate) normalizer: Normalizer,
    pub(crate) cancel: Cancellation,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    /// Runs the session to completion, sending events into `tx`.
    pub(crate) async fn run<T>(self, tx: mpsc::Sender<StreamEvent<T>>)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let deadline = self.limits.duration.map(|d| Instant::now() + d);
        let mut items = 0usize;
        let mut attempts = 0usize;

        let (end, outcome) = loop {
            attempts += 1;
            if self.cancel.is_cancelled() {
                break (StreamEnd::Cancelled, AttemptOutcome::empty());
            }
            if self.limits.reached(items) {
                break (StreamEnd::ItemLimit, AttemptOutcome::empty());
            }

            tracing::debug!(url = %self.request.url, attempt = attempts, "Opening stream");
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => {
                    break (StreamEnd::Cancelled, AttemptOutcome::empty())
                }
                _ = until(deadline) => break (StreamEnd::Duration, AttemptOutcome::empty()),
                opened = self.transport.open_stream(&self.request) => opened,
            };

            let (mut outcome, connected) = match opened {
                Err(outcome) => (outcome, false),
                Ok(StreamingAttempt { mut outcome, mut body }) => {
                    match self.read(&mut body, deadline, &mut items, &tx).await {
                        ReadEnd::Stop(end) => break (end, outcome),
                        ReadEnd::Dropped(fault) => {
                            outcome.fault = Some(fault);
                            outcome.responded_at = Some(SystemTime::now());
                            (outcome, true)
                        }
                    }
                }
            };
            self.normalizer.inspect(&mut outcome);

            let restart = self
                .policy
                .as_ref()
                .filter(|p| p.should_retry(&outcome, attempts));
            let Some(policy) = restart else {
                let end = if connected {
                    StreamEnd::Disconnected
                } else {
                    StreamEnd::Failed
                };
                break (end, outcome);
            };

            let delay = policy.delay_after(&outcome, attempts);
            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis(),
                fault = ?outcome.fault.as_ref().map(|f| f.kind),
                status = ?outcome.status,
                "Stream dropped, restarting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break (StreamEnd::Cancelled, outcome),
                _ = until(deadline) => break (StreamEnd::Duration, outcome),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        tracing::info!(items = items, end = ?end, restarts = attempts - 1, "Stream finished");
        let summary = StreamSummary {
            items,
            end,
            response: Response::streamed(outcome, attempts - 1, self.normalizer.clone()),
        };
        let _ = tx.send(StreamEvent::Finished(summary)).await;
    }

    /// Reads one connection until it drops or the session should stop.
    async fn read<T>(
        &self,
        body: &mut FragmentStream,
        deadline: Option<Instant>,
        items: &mut usize,
        tx: &mpsc::Sender<StreamEvent<T>>,
    ) -> ReadEnd
    where
        T: DeserializeOwned + Send + 'static,
    {
        let max_line = self.limits.max_line();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return ReadEnd::Stop(StreamEnd::Cancelled),
                _ = until(deadline) => return ReadEnd::Stop(StreamEnd::Duration),
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(fault)) => return ReadEnd::Dropped(fault),
                None => {
                    // A trailing line without a newline is still a complete document.
                    if let Some(end) = self.deliver(&buffer, items, tx).await {
                        return ReadEnd::Stop(end);
                    }
                    return ReadEnd::Dropped(Fault::new(
                        FaultKind::ConnectionClosed,
                        "Stream closed by remote end",
                    ));
                }
            };

            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                if newline > max_line {
                    return overlong_line(newline, max_line);
                }
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                if let Some(end) = self.deliver(&line, items, tx).await {
                    return ReadEnd::Stop(end);
                }
            }
            if buffer.len() > max_line {
                return overlong_line(buffer.len(), max_line);
            }
        }
    }

    /// Decodes and forwards one line. Returns an end reason if the session should stop.
    async fn deliver<T>(
        &self,
        line: &[u8],
        items: &mut usize,
        tx: &mpsc::Sender<StreamEvent<T>>,
    ) -> Option<StreamEnd>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if self.limits.reached(*items) {
            return Some(StreamEnd::ItemLimit);
        }
        let line = String::from_utf8_lossy(line);
        let item = self.normalizer.stream_item::<T>(&line)?;
        if tx.send(StreamEvent::Item(item)).await.is_err() {
            return Some(StreamEnd::Cancelled);
        }
        *items += 1;
        self.limits.reached(*items).then_some(StreamEnd::ItemLimit)
    }
}

/// Gives up on a connection whose current line outgrew the buffer.
fn overlong_line(length: usize, max_line: usize) -> ReadEnd {
    tracing::warn!(
        length = length,
        max_line = max_line,
        "Stream line too long, dropping it and the connection"
    );
    ReadEnd::Dropped(Fault::new(
        FaultKind::ReceiveFailure,
        format!("Stream line exceeded {} bytes", max_line),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use crate::query::Format;
    use crate::retry::RetryOn;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Serves the same chunks on every connection.
    struct ScriptedStream {
        chunks: Vec<&'static str>,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedStream {
        async fn send(&self, _request: &TransportRequest) -> AttemptOutcome {
            AttemptOutcome::empty()
        }

        async fn open_stream(
            &self,
            _request: &TransportRequest,
        ) -> std::result::Result<StreamingAttempt, AttemptOutcome> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<std::result::Result<Bytes, Fault>> = self
                .chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect();
            let mut outcome = AttemptOutcome::with_response(StatusCode::OK, None, "");
            outcome.response_uri =
                Some(Url::parse("http://stream.example.com/1/s.json").unwrap());
            Ok(StreamingAttempt {
                outcome,
                body: futures::stream::iter(chunks).boxed(),
            })
        }
    }

    fn session(
        transport: Arc<ScriptedStream>,
        policy: Option<RetryPolicy>,
        limits: StreamLimits,
    ) -> Session {
        Session {
            transport,
            request: TransportRequest {
                method: Method::GET,
                url: Url::parse("http://stream.example.com/1/s.json").unwrap(),
                headers: HeaderMap::new(),
                body: None,
                timeout: None,
                proxy: None,
                cache: None,
                format: Format::Json,
            },
            policy,
            limits,
            normalizer: Normalizer::json(),
            cancel: Cancellation::new(),
        }
    }

    async fn collect(session: Session) -> (Vec<Status>, StreamSummary) {
        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(session.run::<Status>(tx));
        let mut items = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Item(status) => items.push(status),
                StreamEvent::Finished(summary) => return (items, summary),
            }
        }
        panic!("session ended without a summary");
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec![
                "{\"delete\":{\"status\":{\"id\":1}}}\r\n{\"id\":2,\"te",
                "xt\":\"a\"}\r\n\r\n{\"id\":3,\"text\":\"b\"}",
            ],
            opens: AtomicUsize::new(0),
        });

        let (items, summary) = collect(session(transport, None, StreamLimits::unbounded())).await;
        assert_eq!(items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(summary.end, StreamEnd::Disconnected);
        assert_eq!(summary.items, 2);
        assert!(!summary.response.is_from_cache);
    }

    #[tokio::test]
    async fn test_item_limit_spans_restarts() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec!["{\"id\":1}\n{\"id\":2}\n"],
            opens: AtomicUsize::new(0),
        });
        let policy = RetryPolicy::new(RetryOn::CONNECTION_CLOSED, 5);

        let (items, summary) = collect(session(
            transport.clone(),
            Some(policy),
            StreamLimits::unbounded().items(5),
        ))
        .await;
        assert_eq!(items.len(), 5);
        assert_eq!(summary.end, StreamEnd::ItemLimit);
        assert_eq!(summary.response.retries, 2);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_restart_budget_is_exhausted() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec!["{\"id\":1}\n"],
            opens: AtomicUsize::new(0),
        });
        let policy = RetryPolicy::new(RetryOn::CONNECTION_CLOSED, 2);

        let (items, summary) =
            collect(session(transport.clone(), Some(policy), StreamLimits::unbounded())).await;
        assert_eq!(items.len(), 2);
        assert_eq!(summary.end, StreamEnd::Disconnected);
        assert_eq!(summary.response.retries, 1);
        assert_eq!(
            summary.response.fault.as_ref().map(|f| f.kind),
            Some(FaultKind::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec!["{\"id\":1}\n"],
            opens: AtomicUsize::new(0),
        });
        let session = session(transport.clone(), None, StreamLimits::unbounded());
        session.cancel.cancel();

        let (items, summary) = collect(session).await;
        assert!(items.is_empty());
        assert_eq!(summary.end, StreamEnd::Cancelled);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_item_limit_never_connects() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec!["{\"id\":1}\n"],
            opens: AtomicUsize::new(0),
        });
        let policy = RetryPolicy::new(RetryOn::CONNECTION_CLOSED, 3);

        let (items, summary) = collect(session(
            transport.clone(),
            Some(policy),
            StreamLimits::unbounded().items(0),
        ))
        .await;
        assert!(items.is_empty());
        assert_eq!(summary.items, 0);
        assert_eq!(summary.end, StreamEnd::ItemLimit);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overlong_line_drops_the_connection() {
        let transport = Arc::new(ScriptedStream {
            chunks: vec![
                "{\"id\":1}\n{\"id\":2,\"text\":\"",
                "this line never ends and keeps on growing",
            ],
            opens: AtomicUsize::new(0),
        });
        let policy = RetryPolicy::new(RetryOn::NETWORK, 2);

        let (items, summary) = collect(session(
            transport.clone(),
            Some(policy),
            StreamLimits::unbounded().line_limit(32),
        ))
        .await;
        assert_eq!(items.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(summary.end, StreamEnd::Disconnected);
        assert_eq!(summary.response.retries, 1);
        assert!(summary.response.is_network_error);
        assert_eq!(
            summary.response.fault.as_ref().map(|f| f.kind),
            Some(FaultKind::ReceiveFailure)
        );
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
    }
}
