//! # Chirpwire - a resilient client core for a Twitter-style REST API
//!
//! Chirpwire executes declarative [`Query`] values against an upstream that is known to
//! misbehave: it serves HTML outage pages with error statuses, reports errors inside 200
//! responses, drifts between collection and error schemas, and enforces an hourly call
//! budget. Every response is classified instead of failing, retried according to a
//! composable policy, and decoded through accessors that return `None` when the body
//! does not fit.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chirpwire::{Client, Query, RetryOn};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chirpwire::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/1/")?
//!         .timeout(Duration::from_secs(30))
//!         .build()?;
//!
//!     let query = Query::get("statuses/user_timeline")
//!         .param("screen_name", "jack")
//!         .param("count", 20)
//!         .retry_on(RetryOn::OUTAGE_PAGE_OR_NETWORK, 3);
//!
//!     let response = client.execute(&query).await?;
//!     println!("Request took {:?} with {} retries", response.latency, response.retries);
//!
//!     match response.as_statuses() {
//!         Some(statuses) => println!("{} statuses", statuses.len()),
//!         None => eprintln!("error: {:?}", response.as_error()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Classified responses** - outage, error, network, timeout and cache flags on every
//!   response
//! - **Composable retries** - OR together built-in conditions and custom predicates, with
//!   optional backoff
//! - **Client-side rate limiting** - skip a query when the hourly budget is nearly spent
//! - **Adaptive decoding** - bare or wrapped collections, current and legacy error
//!   schemas, JSON or XML bodies, reshaped trends
//! - **Streaming** - line-delimited sessions with item and duration limits and automatic restarts
//! - **Response cache** - optional local LRU cache with absolute or sliding expiry
//! - **Structured logging** - every attempt and retry is logged with `tracing`
//!
//! ## Error Handling
//!
//! Upstream failures are data, not errors. [`Error`] is only returned for queries that
//! cannot be sent:
//!
//! ```no_run
//! use chirpwire::{Client, Error, Query};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://api.example.com/1/")?.build()?;
//! let response = client.execute(&Query::get("users/show").param("id", 12)).await?;
//!
//! if response.is_outage_page {
//!     eprintln!("over capacity after {} retries", response.retries);
//! } else if response.is_network_error {
//!     eprintln!("network trouble: {:?}", response.fault);
//! } else if let Some(error) = response.as_error() {
//!     eprintln!("upstream error: {}", error);
//! } else if let Some(user) = response.as_user() {
//!     println!("{:?}", user.screen_name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Retry Policies
//!
//! ```no_run
//! use chirpwire::{Client, Query, RetryOn, RetryPolicy, RetryStrategy};
//! use chirpwire::transport::AttemptOutcome;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), chirpwire::Error> {
//! # let client = Client::builder().base_url("https://api.example.com/1/")?.build()?;
//! let policy = RetryPolicy::new(RetryOn::OUTAGE_PAGE | RetryOn::TIMEOUT, 5)
//!     .or(|outcome: &AttemptOutcome| outcome.body.contains("try again"))
//!     .strategy(RetryStrategy::ExponentialBackoff {
//!         initial_delay: Duration::from_millis(100),
//!         max_delay: Duration::from_secs(30),
//!         jitter: true,
//!     });
//!
//! let response = client.execute(&Query::get("statuses/mentions").retry(policy)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod classify;
mod client;
mod error;
pub mod models;
pub mod normalize;
mod query;
pub mod rate_limit;
mod response;
pub mod retry;
pub mod stream;
pub mod transport;
pub mod trends;

pub use client::{Client, ClientBuilder, ExecutionHandle};
pub use error::{Error, Result};
pub use query::{Authenticator, BearerToken, CachePolicy, Format, Query};
pub use rate_limit::{RateLimitStatus, RateLimitingRule};
pub use response::Response;
pub use retry::{RetryOn, RetryPolicy, RetryPredicate, RetryStrategy};
