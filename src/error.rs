//! Error types for misuse of the client.
//!
//! Upstream and network failures are never reported through [`Error`]. They are captured
//! on the [`Response`](crate::Response) as classifier flags so callers can inspect the raw
//! body, status and fault of the last attempt. `Error` is reserved for problems the caller
//! can fix in code: a query without an action, an unsupported method, bad configuration.

use http::Method;

/// The error type for contract violations and configuration problems.
///
/// # Examples
///
/// ```no_run
/// use chirpwire::{Client, Error, Query};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/1/")?
///     .build()?;
///
/// match client.execute(&Query::new()).await {
///     Err(Error::MissingAction) => eprintln!("forgot to set the action"),
///     Err(e) => eprintln!("other misuse: {}", e),
///     Ok(response) => println!("status: {:?}", response.status),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The query was executed without an action (endpoint path).
    #[error("Query has no action set")]
    MissingAction,

    /// The query uses an HTTP method the upstream API does not accept.
    #[error("Unsupported HTTP method: {0}")]
    InvalidMethod(Method),

    /// Invalid configuration was provided.
    ///
    /// This indicates a problem with how the client or query was configured,
    /// such as an invalid header value or an unusable proxy.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Failed to serialize a model or request payload.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A specialized `Result` type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
