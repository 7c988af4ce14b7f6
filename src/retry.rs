//! Retry conditions, policies and delays.
//!
//! A retry condition is a small pure function over an [`AttemptOutcome`]. Policies are an
//! OR over a set of conditions plus a cap on the total number of attempts. The
//! [`RetryStrategy`] only decides how long to wait between attempts.

use crate::transport::{AttemptOutcome, FaultKind};
use http::StatusCode;
use rand::Rng;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

/// True when the upstream served a degraded page instead of structured data.
///
/// Matches a fault whose attached response is 502/503, or a 502/503 answered with an
/// HTML body.
pub fn outage_page(outcome: &AttemptOutcome) -> bool {
    let fault_status = outcome
        .fault
        .as_ref()
        .and_then(|f| f.status)
        .is_some_and(is_outage_status);

    let html_outage = outcome.status.is_some_and(is_outage_status)
        && outcome
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));

    fault_status || html_outage
}

fn is_outage_status(status: StatusCode) -> bool {
    status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE
}

/// True for outage pages, any fault, HTTP status >= 400, or an error reported in the body.
///
/// Body errors are read from [`AttemptOutcome::body_error`], which the client fills in
/// with the query's normalizer before consulting any condition.
pub fn service_error(outcome: &AttemptOutcome) -> bool {
    outage_page(outcome)
        || outcome.fault.is_some()
        || outcome.status.is_some_and(|s| s.as_u16() >= 400)
        || outcome.body_error.is_some()
}

/// True when the transport failed below the HTTP layer (DNS, reset, refused...).
pub fn network_error(outcome: &AttemptOutcome) -> bool {
    outcome
        .fault
        .as_ref()
        .is_some_and(|f| f.kind != FaultKind::ProtocolError)
}

/// True when the attempt timed out, or was cancelled for exceeding its timeout.
pub fn timeout(outcome: &AttemptOutcome) -> bool {
    let Some(fault) = &outcome.fault else {
        return false;
    };
    match fault.kind {
        FaultKind::Timeout => true,
        FaultKind::RequestCanceled => match (outcome.timeout, outcome.elapsed()) {
            (Some(limit), Some(elapsed)) => elapsed >= limit,
            _ => false,
        },
        _ => false,
    }
}

/// True when the remote end closed the connection before completion.
pub fn connection_closed(outcome: &AttemptOutcome) -> bool {
    outcome
        .fault
        .as_ref()
        .is_some_and(|f| f.kind == FaultKind::ConnectionClosed)
}

/// A named, stateless retry condition.
#[derive(Clone, Copy)]
pub struct Condition {
    name: &'static str,
    test: fn(&AttemptOutcome) -> bool,
}

impl Condition {
    /// The condition's name, for logging.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Evaluates the condition.
    pub fn matches(&self, outcome: &AttemptOutcome) -> bool {
        (self.test)(outcome)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// See [`outage_page`].
pub static OUTAGE_PAGE: Condition = Condition {
    name: "outage_page",
    test: outage_page,
};

/// See [`service_error`].
pub static SERVICE_ERROR: Condition = Condition {
    name: "service_error",
    test: service_error,
};

/// See [`network_error`].
pub static NETWORK_ERROR: Condition = Condition {
    name: "network_error",
    test: network_error,
};

/// See [`timeout`].
pub static TIMEOUT: Condition = Condition {
    name: "timeout",
    test: timeout,
};

/// See [`connection_closed`].
pub static CONNECTION_CLOSED: Condition = Condition {
    name: "connection_closed",
    test: connection_closed,
};

/// A combinable selector of built-in retry conditions.
///
/// # Examples
///
/// ```
/// use chirpwire::RetryOn;
///
/// let on = RetryOn::OUTAGE_PAGE | RetryOn::TIMEOUT;
/// assert!(on.contains(RetryOn::TIMEOUT));
/// assert!(!on.contains(RetryOn::NETWORK));
/// assert!(RetryOn::NEVER.is_never());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RetryOn(u8);

impl RetryOn {
    /// Never retry.
    pub const NEVER: RetryOn = RetryOn(0);
    /// Retry when the upstream served an outage page.
    pub const OUTAGE_PAGE: RetryOn = RetryOn(1);
    /// Retry on any service-level error.
    pub const SERVICE_ERROR: RetryOn = RetryOn(1 << 1);
    /// Retry on timeouts.
    pub const TIMEOUT: RetryOn = RetryOn(1 << 2);
    /// Retry on transport failures below HTTP.
    pub const NETWORK: RetryOn = RetryOn(1 << 3);
    /// Retry when the connection was closed early.
    pub const CONNECTION_CLOSED: RetryOn = RetryOn(1 << 4);
    /// Retry on outage pages or network failures.
    pub const OUTAGE_PAGE_OR_NETWORK: RetryOn = RetryOn(1 | 1 << 3);

    /// Returns `true` if every bit of `other` is set.
    pub fn contains(&self, other: RetryOn) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no condition is selected.
    pub fn is_never(&self) -> bool {
        self.0 == 0
    }

    /// The built-in conditions selected by these flags.
    pub fn conditions(&self) -> Vec<&'static Condition> {
        let table: [(RetryOn, &'static Condition); 5] = [
            (RetryOn::OUTAGE_PAGE, &OUTAGE_PAGE),
            (RetryOn::SERVICE_ERROR, &SERVICE_ERROR),
            (RetryOn::TIMEOUT, &TIMEOUT),
            (RetryOn::NETWORK, &NETWORK_ERROR),
            (RetryOn::CONNECTION_CLOSED, &CONNECTION_CLOSED),
        ];
        table
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, condition)| condition)
            .collect()
    }
}

impl BitOr for RetryOn {
    type Output = RetryOn;

    fn bitor(self, rhs: RetryOn) -> RetryOn {
        RetryOn(self.0 | rhs.0)
    }
}

impl BitOrAssign for RetryOn {
    fn bitor_assign(&mut self, rhs: RetryOn) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return f.write_str("RetryOn(NEVER)");
        }
        let names: Vec<_> = self.conditions().iter().map(|c| c.name()).collect();
        write!(f, "RetryOn({})", names.join(" | "))
    }
}

/// A caller-supplied retry condition.
///
/// Implemented for closures, so ad hoc predicates can be OR-ed into a policy.
///
/// # Examples
///
/// ```
/// use chirpwire::{RetryOn, RetryPolicy};
/// use chirpwire::transport::AttemptOutcome;
///
/// let policy = RetryPolicy::new(RetryOn::OUTAGE_PAGE, 3)
///     .or(|outcome: &AttemptOutcome| outcome.status.is_some_and(|s| s.as_u16() == 420));
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if the attempt should be retried.
    fn matches(&self, outcome: &AttemptOutcome) -> bool;
}

impl RetryPredicate for Condition {
    fn matches(&self, outcome: &AttemptOutcome) -> bool {
        Condition::matches(self, outcome)
    }
}

impl<F> RetryPredicate for F
where
    F: Fn(&AttemptOutcome) -> bool + Send + Sync,
{
    fn matches(&self, outcome: &AttemptOutcome) -> bool {
        self(outcome)
    }
}

/// Defines how long to wait between attempts.
///
/// # Examples
///
/// ```
/// use chirpwire::RetryStrategy;
/// use std::time::Duration;
///
/// // Exponential backoff: 100ms, 200ms, 400ms, 800ms...
/// let exponential = RetryStrategy::ExponentialBackoff {
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(30),
///     jitter: true,
/// };
///
/// // Linear backoff: 1s, 1s, 1s...
/// let linear = RetryStrategy::Linear {
///     delay: Duration::from_secs(1),
/// };
/// ```
#[derive(Debug, Clone, Default)]
pub enum RetryStrategy {
    /// Retry immediately.
    #[default]
    Immediate,

    /// Retry with exponentially increasing delays.
    ///
    /// Each retry waits for `initial_delay * 2^(retry - 1)` (capped at `max_delay`).
    ExponentialBackoff {
        /// The delay before the first retry.
        initial_delay: Duration,
        /// The maximum delay between retries.
        max_delay: Duration,
        /// Whether to add random jitter to delays.
        jitter: bool,
    },

    /// Retry with a fixed delay between attempts.
    Linear {
        /// The delay between attempts.
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Returns the delay before the given retry (1-indexed, so 1 = first retry).
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::ExponentialBackoff {
                initial_delay,
                max_delay,
                jitter,
            } => {
                let multiplier = 2u64.saturating_pow(retry.saturating_sub(1) as u32);
                let base_delay =
                    initial_delay.saturating_mul(multiplier.try_into().unwrap_or(u32::MAX));
                let delay = base_delay.min(*max_delay);

                if *jitter {
                    // Random value between 50% and 100% of the delay
                    let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
                    delay.mul_f64(jitter_factor)
                } else {
                    delay
                }
            }
            RetryStrategy::Linear { delay } => *delay,
        }
    }
}

/// An OR over retry conditions plus a cap on total attempts.
///
/// An attempt is retried while `attempts < max_attempts` and at least one condition
/// matches its outcome.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_on: RetryOn,
    predicates: Vec<Arc<dyn RetryPredicate>>,
    max_attempts: usize,
    strategy: RetryStrategy,
    max_wait: Duration,
}

impl RetryPolicy {
    /// Creates a policy from flag-selected conditions.
    ///
    /// `max_attempts` counts the first attempt; `0` is treated as `1`.
    pub fn new(retry_on: RetryOn, max_attempts: usize) -> Self {
        let predicates = retry_on
            .conditions()
            .into_iter()
            .map(|c| Arc::new(*c) as Arc<dyn RetryPredicate>)
            .collect();
        Self {
            retry_on,
            predicates,
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Immediate,
            max_wait: Duration::from_secs(300),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(RetryOn::NEVER, 1)
    }

    /// Adds a caller-supplied condition.
    pub fn or(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicates.push(Arc::new(predicate));
        self
    }

    /// Sets the delay strategy between attempts.
    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Caps how long a server-sent `Retry-After` may delay the next attempt.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// The flags this policy was built from.
    pub fn retry_on(&self) -> RetryOn {
        self.retry_on
    }

    /// The maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns `true` if any condition matches the outcome.
    pub fn matches(&self, outcome: &AttemptOutcome) -> bool {
        self.predicates.iter().any(|p| p.matches(outcome))
    }

    /// Returns `true` if another attempt should follow attempt number `attempts`.
    pub fn should_retry(&self, outcome: &AttemptOutcome, attempts: usize) -> bool {
        attempts < self.max_attempts && self.matches(outcome)
    }

    /// The delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        self.strategy.delay_for_retry(retry)
    }

    /// The delay before retrying `outcome`, honoring its `Retry-After` header.
    pub fn delay_after(&self, outcome: &AttemptOutcome, retry: usize) -> Duration {
        let backoff = self.delay_for_retry(retry);
        match crate::rate_limit::parse_retry_after(&outcome.headers) {
            Some(server) => backoff.max(server.min(self.max_wait)),
            None => backoff,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_on", &self.retry_on)
            .field("predicates", &self.predicates.len())
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}
