//! Client-side rate limiting.
//!
//! The upstream enforces an hourly budget per account. A [`RateLimitingRule`] lets a query
//! skip itself before dispatch when the budget is nearly spent. This is advisory only and
//! has no effect on the server's own enforcement.

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The account's current rate limit budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    /// Calls left in the current window.
    pub remaining_hits: i64,
    /// Calls allowed per window.
    pub hourly_limit: i64,
    /// When the window resets, as a Unix timestamp.
    pub reset_time_in_seconds: Option<i64>,
    /// When the window resets, in the upstream's display format.
    pub reset_time: Option<String>,
}

impl RateLimitStatus {
    /// Extracts the budget from `X-RateLimit-*` response headers.
    ///
    /// # Examples
    ///
    /// ```
    /// use chirpwire::rate_limit::RateLimitStatus;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("x-ratelimit-limit", "150".parse().unwrap());
    /// headers.insert("x-ratelimit-remaining", "12".parse().unwrap());
    ///
    /// let status = RateLimitStatus::from_headers(&headers).unwrap();
    /// assert_eq!(status.remaining_hits, 12);
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let hourly_limit = header_number(headers, "x-ratelimit-limit")?;
        let remaining_hits = header_number(headers, "x-ratelimit-remaining")?;
        Some(Self {
            remaining_hits,
            hourly_limit,
            reset_time_in_seconds: header_number(headers, "x-ratelimit-reset"),
            reset_time: None,
        })
    }

    /// `remaining_hits / hourly_limit`, or `None` when the limit is not positive.
    pub fn remaining_fraction(&self) -> Option<f64> {
        if self.hourly_limit <= 0 {
            return None;
        }
        Some(self.remaining_hits as f64 / self.hourly_limit as f64)
    }

    /// When the window resets.
    pub fn reset_at(&self) -> Option<SystemTime> {
        let secs = u64::try_from(self.reset_time_in_seconds?).ok()?;
        Some(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Parses the `Retry-After` header.
///
/// Supports both delay-seconds (integer) and HTTP-date formats.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // RFC 7231 HTTP date
    if let Ok(date_time) = httpdate::parse_http_date(header) {
        if let Ok(duration) = date_time.duration_since(SystemTime::now()) {
            return Some(duration);
        }
    }

    None
}

/// Supplies the current rate limit status.
///
/// Implemented for plain closures so a caller can hand in a cached value.
#[async_trait]
pub trait RateLimitStatusSource: Send + Sync {
    /// Fetches the status. `None` means it could not be determined.
    async fn fetch(&self) -> Option<RateLimitStatus>;
}

#[async_trait]
impl<F> RateLimitStatusSource for F
where
    F: Fn() -> Option<RateLimitStatus> + Send + Sync,
{
    async fn fetch(&self) -> Option<RateLimitStatus> {
        self()
    }
}

/// How a rule decides to skip.
#[derive(Clone)]
pub enum RateLimitMode {
    /// Skip when `remaining / limit` is at or below this fraction (0.0 to 1.0).
    Percentage(f64),
    /// Skip when the caller's predicate returns `true`.
    Predicate(Arc<dyn Fn(&RateLimitStatus) -> bool + Send + Sync>),
}

impl fmt::Debug for RateLimitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitMode::Percentage(fraction) => {
                f.debug_tuple("Percentage").field(fraction).finish()
            }
            RateLimitMode::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A pre-flight gate for a query.
///
/// # Examples
///
/// ```
/// use chirpwire::rate_limit::{RateLimitingRule, RateLimitStatus};
///
/// // Stop once 90% of the hourly budget is gone.
/// let rule = RateLimitingRule::percentage(10.0);
///
/// // Same idea with a custom status getter that never hits the network.
/// let rule = RateLimitingRule::percentage(10.0).with_status_getter(|| {
///     Some(RateLimitStatus {
///         remaining_hits: 140,
///         hourly_limit: 150,
///         reset_time_in_seconds: None,
///         reset_time: None,
///     })
/// });
/// ```
#[derive(Clone)]
pub struct RateLimitingRule {
    mode: RateLimitMode,
    status_getter: Option<Arc<dyn RateLimitStatusSource>>,
}

impl RateLimitingRule {
    /// Skips when the remaining share of the budget is at or below `percent` (0 to 100).
    pub fn percentage(percent: f64) -> Self {
        let fraction = if percent.is_finite() {
            (percent / 100.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            mode: RateLimitMode::Percentage(fraction),
            status_getter: None,
        }
    }

    /// Skips when `predicate` returns `true` for the fetched status.
    pub fn predicate(predicate: impl Fn(&RateLimitStatus) -> bool + Send + Sync + 'static) -> Self {
        Self {
            mode: RateLimitMode::Predicate(Arc::new(predicate)),
            status_getter: None,
        }
    }

    /// Obtains the status from `getter` instead of the client's default source.
    ///
    /// The getter is used in both modes.
    pub fn with_status_getter(mut self, getter: impl RateLimitStatusSource + 'static) -> Self {
        self.status_getter = Some(Arc::new(getter));
        self
    }

    /// The decision mode.
    pub fn mode(&self) -> &RateLimitMode {
        &self.mode
    }

    /// The caller's status getter, if any.
    pub fn status_getter(&self) -> Option<&Arc<dyn RateLimitStatusSource>> {
        self.status_getter.as_ref()
    }

    /// Decides whether to skip given an already-fetched status.
    ///
    /// An unknown status never causes a skip.
    pub fn should_skip(&self, status: Option<&RateLimitStatus>) -> bool {
        let Some(status) = status else {
            return false;
        };
        match &self.mode {
            RateLimitMode::Percentage(threshold) => status
                .remaining_fraction()
                .is_some_and(|fraction| fraction <= *threshold),
            RateLimitMode::Predicate(predicate) => predicate(status),
        }
    }
}

impl fmt::Debug for RateLimitingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingRule")
            .field("mode", &self.mode)
            .field("status_getter", &self.status_getter.is_some())
            .finish()
    }
}
