//! Boolean facts about a finished attempt.
//!
//! The outage and service-error flags reuse the retry conditions, so a response reports
//! exactly what a retry policy would have seen.

use crate::retry;
use crate::transport::AttemptOutcome;

/// What a finished attempt looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// The upstream served a degraded page.
    pub is_outage_page: bool,
    /// The upstream reported an error, or the attempt failed.
    pub is_service_error: bool,
    /// The transport failed below the HTTP layer.
    pub is_network_error: bool,
    /// The attempt timed out.
    pub timed_out: bool,
    /// The body was served locally rather than by a round trip.
    pub is_from_cache: bool,
}

/// Classifies an attempt.
///
/// Errors reported inside the body only count once the outcome went through
/// [`Normalizer::inspect`](crate::normalize::Normalizer::inspect).
///
/// # Examples
///
/// ```
/// use chirpwire::classify::classify;
/// use chirpwire::transport::AttemptOutcome;
/// use http::StatusCode;
///
/// let outcome = AttemptOutcome::with_response(
///     StatusCode::SERVICE_UNAVAILABLE,
///     Some("text/html"),
///     "<html>Twitter is over capacity.</html>",
/// );
/// let flags = classify(&outcome);
/// assert!(flags.is_outage_page);
/// assert!(flags.is_service_error);
/// assert!(!flags.is_from_cache);
/// ```
pub fn classify(outcome: &AttemptOutcome) -> Classification {
    let is_service_error = retry::service_error(outcome);
    Classification {
        is_outage_page: retry::outage_page(outcome),
        is_service_error,
        is_network_error: retry::network_error(outcome),
        timed_out: retry::timeout(outcome),
        is_from_cache: !outcome.body.is_empty()
            && outcome.response_uri.is_none()
            && !is_service_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use crate::transport::{Fault, FaultKind};
    use http::StatusCode;
    use url::Url;

    #[test]
    fn test_round_trip_is_not_from_cache() {
        let mut outcome =
            AttemptOutcome::with_response(StatusCode::OK, Some("application/json"), "{\"id\":1}");
        outcome.response_uri = Some(Url::parse("http://api.example.com/1/x.json").unwrap());
        assert_eq!(classify(&outcome), Classification::default());
    }

    #[test]
    fn test_local_body_is_from_cache() {
        let outcome =
            AttemptOutcome::with_response(StatusCode::OK, Some("application/json"), "{\"id\":1}");
        assert!(classify(&outcome).is_from_cache);
    }

    #[test]
    fn test_empty_or_error_body_is_never_from_cache() {
        let empty = AttemptOutcome::with_response(StatusCode::OK, None, "");
        assert!(!classify(&empty).is_from_cache);

        let mut error = AttemptOutcome::with_response(
            StatusCode::OK,
            None,
            r#"{"errors":[{"message":"nope","code":1}]}"#,
        );
        Normalizer::json().inspect(&mut error);
        let flags = classify(&error);
        assert!(flags.is_service_error);
        assert!(!flags.is_from_cache);
    }

    #[test]
    fn test_timeout_flags() {
        let outcome = AttemptOutcome::with_fault(Fault::new(FaultKind::Timeout, "deadline"));
        let flags = classify(&outcome);
        assert!(flags.timed_out);
        assert!(flags.is_network_error);
        assert!(flags.is_service_error);
        assert!(!flags.is_outage_page);
    }
}
