//! Error types for client operations.

use esi_core::{ErrorClass, StoreError};
use http::StatusCode;
use thiserror::Error;

/// Error type returned by the client.
///
/// The variant is the policy-relevant kind; underlying causes are carried
/// as wrapped sources. [`class`](Error::class) exposes the retry
/// classification of errors that have one.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The rate-limit gate refused admission; the upstream was never
    /// contacted.
    #[error("request blocked: rate limit critical")]
    RateLimitCritical,

    /// All retry attempts were used up. Wraps the last observed error.
    #[error("retry attempts exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The error observed on the final attempt.
        source: Box<Error>,
    },

    /// The caller's cancellation signal fired during a cooperative wait
    /// (throttle pause or retry backoff).
    #[error("cancelled while waiting")]
    Cancelled,

    /// A retryable upstream error status (5xx or 520). Client errors
    /// (4xx) are not represented here: their responses flow back to the
    /// caller verbatim.
    #[error("upstream {class} error (status {status})")]
    UpstreamStatus {
        /// The response status.
        status: StatusCode,
        /// Classification of the failure.
        class: ErrorClass,
    },

    /// Transport-level failure talking to the upstream.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The shared store failed during a gate read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// `X-ESI-Error-Limit-Remain` was present but
    /// `X-ESI-Error-Limit-Reset` was not. The upstream contract is that
    /// the two travel together.
    #[error("X-ESI-Error-Limit-Reset header missing")]
    MissingResetHeader,

    /// A rate-limit header carried an unparseable value.
    #[error("malformed {header} header: {value:?}")]
    MalformedHeader {
        /// Header name.
        header: &'static str,
        /// The value as received.
        value: String,
    },

    /// The request could not be constructed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Constructor validation failed; no client was built.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// The retry classification of this error, if it has one.
    ///
    /// Transport failures are `network`; synthesized upstream status
    /// errors carry their own class. Terminal and local errors are
    /// unclassified.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Error::Transport(_) => Some(ErrorClass::Network),
            Error::UpstreamStatus { class, .. } => Some(*class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let err = Error::UpstreamStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            class: ErrorClass::Server,
        };
        assert_eq!(err.class(), Some(ErrorClass::Server));
        assert_eq!(Error::RateLimitCritical.class(), None);
        assert_eq!(Error::Cancelled.class(), None);
    }

    #[test]
    fn retry_exhausted_carries_the_cause() {
        let err = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(Error::UpstreamStatus {
                status: StatusCode::BAD_GATEWAY,
                class: ErrorClass::Server,
            }),
        };
        let message = err.to_string();
        assert!(message.contains("3 attempts"));
        assert!(message.contains("502"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
