//! Upstream error classification.

use std::fmt;

use http::StatusCode;

/// Classification of an upstream failure, driving retry behavior and
/// error-budget observability.
///
/// 304 is not an error and is never classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 4xx responses. Never retried: they count against the error budget
    /// and will not succeed on a second attempt.
    Client,

    /// 5xx responses. Retried with a short backoff.
    Server,

    /// 520, the upstream's rate-limit status. Retried with a long backoff.
    RateLimit,

    /// Transport-level failure (connect, TLS, read). Retried with a
    /// medium backoff.
    Network,
}

impl ErrorClass {
    /// Classifies a response status or transport failure.
    ///
    /// Returns `None` for statuses that are not errors (2xx, 3xx).
    pub fn classify(status: Option<StatusCode>, transport_error: bool) -> Option<ErrorClass> {
        if transport_error {
            return Some(ErrorClass::Network);
        }
        let status = status?;
        if status.as_u16() == 520 {
            Some(ErrorClass::RateLimit)
        } else if status.is_client_error() {
            Some(ErrorClass::Client)
        } else if status.as_u16() >= 500 {
            Some(ErrorClass::Server)
        } else {
            None
        }
    }

    /// Whether errors of this class are worth another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Client)
    }

    /// The label used in logs and metric series.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Client => "client",
            ErrorClass::Server => "server",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Network => "network",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
