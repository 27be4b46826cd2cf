//! Retry with per-class exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use esi_core::ErrorClass;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::metrics::{
    ESI_RETRIES_TOTAL, ESI_RETRY_BACKOFF_SECONDS, ESI_RETRY_EXHAUSTED_TOTAL,
};

const MAX_BACKOFF_SERVER: Duration = Duration::from_secs(10);
const MAX_BACKOFF_RATE_LIMIT: Duration = Duration::from_secs(60);
const MAX_BACKOFF_NETWORK: Duration = Duration::from_secs(30);
const MAX_BACKOFF_DEFAULT: Duration = Duration::from_secs(30);

/// Retry parameters in effect for one error class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryProfile {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Cap on the backoff growth.
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff after each retry.
    pub multiplier: f64,
}

/// Derives per-class retry profiles from the configured attempt count and
/// base backoff.
///
/// At the defaults (3 attempts, 1 s base) the profiles come out as:
/// server 1 s → 10 s, rate-limit 5 s → 60 s, network 2 s → 30 s,
/// default 1 s → 30 s, all doubling per retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy from the configured attempt count and base
    /// backoff.
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// The profile for one error class.
    pub fn profile(&self, class: Option<ErrorClass>) -> RetryProfile {
        let (scale, max_backoff) = match class {
            // 5xx tends to clear quickly, keep the pressure low but fast.
            Some(ErrorClass::Server) => (1, MAX_BACKOFF_SERVER),
            // 520 means the upstream is shedding load, back far off.
            Some(ErrorClass::RateLimit) => (5, MAX_BACKOFF_RATE_LIMIT),
            Some(ErrorClass::Network) => (2, MAX_BACKOFF_NETWORK),
            _ => (1, MAX_BACKOFF_DEFAULT),
        };
        RetryProfile {
            max_attempts: self.max_attempts,
            initial_backoff: self.base_backoff * scale,
            max_backoff,
            multiplier: 2.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_secs(1))
    }
}

/// Runs `action` until it succeeds, its error class is not retryable, or
/// the active profile's attempts are used up.
///
/// The classifier is consulted after every failure, not once: when the
/// error class changes mid-loop (a 500 followed by a connection drop),
/// each wait uses the profile of the most recent failure, and the attempt
/// cap in effect is the one of the profile chosen when the loop breaks.
///
/// Waits carry ±20 % jitter and honor `cancel`; a cancellation during the
/// wait returns [`Error::Cancelled`]. A cancellation during the action is
/// reported as whatever error the action returns.
pub(crate) async fn retry_with_backoff<T, F, Fut, C>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    classify: C,
    mut action: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    C: Fn(&Error) -> Option<ErrorClass>,
{
    let mut attempt: u32 = 1;
    let mut backoff: Option<Duration> = None;

    loop {
        let error = match action().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "request succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let class = classify(&error);
        let profile = policy.profile(class);

        if !class.is_some_and(ErrorClass::is_retryable) {
            return Err(error);
        }
        let label = class_label(class);

        if attempt >= profile.max_attempts {
            metrics::counter!(*ESI_RETRY_EXHAUSTED_TOTAL, "error_class" => label).increment(1);
            warn!(
                error_class = label,
                max_attempts = profile.max_attempts,
                "retry attempts exhausted"
            );
            return Err(Error::RetryExhausted {
                attempts: profile.max_attempts,
                source: Box::new(error),
            });
        }

        metrics::counter!(*ESI_RETRIES_TOTAL, "error_class" => label).increment(1);

        let current = *backoff.get_or_insert(profile.initial_backoff);
        // ±20% jitter against synchronized retry storms across replicas.
        let wait = current.mul_f64(0.8 + rand::random::<f64>() * 0.4);
        metrics::histogram!(*ESI_RETRY_BACKOFF_SECONDS, "error_class" => label)
            .record(wait.as_secs_f64());

        debug!(
            error_class = label,
            attempt,
            backoff = ?wait,
            "retrying request after backoff"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(error_class = label, attempt, "cancelled during retry backoff");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(wait) => {}
        }

        backoff = Some(current.mul_f64(profile.multiplier).min(profile.max_backoff));
        attempt += 1;
    }
}

fn class_label(class: Option<ErrorClass>) -> &'static str {
    class.map_or("default", ErrorClass::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::cell::RefCell;
    use tokio::time::Instant;

    fn server_error() -> Error {
        Error::UpstreamStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            class: ErrorClass::Server,
        }
    }

    fn client_error() -> Error {
        Error::UpstreamStatus {
            status: StatusCode::NOT_FOUND,
            class: ErrorClass::Client,
        }
    }

    #[test]
    fn default_policy_reproduces_named_profiles() {
        let policy = RetryPolicy::default();

        let server = policy.profile(Some(ErrorClass::Server));
        assert_eq!(server.max_attempts, 3);
        assert_eq!(server.initial_backoff, Duration::from_secs(1));
        assert_eq!(server.max_backoff, Duration::from_secs(10));

        let rate_limit = policy.profile(Some(ErrorClass::RateLimit));
        assert_eq!(rate_limit.initial_backoff, Duration::from_secs(5));
        assert_eq!(rate_limit.max_backoff, Duration::from_secs(60));

        let network = policy.profile(Some(ErrorClass::Network));
        assert_eq!(network.initial_backoff, Duration::from_secs(2));
        assert_eq!(network.max_backoff, Duration::from_secs(30));

        let unclassified = policy.profile(None);
        assert_eq!(unclassified.initial_backoff, Duration::from_secs(1));
        assert_eq!(unclassified.max_backoff, Duration::from_secs(30));
        assert_eq!(unclassified.multiplier, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);

        let result = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            Error::class,
            || async {
                *calls.borrow_mut() += 1;
                Ok::<_, Error>(42)
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_until_success() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);

        let result = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            Error::class,
            || async {
                *calls.borrow_mut() += 1;
                if *calls.borrow() < 3 {
                    Err(server_error())
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);

        let result: Result<(), _> = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            Error::class,
            || async {
                *calls.borrow_mut() += 1;
                Err(client_error())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::UpstreamStatus {
                class: ErrorClass::Client,
                ..
            })
        ));
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_wraps_the_last_error() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);

        let result: Result<(), _> = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            Error::class,
            || async {
                *calls.borrow_mut() += 1;
                Err(server_error())
            },
        )
        .await;

        assert_eq!(*calls.borrow(), 3);
        match result {
            Err(Error::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(
                    *source,
                    Error::UpstreamStatus {
                        class: ErrorClass::Server,
                        ..
                    }
                ));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_stay_within_jitter_bounds() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);
        let started = Instant::now();
        let waits = RefCell::new(Vec::new());

        let _: Result<(), _> = retry_with_backoff(
            &cancel,
            &RetryPolicy::new(3, Duration::from_secs(1)),
            Error::class,
            || async {
                waits.borrow_mut().push(started.elapsed());
                *calls.borrow_mut() += 1;
                Err(server_error())
            },
        )
        .await;

        let waits = waits.borrow();
        // Attempt starts at 0, then after ~1s (0.8..1.2), then ~2s more.
        let first_wait = waits[1] - waits[0];
        let second_wait = waits[2] - waits[1];
        assert!(first_wait >= Duration::from_millis(800), "{first_wait:?}");
        assert!(first_wait <= Duration::from_millis(1250), "{first_wait:?}");
        assert!(second_wait >= Duration::from_millis(1600), "{second_wait:?}");
        assert!(second_wait <= Duration::from_millis(2450), "{second_wait:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_short_circuits() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            Error::class,
            || async {
                *calls.borrow_mut() += 1;
                Err(server_error())
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_is_consulted_per_error() {
        let cancel = CancellationToken::new();
        let calls = RefCell::new(0u32);
        let seen = RefCell::new(Vec::new());

        let classify = |error: &Error| {
            let class = error.class();
            seen.borrow_mut().push(class);
            class
        };

        let _: Result<(), _> = retry_with_backoff(
            &cancel,
            &RetryPolicy::default(),
            classify,
            || async {
                *calls.borrow_mut() += 1;
                if *calls.borrow() == 1 {
                    Err(server_error())
                } else {
                    Err(Error::UpstreamStatus {
                        status: StatusCode::from_u16(520).unwrap(),
                        class: ErrorClass::RateLimit,
                    })
                }
            },
        )
        .await;

        assert_eq!(
            *seen.borrow(),
            vec![
                Some(ErrorClass::Server),
                Some(ErrorClass::RateLimit),
                Some(ErrorClass::RateLimit),
            ],
        );
    }
}
