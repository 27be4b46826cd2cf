//! Shared ESI error-limit state.
//!
//! The upstream enforces a sliding error budget; exhausting it results in
//! an IP-level ban. Every replica of the client shares one
//! [`RateLimitState`] through the store so that the budget is respected
//! fleet-wide, not per process.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Store key holding the error budget remaining.
pub const KEY_ERRORS_REMAINING: &str = "esi:rate_limit:errors_remaining";

/// Store key holding the unix timestamp of the next budget reset.
pub const KEY_RESET_TIMESTAMP: &str = "esi:rate_limit:reset_timestamp";

/// Store key holding the instant of the last state update.
pub const KEY_LAST_UPDATE: &str = "esi:rate_limit:last_update";

/// Below this budget all requests are blocked outright.
pub const THRESHOLD_CRITICAL: i64 = 5;

/// Below this budget requests are throttled before being sent.
pub const THRESHOLD_WARNING: i64 = 20;

/// At or above this budget the state is considered healthy.
pub const THRESHOLD_HEALTHY: i64 = 50;

const _: () = assert!(
    THRESHOLD_CRITICAL < THRESHOLD_WARNING && THRESHOLD_WARNING < THRESHOLD_HEALTHY,
    "threshold ordering: critical < warning < healthy",
);

/// The current error-limit state, shared across replicas via the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Errors allowed before the upstream blocks the caller, taken from
    /// the `X-ESI-Error-Limit-Remain` header.
    pub errors_remaining: i64,

    /// When the error-limit window resets, derived from the
    /// `X-ESI-Error-Limit-Reset` header (seconds until reset).
    pub reset_at: DateTime<Utc>,

    /// When this state was last written.
    pub last_update: DateTime<Utc>,

    /// Derived: `errors_remaining >= THRESHOLD_HEALTHY`.
    pub is_healthy: bool,
}

impl RateLimitState {
    /// Builds a state, deriving the health flag.
    pub fn new(
        errors_remaining: i64,
        reset_at: DateTime<Utc>,
        last_update: DateTime<Utc>,
    ) -> Self {
        RateLimitState {
            errors_remaining,
            reset_at,
            last_update,
            is_healthy: errors_remaining >= THRESHOLD_HEALTHY,
        }
    }

    /// The state assumed when the store holds no data yet.
    ///
    /// A fresh replica must not be more conservative than an established
    /// one, so an empty store reads as a full budget. The default is never
    /// written back; real state is seeded by the first upstream response
    /// carrying budget headers.
    pub fn healthy_default() -> Self {
        let now = Utc::now();
        RateLimitState::new(100, now + TimeDelta::seconds(60), now)
    }

    /// True when requests must be blocked outright.
    pub fn needs_critical_block(&self) -> bool {
        self.errors_remaining < THRESHOLD_CRITICAL
    }

    /// True when requests should be throttled before sending.
    pub fn needs_throttling(&self) -> bool {
        self.errors_remaining < THRESHOLD_WARNING && !self.needs_critical_block()
    }

    /// Duration until the error window resets, floored at zero.
    pub fn time_until_reset(&self) -> Duration {
        let remaining = self.reset_at.signed_duration_since(Utc::now());
        match remaining.num_milliseconds() {
            ms if ms > 0 => Duration::from_millis(ms as u64),
            _ => Duration::ZERO,
        }
    }

    /// True when the state was last written longer than `max_age` ago.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        Utc::now().signed_duration_since(self.last_update)
            > TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(errors_remaining: i64) -> RateLimitState {
        RateLimitState::new(errors_remaining, Utc::now() + TimeDelta::seconds(60), Utc::now())
    }

    #[test]
    fn health_is_derived_from_remaining() {
        assert!(state(100).is_healthy);
        assert!(state(THRESHOLD_HEALTHY).is_healthy);
        assert!(!state(THRESHOLD_HEALTHY - 1).is_healthy);
    }

    #[test]
    fn critical_block_is_strictly_below_threshold() {
        assert!(state(THRESHOLD_CRITICAL - 1).needs_critical_block());
        assert!(!state(THRESHOLD_CRITICAL).needs_critical_block());
    }

    #[test]
    fn throttling_band_excludes_critical() {
        assert!(state(THRESHOLD_WARNING - 1).needs_throttling());
        assert!(state(THRESHOLD_CRITICAL).needs_throttling());
        assert!(!state(THRESHOLD_WARNING).needs_throttling());
        assert!(!state(THRESHOLD_CRITICAL - 1).needs_throttling());
    }

    #[test]
    fn time_until_reset_floors_at_zero() {
        let past = RateLimitState::new(50, Utc::now() - TimeDelta::seconds(10), Utc::now());
        assert_eq!(past.time_until_reset(), Duration::ZERO);

        let future = state(50);
        assert!(future.time_until_reset() > Duration::from_secs(55));
    }

    #[test]
    fn healthy_default_allows_traffic() {
        let s = RateLimitState::healthy_default();
        assert!(s.is_healthy);
        assert!(!s.needs_critical_block());
        assert!(!s.needs_throttling());
    }

    #[test]
    fn staleness() {
        let s = state(50);
        assert!(!s.is_stale(Duration::from_secs(60)));

        let old = RateLimitState::new(50, Utc::now(), Utc::now() - TimeDelta::minutes(10));
        assert!(old.is_stale(Duration::from_secs(60)));
    }
}
