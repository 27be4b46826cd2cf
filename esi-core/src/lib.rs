#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Error classification for upstream failures.
pub mod class;

/// Cache entry value object and freshness predicates.
pub mod entry;

/// Deterministic cache key construction and serialization.
pub mod key;

/// Shared rate-limit state, thresholds, and store keys.
pub mod state;

/// The key-value store contract backing cache and rate-limit state.
pub mod store;

pub use class::ErrorClass;
pub use entry::CacheEntry;
pub use key::CacheKey;
pub use state::{
    KEY_ERRORS_REMAINING, KEY_LAST_UPDATE, KEY_RESET_TIMESTAMP, RateLimitState,
    THRESHOLD_CRITICAL, THRESHOLD_HEALTHY, THRESHOLD_WARNING,
};
pub use store::{Store, StoreError, StoreResult};
