#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Response caching keyed by request fingerprint.
///
/// The [`CacheManager`](cache::CacheManager) persists response bodies with
/// a native TTL derived from the upstream `Expires` header and drives
/// conditional revalidation on cache hits carrying validators.
pub mod cache;

/// The client and its request pipeline.
///
/// [`Client`](client::Client) composes, in fixed order: rate-limit gate,
/// cache lookup, conditional headers, retry-wrapped upstream call, error
/// classification, budget accounting, and cache write-back.
pub mod client;

/// Error types for client operations.
pub mod error;

/// Metrics declaration and initialization.
pub mod metrics;

/// Error-limit tracking and request gating.
///
/// The [`RateLimitTracker`](ratelimit::RateLimitTracker) shares one
/// error-budget state across all replicas through the store and decides,
/// per call, whether to admit, throttle, or block.
pub mod ratelimit;

/// Retry with per-class exponential backoff and jitter.
pub mod retry;

pub use client::{Client, Config, DEFAULT_BASE_URL};
pub use error::Error;

pub use esi_core::{
    CacheEntry, CacheKey, ErrorClass, RateLimitState, Store, StoreError, StoreResult,
    THRESHOLD_CRITICAL, THRESHOLD_HEALTHY, THRESHOLD_WARNING,
};

// Re-export the cancellation type of the public API surface.
pub use tokio_util::sync::CancellationToken;
