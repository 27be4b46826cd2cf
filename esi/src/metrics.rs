//! Metrics declaration and initialization.
//!
//! Metric names are registered on first use via `describe_*`. The
//! `metrics` facade is a no-op until the application installs a recorder,
//! so the library records unconditionally.

use lazy_static::lazy_static;

lazy_static! {
    /// Total requests by endpoint and outcome status.
    pub static ref ESI_REQUESTS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_requests_total",
            "Total ESI requests by endpoint and status."
        );
        "esi_requests_total"
    };
    /// End-to-end request latency by endpoint.
    pub static ref ESI_REQUEST_DURATION: &'static str = {
        metrics::describe_histogram!(
            "esi_request_duration_seconds",
            metrics::Unit::Seconds,
            "ESI request duration in seconds by endpoint."
        );
        "esi_request_duration_seconds"
    };
    /// Upstream errors by class.
    pub static ref ESI_ERRORS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_errors_total",
            "Total ESI errors by class."
        );
        "esi_errors_total"
    };

    // Retry metrics

    /// Retry attempts by error class.
    pub static ref ESI_RETRIES_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_retries_total",
            "Total number of retry attempts by error class."
        );
        "esi_retries_total"
    };
    /// Backoff wait durations by error class.
    pub static ref ESI_RETRY_BACKOFF_SECONDS: &'static str = {
        metrics::describe_histogram!(
            "esi_retry_backoff_seconds",
            metrics::Unit::Seconds,
            "Backoff duration for retries by error class."
        );
        "esi_retry_backoff_seconds"
    };
    /// Calls that used up every retry attempt, by error class.
    pub static ref ESI_RETRY_EXHAUSTED_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_retry_exhausted_total",
            "Total number of times retry attempts were exhausted by error class."
        );
        "esi_retry_exhausted_total"
    };

    // Rate-limit metrics

    /// Error budget remaining in the current window.
    pub static ref ESI_ERRORS_REMAINING: &'static str = {
        metrics::describe_gauge!(
            "esi_errors_remaining",
            "Number of errors remaining in the current ESI rate limit window."
        );
        "esi_errors_remaining"
    };
    /// Requests blocked by the critical threshold.
    pub static ref ESI_RATE_LIMIT_BLOCKS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_rate_limit_blocks_total",
            "Total number of requests blocked due to critical error limit."
        );
        "esi_rate_limit_blocks_total"
    };
    /// Requests throttled by the warning threshold.
    pub static ref ESI_RATE_LIMIT_THROTTLES_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_rate_limit_throttles_total",
            "Total number of requests throttled due to warning error limit."
        );
        "esi_rate_limit_throttles_total"
    };

    // Cache metrics

    /// Cache hits by layer.
    pub static ref ESI_CACHE_HITS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_cache_hits_total",
            "Total number of ESI cache hits."
        );
        "esi_cache_hits_total"
    };
    /// Cache misses.
    pub static ref ESI_CACHE_MISSES_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_cache_misses_total",
            "Total number of ESI cache misses."
        );
        "esi_cache_misses_total"
    };
    /// Bytes moved through the cache by layer.
    pub static ref ESI_CACHE_SIZE_BYTES: &'static str = {
        metrics::describe_gauge!(
            "esi_cache_size_bytes",
            "Current size of the ESI cache in bytes."
        );
        "esi_cache_size_bytes"
    };
    /// Cache operation failures by operation.
    pub static ref ESI_CACHE_ERRORS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_cache_errors_total",
            "Total number of cache operation errors."
        );
        "esi_cache_errors_total"
    };
    /// 304 Not Modified responses served from cache.
    pub static ref ESI_NOT_MODIFIED_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_304_responses_total",
            "Total number of ESI 304 Not Modified responses."
        );
        "esi_304_responses_total"
    };
    /// Conditional requests sent with validators attached.
    pub static ref ESI_CONDITIONAL_REQUESTS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "esi_conditional_requests_total",
            "Total number of conditional requests sent with If-None-Match or If-Modified-Since."
        );
        "esi_conditional_requests_total"
    };
}
