//! Error types for the Redis store.

use esi_core::StoreError;
use redis::RedisError;

/// Error type for Redis store operations.
///
/// In most cases this error is converted to [`StoreError`] and propagated
/// through the client; connection-level failures and server-side failures
/// map to the corresponding `StoreError` variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the underlying Redis client: connection failures,
    /// protocol errors, authentication failures, command failures.
    #[error("redis store error: {0}")]
    Redis(#[from] RedisError),

    /// No connection URL was specified when building the store.
    #[error("connection url not specified, call .url() before .build()")]
    MissingUrl,
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match &error {
            Error::Redis(e)
                if e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped() =>
            {
                StoreError::Connection(Box::new(error))
            }
            _ => StoreError::Internal(Box::new(error)),
        }
    }
}
