//! The key-value store contract.
//!
//! All shared state (cached responses under `esi:`, the rate-limit
//! fields under `esi:rate_limit:`) lives behind this trait, so replicas
//! of the client coordinate through whatever store the caller hands in.
//! Production uses the Redis implementation from `esi-redis`; tests use
//! an in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network interaction error: the store could not be reached or the
    /// connection failed mid-operation.
    #[error(transparent)]
    Connection(Box<dyn std::error::Error + Send + Sync>),

    /// Internal store error: the store was reachable but the operation
    /// failed.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

/// Convenience alias for store operation results.
pub type StoreResult<T> = Result<T, StoreError>;

/// A key-value store with native TTL support.
///
/// Single-key operations are atomic per key. [`set_many`](Store::set_many)
/// is the only multi-key operation and must be atomic as a group: no
/// concurrent reader may observe a partially applied batch. No cross-key
/// transactions beyond that are required.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads the value at `key`, or `None` when absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Writes `value` at `key`. With `Some(ttl)` the store expires the
    /// key natively once the TTL elapses; `None` persists indefinitely.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()>;

    /// Removes `key`. Absence is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Writes all pairs in one atomic round-trip, without TTL.
    async fn set_many(&self, pairs: &[(&str, Bytes)]) -> StoreResult<()>;

    /// Health probe.
    async fn ping(&self) -> StoreResult<()>;
}
