//! Response caching with upstream-driven freshness.
//!
//! ESI responses carry an `Expires` header that consumers are required to
//! honor. [`CacheManager`] persists each 200 response under its
//! [`CacheKey`] with a native store TTL matching that expiration, serves
//! validators for conditional revalidation, and refreshes the TTL when a
//! 304 arrives with a new `Expires`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use esi_core::{CacheEntry, CacheKey, Store, StoreError};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use thiserror::Error;

use crate::metrics::{
    ESI_CACHE_ERRORS_TOTAL, ESI_CACHE_HITS_TOTAL, ESI_CACHE_MISSES_TOTAL, ESI_CACHE_SIZE_BYTES,
};

/// Fallback freshness window when the upstream supplies no usable
/// `Expires` header, tuned to ESI's typical cache hints.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Error type for cache operations.
///
/// Cache errors never abort a request: the pipeline logs them and
/// proceeds as on a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The stored bytes did not decode to an entry. Treated as a miss by
    /// callers.
    #[error("invalid cache entry: {0}")]
    InvalidEntry(#[source] serde_json::Error),

    /// The underlying store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistent response cache over the shared store.
pub struct CacheManager {
    store: Arc<dyn Store>,
}

impl CacheManager {
    /// Creates a cache manager over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        CacheManager { store }
    }

    /// Looks up the entry for `key`.
    ///
    /// Returns `Ok(None)` on a miss. An entry found stale is deleted and
    /// reported as a miss; bytes that fail to decode surface as
    /// [`CacheError::InvalidEntry`].
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let data = match self.store.get(&key.to_string()).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                metrics::counter!(*ESI_CACHE_MISSES_TOTAL).increment(1);
                return Ok(None);
            }
            Err(e) => {
                metrics::counter!(*ESI_CACHE_ERRORS_TOTAL, "operation" => "get").increment(1);
                return Err(e.into());
            }
        };

        let entry: CacheEntry = serde_json::from_slice(&data).map_err(|e| {
            metrics::counter!(*ESI_CACHE_ERRORS_TOTAL, "operation" => "get").increment(1);
            CacheError::InvalidEntry(e)
        })?;

        if entry.is_expired() {
            // The store's native TTL normally removes these; a stale read
            // can still happen between expiry and eviction.
            let _ = self.delete(key).await;
            metrics::counter!(*ESI_CACHE_MISSES_TOTAL).increment(1);
            return Ok(None);
        }

        metrics::counter!(*ESI_CACHE_HITS_TOTAL, "layer" => "store").increment(1);
        metrics::gauge!(*ESI_CACHE_SIZE_BYTES, "layer" => "store").increment(data.len() as f64);

        Ok(Some(entry))
    }

    /// Stores `entry` under `key` with a native TTL matching the entry's
    /// remaining freshness.
    ///
    /// An entry whose freshness window has already passed is not written;
    /// the call still succeeds.
    pub async fn set(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        let ttl = entry.ttl();
        if ttl.is_zero() {
            return Ok(());
        }

        let data = serde_json::to_vec(entry).map_err(|e| {
            metrics::counter!(*ESI_CACHE_ERRORS_TOTAL, "operation" => "set").increment(1);
            CacheError::InvalidEntry(e)
        })?;
        let size = data.len();

        self.store
            .set(&key.to_string(), Bytes::from(data), Some(ttl))
            .await
            .map_err(|e| {
                metrics::counter!(*ESI_CACHE_ERRORS_TOTAL, "operation" => "set").increment(1);
                CacheError::from(e)
            })?;

        metrics::gauge!(*ESI_CACHE_SIZE_BYTES, "layer" => "store").increment(size as f64);
        Ok(())
    }

    /// Removes the entry for `key`. Absence is not an error.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.store.delete(&key.to_string()).await.map_err(|e| {
            metrics::counter!(*ESI_CACHE_ERRORS_TOTAL, "operation" => "delete").increment(1);
            CacheError::from(e)
        })
    }

    /// Rewrites the entry's expiration, used when a 304 carries a new
    /// `Expires`.
    ///
    /// Returns `Ok(false)` when the entry has disappeared in the
    /// meantime.
    pub async fn refresh_ttl(
        &self,
        key: &CacheKey,
        new_expires: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let Some(mut entry) = self.get(key).await? else {
            return Ok(false);
        };
        entry.expires = new_expires;
        self.set(key, &entry).await?;
        Ok(true)
    }
}

/// Builds a cache entry from the parts of a 200 response.
pub(crate) fn entry_from_parts(status: StatusCode, headers: &HeaderMap, body: Bytes) -> CacheEntry {
    let etag = headers
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let last_modified = headers
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    CacheEntry {
        data: body,
        etag,
        expires: parse_expires(headers),
        last_modified,
        status_code: status.as_u16(),
        headers: canonical_headers(headers),
        cached_at: Utc::now(),
    }
}

/// Synthesizes a response from a cached entry.
pub(crate) fn entry_to_response(entry: &CacheEntry) -> reqwest::Response {
    let mut response = http::Response::new(reqwest::Body::from(entry.data.clone()));
    *response.status_mut() =
        StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK);

    let headers = response.headers_mut();
    for (name, values) in &entry.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }

    reqwest::Response::from(response)
}

/// The conditional header a cached entry supports, preferring the entity
/// tag over the last-modified instant.
pub(crate) fn conditional_headers(entry: &CacheEntry) -> Option<(HeaderName, HeaderValue)> {
    if !entry.etag.is_empty() {
        HeaderValue::try_from(entry.etag.as_str())
            .ok()
            .map(|value| (header::IF_NONE_MATCH, value))
    } else if let Some(last_modified) = entry.last_modified {
        HeaderValue::try_from(format_http_date(last_modified))
            .ok()
            .map(|value| (header::IF_MODIFIED_SINCE, value))
    } else {
        None
    }
}

/// Resolves the expiration instant from response headers.
///
/// A missing or malformed `Expires` falls back to [`DEFAULT_TTL`] from
/// now; a value already in the past resolves to now, which yields a zero
/// TTL so the entry is never written.
pub(crate) fn parse_expires(headers: &HeaderMap) -> DateTime<Utc> {
    let Some(value) = headers.get(header::EXPIRES).and_then(|v| v.to_str().ok()) else {
        return Utc::now() + default_ttl();
    };

    match parse_http_date(value) {
        Some(expires) if expires > Utc::now() => expires,
        Some(_) => Utc::now(),
        None => Utc::now() + default_ttl(),
    }
}

/// Parses an HTTP-date header value.
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

/// Formats an instant as an HTTP-date.
pub(crate) fn format_http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Headers in canonical form: lowercase names, values in arrival order.
pub(crate) fn canonical_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_owned())
                .or_default()
                .push(value.to_owned());
        }
    }
    map
}

fn default_ttl() -> TimeDelta {
    TimeDelta::from_std(DEFAULT_TTL).unwrap_or(TimeDelta::MAX)
}
