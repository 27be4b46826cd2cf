//! Cached response entries.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached upstream response.
///
/// Entries are immutable snapshots: they are created from a 200 response,
/// persisted with a native TTL matching [`ttl`](CacheEntry::ttl) at write
/// time, and replaced wholesale. The only field ever rewritten in place is
/// `expires`, when a 304 carries a fresh expiration.
///
/// `expires` is always populated: when the upstream supplies no freshness
/// header, the writer falls back to a default window past `cached_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response body, opaque bytes.
    pub data: Bytes,

    /// Entity tag for conditional requests (`If-None-Match`). Empty when
    /// the upstream sent none.
    #[serde(default)]
    pub etag: String,

    /// Instant the entry becomes stale.
    pub expires: DateTime<Utc>,

    /// Secondary validator for `If-Modified-Since`.
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,

    /// HTTP status code of the cached response.
    pub status_code: u16,

    /// Response headers in canonical form: lowercase names mapped to
    /// their values in arrival order.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,

    /// Instant the response was cached.
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns true once the freshness window has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Time until expiration, floored at zero.
    pub fn ttl(&self) -> Duration {
        let remaining = self.expires.signed_duration_since(Utc::now());
        match remaining.num_milliseconds() {
            ms if ms > 0 => Duration::from_millis(ms as u64),
            _ => Duration::ZERO,
        }
    }

    /// Whether the entry can drive a conditional request.
    pub fn has_validators(&self) -> bool {
        !self.etag.is_empty() || self.last_modified.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn entry(expires: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            data: Bytes::from_static(b"{\"status\":\"ok\"}"),
            etag: "\"v1\"".to_owned(),
            expires,
            last_modified: None,
            status_code: 200,
            headers: BTreeMap::new(),
            cached_at: Utc::now(),
        }
    }

    #[test]
    fn fresh_entry_is_not_expired() {
        let e = entry(Utc::now() + TimeDelta::minutes(5));
        assert!(!e.is_expired());
        assert!(e.ttl() > Duration::from_secs(290));
    }

    #[test]
    fn past_expiry_means_expired_and_zero_ttl() {
        let e = entry(Utc::now() - TimeDelta::seconds(1));
        assert!(e.is_expired());
        assert_eq!(e.ttl(), Duration::ZERO);
    }

    #[test]
    fn subsecond_ttl_is_not_rounded_to_zero() {
        let e = entry(Utc::now() + TimeDelta::milliseconds(900));
        assert!(e.ttl() > Duration::ZERO);
    }

    #[test]
    fn validators() {
        let mut e = entry(Utc::now() + TimeDelta::minutes(5));
        assert!(e.has_validators());

        e.etag.clear();
        assert!(!e.has_validators());

        e.last_modified = Some(Utc::now());
        assert!(e.has_validators());
    }

    #[test]
    fn json_round_trip_preserves_body_and_headers() {
        let mut e = entry(Utc::now() + TimeDelta::minutes(5));
        e.headers.insert(
            "content-type".to_owned(),
            vec!["application/json; charset=utf-8".to_owned()],
        );
        e.headers
            .insert("etag".to_owned(), vec!["\"v1\"".to_owned()]);

        let encoded = serde_json::to_vec(&e).unwrap();
        let decoded: CacheEntry = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, e);
        assert_eq!(decoded.data, e.data);
        assert_eq!(decoded.headers, e.headers);
    }
}
