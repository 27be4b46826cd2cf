//! ESI error-limit tracking and request gating.
//!
//! ESI tracks errors per IP in sliding windows and bans addresses that
//! keep sending requests after the budget runs out. The tracker monitors
//! the `X-ESI-Error-Limit-Remain` and `X-ESI-Error-Limit-Reset` headers
//! and gates every outbound call against the shared state, so the budget
//! is enforced across all replicas, not per process.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use esi_core::{
    KEY_ERRORS_REMAINING, KEY_LAST_UPDATE, KEY_RESET_TIMESTAMP, RateLimitState, Store,
};
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::metrics::{
    ESI_ERRORS_REMAINING, ESI_RATE_LIMIT_BLOCKS_TOTAL, ESI_RATE_LIMIT_THROTTLES_TOTAL,
};

const REMAIN_HEADER: &str = "x-esi-error-limit-remain";
const RESET_HEADER: &str = "x-esi-error-limit-reset";

/// Pause inserted before an admitted call while in the warning band.
const THROTTLE_PAUSE: Duration = Duration::from_secs(1);

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may go out (possibly after a throttle pause).
    Allow,
    /// The call must not be sent; the error budget is critical.
    Block,
}

/// Gate deciding, per call, whether the shared error budget permits
/// contacting the upstream.
pub struct RateLimitTracker {
    store: Arc<dyn Store>,
}

impl RateLimitTracker {
    /// Creates a tracker over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        RateLimitTracker { store }
    }

    /// Reads the current rate-limit state from the store.
    ///
    /// When no state exists yet (fresh deployment), a healthy default is
    /// synthesized and *not* written back: a new replica must not be more
    /// conservative than an established one. Partially present state is
    /// read as-is with missing fields taking zero values.
    pub async fn state(&self) -> Result<RateLimitState, Error> {
        let errors_remaining = self.store.get(KEY_ERRORS_REMAINING).await?;
        let reset_timestamp = self.store.get(KEY_RESET_TIMESTAMP).await?;
        let last_update = self.store.get(KEY_LAST_UPDATE).await?;

        if errors_remaining.is_none() && reset_timestamp.is_none() && last_update.is_none() {
            debug!("no rate limit state in store, assuming healthy default");
            return Ok(RateLimitState::healthy_default());
        }

        let errors_remaining = errors_remaining.as_deref().and_then(parse_i64).unwrap_or(0);
        let reset_at = reset_timestamp
            .as_deref()
            .and_then(parse_i64)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_default();
        let last_update = last_update
            .as_deref()
            .and_then(parse_instant)
            .unwrap_or_default();

        Ok(RateLimitState::new(errors_remaining, reset_at, last_update))
    }

    /// Absorbs budget headers from an upstream response into the shared
    /// state.
    ///
    /// A response without `X-ESI-Error-Limit-Remain` is a no-op, since
    /// not every response carries budget headers. When remain is present the
    /// reset header must be too: the upstream sends them together, and a
    /// missing or malformed value is an error. All three state fields are
    /// written in one atomic round-trip so no reader observes a mixed
    /// tuple.
    pub async fn absorb_headers(&self, headers: &HeaderMap) -> Result<(), Error> {
        let Some(remain_value) = headers.get(REMAIN_HEADER) else {
            return Ok(());
        };
        let remain = remain_value
            .to_str()
            .ok()
            .and_then(parse_i64_str)
            .ok_or_else(|| Error::MalformedHeader {
                header: "X-ESI-Error-Limit-Remain",
                value: String::from_utf8_lossy(remain_value.as_bytes()).into_owned(),
            })?;

        let reset_value = headers.get(RESET_HEADER).ok_or(Error::MissingResetHeader)?;
        let reset_seconds = reset_value
            .to_str()
            .ok()
            .and_then(parse_i64_str)
            .ok_or_else(|| Error::MalformedHeader {
                header: "X-ESI-Error-Limit-Reset",
                value: String::from_utf8_lossy(reset_value.as_bytes()).into_owned(),
            })?;

        let now = Utc::now();
        let state = RateLimitState::new(remain, now + TimeDelta::seconds(reset_seconds), now);

        self.store
            .set_many(&[
                (KEY_ERRORS_REMAINING, Bytes::from(remain.to_string())),
                (
                    KEY_RESET_TIMESTAMP,
                    Bytes::from(state.reset_at.timestamp().to_string()),
                ),
                (KEY_LAST_UPDATE, Bytes::from(state.last_update.to_rfc3339())),
            ])
            .await?;

        metrics::gauge!(*ESI_ERRORS_REMAINING).set(remain as f64);

        if state.needs_critical_block() {
            error!(
                errors_remaining = state.errors_remaining,
                reset_at = %state.reset_at,
                "ESI error limit critical, requests will be blocked"
            );
        } else if state.needs_throttling() {
            warn!(
                errors_remaining = state.errors_remaining,
                reset_at = %state.reset_at,
                "ESI error limit warning, requests will be throttled"
            );
        } else {
            info!(
                errors_remaining = state.errors_remaining,
                reset_at = %state.reset_at,
                is_healthy = state.is_healthy,
                "ESI error limit state updated"
            );
        }

        Ok(())
    }

    /// Decides whether a request may go out.
    ///
    /// Critical budget blocks the call outright. In the warning band the
    /// call is admitted after a one-second throttle pause; the pause is a
    /// cooperative wait that honors `cancel`.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Admission, Error> {
        let state = self.state().await?;

        if state.needs_critical_block() {
            error!(
                errors_remaining = state.errors_remaining,
                wait = ?state.time_until_reset(),
                "ESI error limit critical, blocking request"
            );
            metrics::counter!(*ESI_RATE_LIMIT_BLOCKS_TOTAL).increment(1);
            return Ok(Admission::Block);
        }

        if state.needs_throttling() {
            warn!(
                errors_remaining = state.errors_remaining,
                "ESI error limit warning, throttling request"
            );
            metrics::counter!(*ESI_RATE_LIMIT_THROTTLES_TOTAL).increment(1);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(THROTTLE_PAUSE) => {}
            }
        }

        Ok(Admission::Allow)
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok().and_then(parse_i64_str)
}

fn parse_i64_str(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

fn parse_instant(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let value = std::str::from_utf8(bytes).ok()?;
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}
