//! The ESI client and its request pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use esi_core::{CacheKey, ErrorClass, Store};
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use reqwest::{Request, Response, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::{self, CacheManager};
use crate::error::Error;
use crate::metrics::{
    ESI_CONDITIONAL_REQUESTS_TOTAL, ESI_ERRORS_TOTAL, ESI_NOT_MODIFIED_TOTAL,
    ESI_REQUESTS_TOTAL, ESI_REQUEST_DURATION,
};
use crate::ratelimit::{Admission, RateLimitTracker};
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Default upstream base URL used by [`Client::get`].
pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net";

/// Outer transport safety net. Callers compose tighter deadlines through
/// the cancellation token.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client configuration, consumed by [`Client::new`].
///
/// [`Config::new`] fills every field with a safe default; override fields
/// directly before constructing the client.
pub struct Config {
    /// Shared store for the cache and the rate-limit state. Hand the
    /// same store to every replica that should share one error budget.
    pub store: Arc<dyn Store>,

    /// `User-Agent` sent with every request, required by ESI in the form
    /// `"AppName/Version (contact@example.com)"`.
    pub user_agent: String,

    /// Upstream base URL for [`Client::get`].
    pub base_url: String,

    /// Whether to honor the upstream `Expires` header. ESI requires
    /// this; construction fails when set to `false`.
    pub respect_expires: bool,

    /// Minimum error budget the deployment is willing to burn. Must be
    /// at least 5; gating itself uses the fixed thresholds in
    /// [`esi_core::state`].
    pub error_threshold: i64,

    /// Soft requests-per-second cap for callers that schedule their own
    /// load.
    pub rate_limit: u32,

    /// Parallel request budget for callers that fan out.
    pub max_concurrency: usize,

    /// Reserved for an in-process cache tier; currently unused.
    pub memory_cache_ttl: Duration,

    /// Maximum attempts per call, including the first.
    pub max_retries: u32,

    /// Base backoff scaled per error class by the retry policy.
    pub initial_backoff: Duration,
}

impl Config {
    /// Returns a configuration with safe defaults for the given store
    /// and user agent.
    pub fn new(store: Arc<dyn Store>, user_agent: impl Into<String>) -> Self {
        Config {
            store,
            user_agent: user_agent.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            respect_expires: true,
            error_threshold: 10,
            rate_limit: 10,
            max_concurrency: 5,
            memory_cache_ttl: Duration::from_secs(60),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Captured request parts, rebuilt into a fresh request per attempt.
#[derive(Clone)]
struct RequestParts {
    method: Method,
    url: Url,
    headers: HeaderMap,
}

impl RequestParts {
    fn from_request(request: &Request) -> Self {
        RequestParts {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
        }
    }

    fn into_request(self) -> Request {
        let mut request = Request::new(self.method, self.url);
        *request.headers_mut() = self.headers;
        request
    }
}

/// The ESI client.
///
/// Every call runs the same pipeline in fixed order: rate-limit gate,
/// cache lookup, conditional headers, retry-wrapped upstream send with
/// budget accounting and error classification, then cache write-back
/// (200) or TTL refresh and cached-body synthesis (304).
///
/// The client is cheap to share behind an [`Arc`]; it holds only
/// configuration and connection pools. All cross-call state lives in the
/// store.
pub struct Client {
    http: reqwest::Client,
    store: Arc<dyn Store>,
    tracker: RateLimitTracker,
    cache: CacheManager,
    retry: RetryPolicy,
    user_agent: HeaderValue,
    base_url: Url,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("retry", &self.retry)
            .field("user_agent", &self.user_agent)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the user agent is empty,
    /// `respect_expires` is `false`, the error threshold is below 5, or
    /// the base URL does not parse.
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.user_agent.is_empty() {
            return Err(Error::InvalidConfig("user-agent is required".to_owned()));
        }
        if !config.respect_expires {
            return Err(Error::InvalidConfig(
                "respect_expires must be true (ESI requirement)".to_owned(),
            ));
        }
        if config.error_threshold < 5 {
            return Err(Error::InvalidConfig(format!(
                "error_threshold must be >= 5 (got {})",
                config.error_threshold
            )));
        }
        let user_agent = HeaderValue::try_from(config.user_agent.as_str())
            .map_err(|_| Error::InvalidConfig("user-agent is not a valid header value".to_owned()))?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::InvalidConfig(format!("invalid base url: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()?;

        Ok(Client {
            http,
            store: Arc::clone(&config.store),
            tracker: RateLimitTracker::new(Arc::clone(&config.store)),
            cache: CacheManager::new(Arc::clone(&config.store)),
            retry: RetryPolicy::new(config.max_retries, config.initial_backoff),
            user_agent,
            base_url,
        })
    }

    /// Performs a GET against an upstream path, e.g. `/v1/status/`.
    pub async fn get(&self, cancel: &CancellationToken, path: &str) -> Result<Response, Error> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| Error::InvalidRequest(format!("path {path:?}: {e}")))?;
        self.execute(cancel, Request::new(Method::GET, url)).await
    }

    /// Performs a pre-built request through the full pipeline.
    ///
    /// Use this instead of [`get`](Client::get) when the request needs
    /// query parameters or extra headers.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<Response, Error> {
        self.execute_as(cancel, request, 0).await
    }

    /// Like [`execute`](Client::execute), with the cache entry scoped to
    /// a character for authenticated endpoints.
    pub async fn execute_as(
        &self,
        cancel: &CancellationToken,
        request: Request,
        character_id: i64,
    ) -> Result<Response, Error> {
        let endpoint = request.url().path().to_owned();
        let start = Instant::now();

        let result = self
            .run_pipeline(cancel, request, character_id, &endpoint)
            .await;

        metrics::histogram!(*ESI_REQUEST_DURATION, "endpoint" => endpoint)
            .record(start.elapsed().as_secs_f64());
        result
    }

    /// Verifies the store is reachable and the rate-limit state is
    /// readable. Health endpoints of embedding services report 503 when
    /// this fails.
    pub async fn health_check(&self) -> Result<(), Error> {
        self.store.ping().await?;
        self.tracker.state().await?;
        Ok(())
    }

    /// Releases client resources. Connection pools held by the client
    /// are dropped; the store handle belongs to the caller and stays
    /// open.
    pub fn close(self) {}

    async fn run_pipeline(
        &self,
        cancel: &CancellationToken,
        mut request: Request,
        character_id: i64,
        endpoint: &str,
    ) -> Result<Response, Error> {
        // The gate comes first: a blocked call must consume nothing, not
        // even a cache read.
        match self.tracker.admit(cancel).await? {
            Admission::Allow => {}
            Admission::Block => {
                warn!(endpoint, "request blocked by rate limiter");
                metrics::counter!(
                    *ESI_REQUESTS_TOTAL,
                    "endpoint" => endpoint.to_owned(),
                    "status" => "rate_limited"
                )
                .increment(1);
                return Err(Error::RateLimitCritical);
            }
        }

        let mut key = CacheKey::new(endpoint).character(character_id);
        for (name, value) in request.url().query_pairs() {
            key = key.query_param(name, value);
        }

        // Cache trouble is never fatal; proceed as on a miss.
        let cached = match self.cache.get(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, endpoint, "cache get error");
                None
            }
        };

        if let Some(entry) = &cached
            && let Some((name, value)) = cache::conditional_headers(entry)
        {
            debug!(endpoint, etag = %entry.etag, "making conditional request");
            request.headers_mut().insert(name, value);
            metrics::counter!(*ESI_CONDITIONAL_REQUESTS_TOTAL).increment(1);
        }

        request
            .headers_mut()
            .insert(header::USER_AGENT, self.user_agent.clone());
        request
            .headers_mut()
            .insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        debug!(endpoint, method = %request.method(), "executing ESI request");

        let parts = RequestParts::from_request(&request);
        let mut made_first_attempt = false;
        let response = retry_with_backoff(cancel, &self.retry, Error::class, || {
            let first_attempt = !made_first_attempt;
            made_first_attempt = true;
            self.send_attempt(cancel, parts.clone(), endpoint, first_attempt)
        })
        .await?;

        if response.status() == StatusCode::NOT_MODIFIED
            && let Some(entry) = cached
        {
            debug!(endpoint, "304 Not Modified, serving cached entry");
            metrics::counter!(*ESI_NOT_MODIFIED_TOTAL).increment(1);
            metrics::counter!(
                *ESI_REQUESTS_TOTAL,
                "endpoint" => endpoint.to_owned(),
                "status" => "304"
            )
            .increment(1);

            if let Some(new_expires) = response
                .headers()
                .get(header::EXPIRES)
                .and_then(|v| v.to_str().ok())
                .and_then(cache::parse_http_date)
            {
                match self.cache.refresh_ttl(&key, new_expires).await {
                    Ok(true) => {}
                    Ok(false) => debug!(endpoint, "cache entry gone before TTL refresh"),
                    Err(e) => warn!(error = %e, endpoint, "failed to refresh cache TTL"),
                }
            }

            // The physical 304 body is closed here; the caller gets a
            // fresh body over the cached bytes.
            drop(response);
            return Ok(cache::entry_to_response(&entry));
        }

        if response.status() == StatusCode::OK {
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            let entry = cache::entry_from_parts(status, &headers, body.clone());
            if !entry.ttl().is_zero() {
                match self.cache.set(&key, &entry).await {
                    Ok(()) => debug!(endpoint, ttl = ?entry.ttl(), "cached response"),
                    Err(e) => warn!(error = %e, endpoint, "failed to cache response"),
                }
            }

            return Ok(rebuild_response(status, &headers, body));
        }

        Ok(response)
    }

    /// One upstream attempt: send, absorb budget headers, classify.
    async fn send_attempt(
        &self,
        cancel: &CancellationToken,
        parts: RequestParts,
        endpoint: &str,
        first_attempt: bool,
    ) -> Result<Response, Error> {
        let send = self.http.execute(parts.into_request());
        let outcome = if first_attempt {
            // The first attempt always runs, even for an already-cancelled
            // caller: it may still get a fast 304 out of the upstream.
            send.await
        } else {
            tokio::select! {
                result = send => result,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, endpoint, "HTTP request failed");
                metrics::counter!(*ESI_ERRORS_TOTAL, "class" => ErrorClass::Network.as_str())
                    .increment(1);
                metrics::counter!(
                    *ESI_REQUESTS_TOTAL,
                    "endpoint" => endpoint.to_owned(),
                    "status" => "network_error"
                )
                .increment(1);
                return Err(Error::Transport(e));
            }
        };

        // Budget headers are absorbed on every response, successful or
        // failing, before any classification.
        if let Err(e) = self.tracker.absorb_headers(response.headers()).await {
            warn!(error = %e, "failed to update rate limit state from headers");
        }

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        if let Some(class) = ErrorClass::classify(Some(status), false) {
            metrics::counter!(*ESI_ERRORS_TOTAL, "class" => class.as_str()).increment(1);
            metrics::counter!(
                *ESI_REQUESTS_TOTAL,
                "endpoint" => endpoint.to_owned(),
                "status" => status.as_u16().to_string()
            )
            .increment(1);
            warn!(
                endpoint,
                status = status.as_u16(),
                error_class = %class,
                "ESI request error"
            );

            if class.is_retryable() {
                // Close the body before the retry loop decides.
                drop(response);
                return Err(Error::UpstreamStatus { status, class });
            }

            // Client errors flow back with the response intact.
            return Ok(response);
        }

        metrics::counter!(
            *ESI_REQUESTS_TOTAL,
            "endpoint" => endpoint.to_owned(),
            "status" => status.as_u16().to_string()
        )
        .increment(1);
        Ok(response)
    }
}

/// Restores a response for the caller from its captured parts and body.
fn rebuild_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let mut response = http::Response::new(reqwest::Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers.clone();
    Response::from(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use esi_core::{StoreResult, StoreError};
    use async_trait::async_trait;

    struct NullStore;

    #[async_trait]
    impl Store for NullStore {
        async fn get(&self, _key: &str) -> StoreResult<Option<Bytes>> {
            Ok(None)
        }
        async fn set(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Option<Duration>,
        ) -> StoreResult<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn set_many(&self, _pairs: &[(&str, Bytes)]) -> StoreResult<()> {
            Ok(())
        }
        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Connection("unreachable".into()))
        }
    }

    fn store() -> Arc<dyn Store> {
        Arc::new(NullStore)
    }

    #[test]
    fn valid_config_builds() {
        let config = Config::new(store(), "TestApp/1.0.0 (test@example.com)");
        assert!(Client::new(config).is_ok());
    }

    #[test]
    fn empty_user_agent_is_rejected() {
        let config = Config::new(store(), "");
        let err = Client::new(config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("user-agent")));
    }

    #[test]
    fn disrespecting_expires_is_rejected() {
        let mut config = Config::new(store(), "TestApp/1.0.0");
        config.respect_expires = false;
        let err = Client::new(config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("respect_expires")));
    }

    #[test]
    fn low_error_threshold_is_rejected() {
        let mut config = Config::new(store(), "TestApp/1.0.0");
        config.error_threshold = 3;
        let err = Client::new(config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(m) if m.contains("error_threshold")));
    }

    #[test]
    fn defaults() {
        let config = Config::new(store(), "TestApp/1.0.0");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.respect_expires);
        assert_eq!(config.error_threshold, 10);
        assert_eq!(config.rate_limit, 10);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.memory_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
    }
}
