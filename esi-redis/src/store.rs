//! Redis store implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use esi_core::{Store, StoreResult};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use tokio::sync::OnceCell;

use crate::error::Error;

/// Redis-backed [`Store`] for cache entries and rate-limit state.
///
/// Use [`RedisStore::builder`] to construct this type. The connection is
/// established lazily on the first store operation and shared by all
/// clones, multiplexed for concurrent access.
///
/// # Examples
///
/// Basic connection:
///
/// ```no_run
/// use esi_redis::RedisStore;
///
/// # fn main() -> Result<(), esi_redis::Error> {
/// let store = RedisStore::builder()
///     .url("redis://localhost:6379/0")
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// With authentication and timeouts:
///
/// ```no_run
/// use std::time::Duration;
/// use esi_redis::RedisStore;
///
/// # fn main() -> Result<(), esi_redis::Error> {
/// let store = RedisStore::builder()
///     .url("redis://redis.internal:6379/0")
///     .username("esi")
///     .password("secret")
///     .connection_timeout(Duration::from_secs(5))
///     .response_timeout(Duration::from_secs(2))
///     .retries(3)
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// # Caveats
///
/// - The first store operation fails if Redis is unreachable; `build` does
///   not touch the network.
/// - [`set_many`](Store::set_many) issues a single `MULTI`/`EXEC` pipeline
///   so readers never observe a partially written batch.
pub struct RedisStore {
    url: String,
    username: Option<String>,
    password: Option<String>,
    connection_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    number_of_retries: Option<usize>,

    /// Lazy-initialized connection, established on first use.
    connection: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Creates a new builder for `RedisStore`.
    #[must_use]
    pub fn builder() -> RedisStoreBuilder {
        RedisStoreBuilder::default()
    }

    /// Gets or initializes the Redis connection.
    ///
    /// The connection is established only once even under concurrent
    /// first use; subsequent calls return the cached manager.
    async fn connection(&self) -> Result<ConnectionManager, Error> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let mut info: redis::ConnectionInfo = self.url.as_str().parse()?;
                if let Some(ref username) = self.username {
                    info.redis.username = Some(username.clone());
                }
                if let Some(ref password) = self.password {
                    info.redis.password = Some(password.clone());
                }

                let client = Client::open(info)?;

                let mut config = ConnectionManagerConfig::new();
                if let Some(timeout) = self.connection_timeout {
                    config = config.set_connection_timeout(timeout);
                }
                if let Some(timeout) = self.response_timeout {
                    config = config.set_response_timeout(timeout);
                }
                if let Some(retries) = self.number_of_retries {
                    config = config.set_number_of_retries(retries);
                }

                client.get_connection_manager_with_config(config).await
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut conn = self.connection().await?;
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(data.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(Error::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        // DEL returns the number of removed keys; absence is not an error.
        let _removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, Bytes)]) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in pairs {
            pipe.cmd("SET").arg(*key).arg(value.as_ref()).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(Error::from)?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

/// Builder for creating and configuring a [`RedisStore`].
///
/// Use [`RedisStore::builder`] to create a new builder instance.
#[derive(Default)]
pub struct RedisStoreBuilder {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    connection_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    number_of_retries: Option<usize>,
}

impl RedisStoreBuilder {
    /// Sets the Redis connection URL, in the format
    /// `redis://[:<password>@]<host>[:<port>][/<database>]`.
    ///
    /// Required before calling [`build`](Self::build).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the username for Redis 6+ ACL authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password for Redis authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the timeout for establishing a connection.
    ///
    /// Default: no timeout (waits indefinitely).
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the timeout for waiting on Redis responses.
    ///
    /// Default: no timeout (waits indefinitely).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of reconnection attempts.
    ///
    /// Default: the redis-rs default.
    pub fn retries(mut self, count: usize) -> Self {
        self.number_of_retries = Some(count);
        self
    }

    /// Builds the [`RedisStore`].
    ///
    /// Synchronous: the actual connection is established lazily on the
    /// first store operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingUrl`] if no connection URL was specified.
    pub fn build(self) -> Result<RedisStore, Error> {
        let url = self.url.ok_or(Error::MissingUrl)?;

        Ok(RedisStore {
            url,
            username: self.username,
            password: self.password,
            connection_timeout: self.connection_timeout,
            response_timeout: self.response_timeout,
            number_of_retries: self.number_of_retries,
            connection: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_url() {
        assert!(matches!(
            RedisStore::builder().build(),
            Err(Error::MissingUrl)
        ));
    }

    #[test]
    fn build_does_not_connect() {
        // An unreachable host is fine at build time.
        let store = RedisStore::builder()
            .url("redis://255.255.255.255:1/0")
            .build();
        assert!(store.is_ok());
    }
}
