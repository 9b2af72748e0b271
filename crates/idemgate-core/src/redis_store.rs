//! Redis-backed [`SharedStore`].
//!
//! Commands:
//!
//! | Operation          | Redis                                  |
//! |--------------------|----------------------------------------|
//! | `insert_if_absent` | `SET key value NX PX ttl`              |
//! | `get`              | `GET key`                              |
//! | `set_with_expiry`  | `SET key value PX ttl`                 |
//! | `set_if_equals`    | Lua: `GET` + `SET PX` when the value matches |
//! | `delete_if_equals` | Lua: `GET` + `DEL` when the value matches |
//! | `publish`          | `PUBLISH channel message`              |
//! | `subscribe`        | dedicated pub/sub connection           |
//!
//! Regular commands share one multiplexed [`ConnectionManager`]. Every
//! subscription opens its own pub/sub connection, closed when the
//! [`Subscription`] is dropped.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};

use crate::error::{Error, Result};
use crate::store::{SharedStore, Subscription};

const DELETE_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const SET_IF_EQUALS_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
";

/// [`SharedStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
    set_if_equals: Script,
    delete_if_equals: Script,
}

impl RedisStore {
    /// Connects to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(store_error("open redis client"))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(store_error("connect to redis"))?;

        tracing::info!(addr = %client.get_connection_info().addr, "connected to redis");

        Ok(Self {
            client,
            connection,
            set_if_equals: Script::new(SET_IF_EQUALS_SCRIPT),
            delete_if_equals: Script::new(DELETE_IF_EQUALS_SCRIPT),
        })
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error("GET"))?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let (): () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error("SET PX"))?;
        Ok(())
    }

    async fn set_if_equals(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let replaced: i64 = self
            .set_if_equals
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("compare-and-set"))?;
        Ok(replaced > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error("compare-and-delete"))?;
        Ok(deleted > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.connection.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(store_error("PUBLISH"))?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(store_error("open pub/sub connection"))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(store_error("SUBSCRIBE"))?;

        let messages = pubsub.into_on_message().filter_map(|msg| {
            let payload = msg.get_payload::<String>();
            if let Err(e) = &payload {
                tracing::warn!(error = %e, "dropping non-UTF-8 pub/sub payload");
            }
            futures::future::ready(payload.ok())
        });
        Ok(Subscription::new(channel, messages))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error("PING"))?;
        Ok(())
    }
}

fn store_error(op: &'static str) -> impl FnOnce(RedisError) -> Error {
    move |e| Error::store_with_source(format!("redis {op} failed: {e}"), e)
}

/// Redis rejects `PX 0`; sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(20)), 20_000);
    }

    #[test]
    fn store_error_keeps_redis_cause() {
        let redis_err = RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err = store_error("GET")(redis_err);
        assert!(err.is_store_failure());
        assert!(err.to_string().contains("redis GET failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn invalid_url_is_a_store_error() {
        let err = RedisStore::connect("not-a-url").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
    }
}
