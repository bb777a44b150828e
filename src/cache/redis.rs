//! Redis cache backend
//!
//! Entries expire natively via `SET ... EX`; `prune` is unsupported.

use std::sync::Arc;

use redis::AsyncCommands;

use super::{CacheBackend, CacheError, Result};

const KEY_PREFIX: &str = "threatgate:";

pub struct RedisBackend {
    client: Arc<redis::Client>,
}

impl RedisBackend {
    pub fn new(dsn: &str) -> Result<Self> {
        let client =
            redis::Client::open(dsn).map_err(|e| CacheError::Backend(format!("redis: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn redis_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend(format!("redis: {e}")))
    }
}

#[async_trait::async_trait]
impl CacheBackend for RedisBackend {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(Self::redis_key(key))
            .await
            .map_err(|e| CacheError::Backend(format!("redis: {e}")))
    }

    async fn write(&self, key: &str, raw: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = Self::redis_key(key);
        match ttl_secs {
            Some(ttl) => redis::cmd("SET")
                .arg(&key)
                .arg(raw)
                .arg("EX")
                .arg(ttl)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(format!("redis: {e}"))),
            None => redis::cmd("SET")
                .arg(&key)
                .arg(raw)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| CacheError::Backend(format!("redis: {e}"))),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .del(Self::redis_key(key))
            .await
            .map_err(|e| CacheError::Backend(format!("redis: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
