//! Memcached cache backend
//!
//! The `memcache` driver is synchronous; operations run on the blocking
//! pool. Connect-time and transport failures surface as typed errors.
//! Memcached refuses values above 1 MiB, so oversized entries fail fast
//! here instead of being truncated server-side.

use std::sync::Arc;

use super::{unix_now, CacheBackend, CacheError, Result};

const MAX_ENTRY_BYTES: usize = 1024 * 1024;
const KEY_PREFIX: &str = "tg:";

// Memcached reads an expiration above 30 days as an absolute timestamp.
const RELATIVE_TTL_CEILING: u64 = 60 * 60 * 24 * 30;

pub struct MemcachedBackend {
    client: Arc<memcache::Client>,
}

impl MemcachedBackend {
    pub fn new(dsn: &str) -> Result<Self> {
        let client = memcache::connect(dsn)
            .map_err(|e| CacheError::Backend(format!("memcached connect: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn memcached_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemcachedBackend {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let client = self.client.clone();
        let key = Self::memcached_key(key);
        tokio::task::spawn_blocking(move || {
            client
                .get::<String>(&key)
                .map_err(|e| CacheError::Backend(format!("memcached get: {e}")))
        })
        .await
        .map_err(|e| CacheError::Backend(format!("memcached task: {e}")))?
    }

    async fn write(&self, key: &str, raw: &str, ttl_secs: Option<u64>) -> Result<()> {
        if raw.len() > MAX_ENTRY_BYTES {
            return Err(CacheError::EntryTooLarge {
                size: raw.len(),
                limit: MAX_ENTRY_BYTES,
            });
        }
        let client = self.client.clone();
        let key = Self::memcached_key(key);
        let raw = raw.to_string();
        // Memcached treats 0 as "never expires".
        let expiration = match ttl_secs {
            None => 0,
            Some(t) if t > RELATIVE_TTL_CEILING => (unix_now() + t).min(u32::MAX as u64) as u32,
            Some(t) => t.min(RELATIVE_TTL_CEILING) as u32,
        };
        tokio::task::spawn_blocking(move || {
            client
                .set(&key, raw.as_str(), expiration)
                .map_err(|e| CacheError::Backend(format!("memcached set: {e}")))
        })
        .await
        .map_err(|e| CacheError::Backend(format!("memcached task: {e}")))?
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let client = self.client.clone();
        let key = Self::memcached_key(key);
        tokio::task::spawn_blocking(move || {
            client
                .delete(&key)
                .map(|_| ())
                .map_err(|e| CacheError::Backend(format!("memcached delete: {e}")))
        })
        .await
        .map_err(|e| CacheError::Backend(format!("memcached task: {e}")))?
    }

    fn name(&self) -> &'static str {
        "memcached"
    }
}
