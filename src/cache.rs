//! Tag-aware cache store with pluggable backends
//!
//! Provides deferred writes with explicit commit, per-entry expiry, and
//! tag-scoped invalidation over heterogeneous backends (filesystem,
//! Memcached, Redis, in-memory). Backends move raw serialized envelopes;
//! all schema and tag bookkeeping lives in [`CacheStore`].

pub mod filesystem;
#[cfg(feature = "memcached-storage")]
pub mod memcached;
pub mod memory;
#[cfg(feature = "redis-storage")]
pub mod redis;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::BouncerError;

/// Version stamp embedded in every persisted envelope. A mismatch on read
/// is surfaced as an error, never silently reinterpreted.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Well-known entry holding the stream warm-up flag.
pub const CONFIG_KEY: &str = "cacheConfig";

const MASTER_INDEX_KEY: &str = "index_all_keys";
const TAG_INDEX_PREFIX: &str = "index_tag_";

/// Error type for cache storage operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Entry of {size} bytes exceeds backend limit of {limit} bytes")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("Schema mismatch: {0}")]
    Version(String),
}

impl From<CacheError> for BouncerError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Version(msg) => BouncerError::CacheVersion(msg),
            other => BouncerError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Persisted value envelope shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub tags: Vec<String>,
    /// Absolute unix expiry in seconds; `None` never expires.
    pub expires_at: Option<u64>,
    pub payload: serde_json::Value,
}

impl Envelope {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(e) if e <= now)
    }
}

/// Storage backend contract.
///
/// Backends store and return opaque envelope strings under already-encoded
/// keys. A backend that expires entries natively receives the TTL hint;
/// the filesystem backend ignores it and relies on `prune`.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, raw: &str, ttl_secs: Option<u64>) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Drop entries whose envelope expiry has passed. Only meaningful for
    /// backends without native expiry.
    async fn prune(&self) -> Result<u64> {
        Err(CacheError::Backend(format!(
            "prune is not supported by the {} backend",
            self.name()
        )))
    }

    fn name(&self) -> &'static str;
}

struct PendingPut {
    key: String,
    payload: serde_json::Value,
    expires_at: Option<u64>,
    tags: Vec<String>,
}

/// Tag-aware key/value store over a [`CacheBackend`].
///
/// Writes made through [`CacheStore::put`] are buffered until
/// [`CacheStore::commit`]; reads in the same process observe the buffer,
/// other processes only see committed state.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    pending: tokio::sync::Mutex<Vec<PendingPut>>,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn encode_key(plain: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(plain.as_bytes())
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            pending: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Fetch a live entry. Expired and version-mismatched entries are
    /// misses and errors respectively; uncommitted puts from this process
    /// are visible.
    pub async fn get(&self, key: &str) -> Result<Option<Envelope>> {
        let now = unix_now();

        {
            let pending = self.pending.lock().await;
            if let Some(put) = pending.iter().rev().find(|p| p.key == key) {
                let env = Envelope {
                    v: CACHE_SCHEMA_VERSION,
                    tags: put.tags.clone(),
                    expires_at: put.expires_at,
                    payload: put.payload.clone(),
                };
                return Ok(if env.is_expired(now) { None } else { Some(env) });
            }
        }

        let raw = match self.backend.read(&encode_key(key)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let env = decode_envelope(&raw)?;
        Ok(if env.is_expired(now) { None } else { Some(env) })
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Buffer a write. Nothing reaches the backend until `commit`.
    pub async fn put(
        &self,
        key: &str,
        payload: serde_json::Value,
        expires_at: Option<u64>,
        tags: &[&str],
    ) {
        let mut pending = self.pending.lock().await;
        pending.push(PendingPut {
            key: key.to_string(),
            payload,
            expires_at,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        });
    }

    /// Flush buffered writes to the backend and update the tag indexes.
    pub async fn commit(&self) -> Result<()> {
        let puts = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if puts.is_empty() {
            return Ok(());
        }

        let now = unix_now();
        let mut touched_keys: BTreeSet<String> = BTreeSet::new();
        let mut touched_tags: Vec<(String, BTreeSet<String>)> = Vec::new();

        for put in &puts {
            let env = Envelope {
                v: CACHE_SCHEMA_VERSION,
                tags: put.tags.clone(),
                expires_at: put.expires_at,
                payload: put.payload.clone(),
            };
            let raw = serde_json::to_string(&env)
                .map_err(|e| CacheError::Backend(format!("envelope serialization: {e}")))?;
            let ttl = put.expires_at.map(|e| e.saturating_sub(now).max(1));
            self.backend.write(&encode_key(&put.key), &raw, ttl).await?;

            touched_keys.insert(put.key.clone());
            for tag in &put.tags {
                match touched_tags.iter_mut().find(|(t, _)| t == tag) {
                    Some((_, keys)) => {
                        keys.insert(put.key.clone());
                    }
                    None => {
                        let mut keys = BTreeSet::new();
                        keys.insert(put.key.clone());
                        touched_tags.push((tag.clone(), keys));
                    }
                }
            }
        }

        for (tag, keys) in touched_tags {
            let index_key = format!("{TAG_INDEX_PREFIX}{tag}");
            self.merge_index(&index_key, &keys).await?;
            touched_keys.insert(index_key);
        }
        self.merge_index(MASTER_INDEX_KEY, &touched_keys).await?;

        Ok(())
    }

    /// Remove an entry immediately.
    pub async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|p| p.key != key);
        }
        self.backend.remove(&encode_key(key)).await
    }

    /// Remove every entry this store ever committed, plus the buffer.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            pending.clear();
        }
        let keys = self.read_index(MASTER_INDEX_KEY).await?;
        for key in keys {
            self.backend.remove(&encode_key(&key)).await?;
        }
        self.backend.remove(&encode_key(MASTER_INDEX_KEY)).await
    }

    /// Remove exactly the entries ever committed with `tag`.
    pub async fn clear_by_tag(&self, tag: &str) -> Result<()> {
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|p| !p.tags.iter().any(|t| t == tag));
        }
        let index_key = format!("{TAG_INDEX_PREFIX}{tag}");
        let keys = self.read_index(&index_key).await?;
        for key in keys {
            self.backend.remove(&encode_key(&key)).await?;
        }
        self.backend.remove(&encode_key(&index_key)).await
    }

    /// Drop expired entries on non-self-expiring backends.
    pub async fn prune(&self) -> Result<u64> {
        self.backend.prune().await
    }

    async fn read_index(&self, index_key: &str) -> Result<Vec<String>> {
        match self.backend.read(&encode_key(index_key)).await? {
            Some(raw) => {
                let env = decode_envelope(&raw)?;
                serde_json::from_value(env.payload)
                    .map_err(|e| CacheError::Backend(format!("index payload: {e}")))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn merge_index(&self, index_key: &str, keys: &BTreeSet<String>) -> Result<()> {
        let mut all: BTreeSet<String> = self.read_index(index_key).await?.into_iter().collect();
        all.extend(keys.iter().cloned());
        let env = Envelope {
            v: CACHE_SCHEMA_VERSION,
            tags: Vec::new(),
            expires_at: None,
            payload: serde_json::to_value(all.into_iter().collect::<Vec<_>>())
                .map_err(|e| CacheError::Backend(format!("index serialization: {e}")))?,
        };
        let raw = serde_json::to_string(&env)
            .map_err(|e| CacheError::Backend(format!("index serialization: {e}")))?;
        self.backend.write(&encode_key(index_key), &raw, None).await
    }
}

pub(crate) fn decode_envelope(raw: &str) -> Result<Envelope> {
    let env: Envelope = serde_json::from_str(raw)
        .map_err(|e| CacheError::Version(format!("undecodable envelope: {e}")))?;
    if env.v != CACHE_SCHEMA_VERSION {
        return Err(CacheError::Version(format!(
            "found schema v{}, expected v{CACHE_SCHEMA_VERSION}",
            env.v
        )));
    }
    Ok(env)
}
