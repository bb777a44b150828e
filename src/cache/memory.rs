//! In-memory cache backend
//!
//! Single-process backend used by tests and embedded deployments.

use dashmap::DashMap;

use super::{unix_now, CacheBackend, Result};

pub struct InMemoryBackend {
    entries: DashMap<String, (String, Option<u64>)>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheBackend for InMemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let now = unix_now();
        match self.entries.get(key) {
            Some(entry) => {
                let (raw, deadline) = entry.value();
                if matches!(deadline, Some(d) if *d <= now) {
                    drop(entry);
                    self.entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(raw.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, raw: &str, ttl_secs: Option<u64>) -> Result<()> {
        let deadline = ttl_secs.map(|t| unix_now() + t);
        self.entries
            .insert(key.to_string(), (raw.to_string(), deadline));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
