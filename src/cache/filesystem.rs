//! Filesystem cache backend
//!
//! Stores one envelope per file, sharded by key digest. Files never expire
//! on their own; `prune` walks the shards and drops entries whose envelope
//! expiry has passed.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::{decode_envelope, unix_now, CacheBackend, CacheError, Result};

pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let shard = hex::encode(&digest[..1]);
        self.root.join(shard).join(format!("{key}.json"))
    }

    async fn read_file(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Backend(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl CacheBackend for FilesystemBackend {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Self::read_file(&self.entry_path(key)).await
    }

    async fn write(&self, key: &str, raw: &str, _ttl_secs: Option<u64>) -> Result<()> {
        let path = self.entry_path(key);
        let dir = path
            .parent()
            .ok_or_else(|| CacheError::Backend("entry path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CacheError::Backend(format!("mkdir {}: {e}", dir.display())))?;

        // Write-then-rename so concurrent readers never observe a torn file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| CacheError::Backend(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::Backend(format!("rename {}: {e}", path.display())))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Backend(format!("remove {key}: {e}"))),
        }
    }

    async fn prune(&self) -> Result<u64> {
        let now = unix_now();
        let mut pruned = 0u64;

        let mut shards = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CacheError::Backend(format!(
                    "read_dir {}: {e}",
                    self.root.display()
                )))
            }
        };

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| CacheError::Backend(format!("walk shards: {e}")))?
        {
            if !shard
                .file_type()
                .await
                .map_err(|e| CacheError::Backend(format!("stat shard: {e}")))?
                .is_dir()
            {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path())
                .await
                .map_err(|e| CacheError::Backend(format!("walk shard: {e}")))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| CacheError::Backend(format!("walk entries: {e}")))?
            {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = match Self::read_file(&path).await? {
                    Some(raw) => raw,
                    None => continue,
                };
                let expired = match decode_envelope(&raw) {
                    Ok(env) => env.is_expired(now),
                    // Leave undecodable files alone; reads surface them.
                    Err(_) => false,
                };
                if expired {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        pruned += 1;
                    }
                }
            }
        }

        Ok(pruned)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
