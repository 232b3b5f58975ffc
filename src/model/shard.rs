use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::Result;

/// Shard storage boundary the core consumes (spec §6 "Shard adapter").
/// Integrity checking of the returned bytes is the adapter's responsibility.
#[async_trait]
pub trait ShardAdapter: Send + Sync {
    async fn load_shard(&self, shard_index: u32) -> Result<Vec<u8>>;
}

/// Default adapter: shards are local files or URLs, named `{base}.shard_{i}`
/// alongside the manifest. Remote shards are cached to `cache_dir`, mirroring
/// the teacher's `fetch_model` disk-cache behavior.
pub struct LocalFileShardAdapter {
    base: String,
    cache_dir: Option<PathBuf>,
}

impl LocalFileShardAdapter {
    pub fn new(base: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            base: base.into(),
            cache_dir,
        }
    }

    fn shard_source(&self, shard_index: u32) -> String {
        format!("{}.shard_{shard_index}", self.base)
    }
}

#[async_trait]
impl ShardAdapter for LocalFileShardAdapter {
    async fn load_shard(&self, shard_index: u32) -> Result<Vec<u8>> {
        let source = self.shard_source(shard_index);

        if source.starts_with('/') || source.starts_with('.') || !source.contains("://") {
            return Ok(tokio::fs::read(&source).await?);
        }

        let cache_dir = self
            .cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join("gpulm-core")));

        if let Some(ref cache_dir) = cache_dir {
            let hash = format!("{:x}", Sha256::digest(source.as_bytes()));
            let cache_path = cache_dir.join(&hash);
            if cache_path.exists() {
                debug!(path = %cache_path.display(), "loading shard from cache");
                return Ok(tokio::fs::read(&cache_path).await?);
            }
        }

        info!(%source, "downloading shard");
        let response = reqwest::get(&source).await?;
        let bytes = response.bytes().await?;
        let data = bytes.to_vec();

        if let Some(ref cache_dir) = cache_dir {
            let hash = format!("{:x}", Sha256::digest(source.as_bytes()));
            let cache_path = cache_dir.join(&hash);
            if let Err(e) = tokio::fs::create_dir_all(cache_dir).await {
                debug!("failed to create shard cache dir: {e}");
            } else if let Err(e) = tokio::fs::write(&cache_path, &data).await {
                debug!("failed to write shard cache: {e}");
            }
        }

        Ok(data)
    }
}
