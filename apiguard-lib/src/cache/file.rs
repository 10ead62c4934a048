use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::request::Parts;
use tracing::{debug, warn};

use super::{cache_key, Cache, CacheEntry, CacheEntryOptions, CacheError};

/// Cache stored as one file per entry under `root/<first hex char>/<key>.bin`.
///
/// An entry expires `ttl` after it was written; reading it only refreshes the
/// access time.
pub struct FileCache {
    root: PathBuf,
    ttl: Duration,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { root: root.into(), ttl }
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        let bucket = key.get(..1).unwrap_or("_");
        self.root.join(bucket).join(format!("{key}.bin"))
    }

    fn is_stale(&self, modified: SystemTime) -> bool {
        match modified.elapsed() {
            Ok(age) => age > self.ttl,
            Err(_) => false,
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-writer temporary file next to `path`.
fn tmp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("{}-{seq}.tmp", std::process::id()))
}

fn touch_accessed(path: &Path) -> std::io::Result<()> {
    File::open(path)?.set_times(FileTimes::new().set_accessed(SystemTime::now()))
}

#[async_trait]
impl Cache for FileCache {
    async fn get(
        &self,
        parts: &Parts,
        opts: &CacheEntryOptions,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(&cache_key(parts, opts));
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.is_stale(metadata.modified()?) {
            debug!(path = %path.display(), "removing stale cache file");
            tokio::fs::remove_file(&path).await?;
            return Ok(None);
        }
        let raw = tokio::fs::read(&path).await?;
        let touched = path.clone();
        let res = tokio::task::spawn_blocking(move || touch_accessed(&touched))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        if let Err(e) = res {
            warn!(path = %path.display(), error = %e, "failed to update cache file access time");
        }
        Ok(Some(CacheEntry::decode(&raw)?))
    }

    async fn set(
        &self,
        parts: &Parts,
        entry: &CacheEntry,
        opts: &CacheEntryOptions,
    ) -> Result<(), CacheError> {
        let path = self.entry_path(&cache_key(parts, opts));
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, entry.encode()?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}
