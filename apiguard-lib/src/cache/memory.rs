use std::sync::RwLock;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use async_trait::async_trait;
use http::request::Parts;
use tracing::warn;

use super::{cache_key, Cache, CacheEntry, CacheEntryOptions, CacheError};

/// In-process cache; expired entries are dropped when read.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<AHashMap<String, (Instant, CacheEntry)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: RwLock::new(AHashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(
        &self,
        parts: &Parts,
        opts: &CacheEntryOptions,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let key = cache_key(parts, opts);
        {
            let Ok(guard) = self.entries.read() else {
                warn!("memory cache lock poisoned");
                return Ok(None);
            };
            match guard.get(&key) {
                None => return Ok(None),
                Some((stored_at, entry)) if stored_at.elapsed() <= self.ttl => {
                    return Ok(Some(entry.clone()))
                }
                Some(_) => {}
            }
        }
        // expired
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(&key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        parts: &Parts,
        entry: &CacheEntry,
        opts: &CacheEntryOptions,
    ) -> Result<(), CacheError> {
        let key = cache_key(parts, opts);
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(key, (Instant::now(), entry.clone()));
        }
        Ok(())
    }
}
