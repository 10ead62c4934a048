//! Backend response cache.
//!
//! Entries are addressed by a fingerprint of the request (see [`cache_key`]) and
//! expire after a fixed TTL. Cache failures never fail a request, callers log them
//! and carry on as with a miss.

mod file;
mod fingerprint;
mod memory;
mod null;
mod redis;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CACHE_CONTROL;
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CacheBackend, CacheConfig};

pub use file::FileCache;
pub use fingerprint::cache_key;
pub use memory::MemoryCache;
pub use null::NullCache;
pub use self::redis::{redis_address, RedisCache, WriteOp, WriteQueue, WRITE_QUEUE_CAPACITY};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode cache entry: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Redis cache write queue full")]
    QueueFull,

    #[error("Redis cache writer stopped")]
    QueueClosed,

    #[error("cache misconfigured: {0}")]
    Config(String),
}

/// A stored backend response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub data: Vec<u8>,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: &HeaderMap, data: Bytes) -> Self {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                map.entry(name.as_str().to_string()).or_default().push(value.to_string());
            }
        }
        Self { status: status.as_u16(), headers: map, data: data.to_vec() }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CacheError> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// Request properties taken into account by the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheEntryOptions {
    /// Cookies whose values become part of the cache key
    pub respect_cookies: Vec<String>,
    pub request_body: Bytes,
    pub cacheable_post: bool,
    /// Extra discriminator of the cache key
    pub tag: Option<String>,
}

pub fn should_read_from_cache(parts: &Parts, opts: &CacheEntryOptions) -> bool {
    let method_ok = parts.method == Method::GET || (opts.cacheable_post && parts.method == Method::POST);
    let no_cache = parts
        .headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("no-cache"))
        .unwrap_or(false);
    method_ok && !no_cache
}

pub fn should_write_to_cache(parts: &Parts, entry: &CacheEntry, opts: &CacheEntryOptions) -> bool {
    should_read_from_cache(parts, opts) && (entry.status == 200 || entry.status == 201)
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(
        &self,
        parts: &Parts,
        opts: &CacheEntryOptions,
    ) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(
        &self,
        parts: &Parts,
        entry: &CacheEntry,
        opts: &CacheEntryOptions,
    ) -> Result<(), CacheError>;
}

/// Create the configured cache backend.
pub async fn build_cache(conf: &CacheConfig) -> Result<Arc<dyn Cache>, CacheError> {
    let ttl = Duration::from_secs(conf.ttl_secs);
    let cache: Arc<dyn Cache> = match conf.backend {
        CacheBackend::Null => Arc::new(NullCache),
        CacheBackend::Memory => Arc::new(MemoryCache::new(ttl)),
        CacheBackend::File => {
            let root = conf
                .file_root
                .clone()
                .ok_or_else(|| CacheError::Config("file cache requires file_root".to_string()))?;
            Arc::new(FileCache::new(root, ttl))
        }
        CacheBackend::Redis => {
            let redis_conf = conf
                .redis
                .as_ref()
                .ok_or_else(|| CacheError::Config("redis cache requires [cache.redis]".to_string()))?;
            Arc::new(RedisCache::connect(redis_conf, ttl).await?)
        }
    };
    Ok(cache)
}
