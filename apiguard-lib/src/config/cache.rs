use serde::Deserialize;
use std::path::PathBuf;

/// Storage used for cached backend responses
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Null,
    Memory,
    File,
    Redis,
}

/// Response cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Backend: "null", "memory", "file" or "redis"
    /// Default: "null"
    #[serde(default)]
    pub backend: CacheBackend,
    /// Lifetime of a cached response in seconds
    /// Default: 3600
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    /// Root directory of the file backend (required for "file")
    #[serde(default)]
    pub file_root: Option<PathBuf>,
    /// Redis connection (required for "redis")
    #[serde(default)]
    pub redis: Option<RedisCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { backend: CacheBackend::Null, ttl_secs: default_ttl(), file_root: None, redis: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisCacheConfig {
    /// "host" or "host:port", port 6379 is used when omitted
    pub address: String,
    /// Database index
    /// Default: 0
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ttl() -> u64 {
    3600
}
