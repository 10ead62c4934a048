use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

use super::botwatch::BotwatchConfig;
use super::cache::CacheConfig;
use super::service::ServiceConfig;
use super::telemetry::LoggingConfig;
use super::timeout::TimeoutConfig;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address and port to listen on
    /// Example: "0.0.0.0:8080" or "127.0.0.1:8080"
    pub listen: SocketAddr,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Timeout configuration
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// Response cache configuration
    /// Default: null backend (no caching)
    #[serde(default)]
    pub cache: CacheConfig,
    /// Bot detection thresholds used by the telemetry guard
    #[serde(default)]
    pub botwatch: BotwatchConfig,
    /// Accounts treated as anonymous even though they are valid users
    /// (shared application accounts used for fallback authentication)
    /// Default: empty
    #[serde(default)]
    pub anonymous_users: Vec<i64>,
    /// Where the request counter snapshot is stored on shutdown and reload
    /// Default: None (counters are kept in memory only)
    #[serde(default)]
    pub counter_state_path: Option<PathBuf>,
    /// Protected services, exposed as `/service/{index}/{type}`
    /// At least one service is required
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}
