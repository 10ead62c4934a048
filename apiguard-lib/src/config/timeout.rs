use serde::Deserialize;

/// Timeout configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Server read timeout in seconds
    /// Throttling delays reaching this value are answered with 503
    /// Default: 10
    #[serde(default = "default_read_timeout")]
    pub read_secs: u64,
    /// Server write timeout in seconds
    /// Upper bound for handling a single request including throttling and the backend call
    /// Default: 30
    #[serde(default = "default_write_timeout")]
    pub write_secs: u64,
    /// Graceful shutdown timeout in seconds
    /// Default: 10
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_secs: u64,
    /// HTTP/1.1 keep-alive configuration
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: default_read_timeout(),
            write_secs: default_write_timeout(),
            shutdown_secs: default_shutdown_timeout(),
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

/// HTTP/1.1 keep-alive configuration for downstream connections
#[derive(Debug, Deserialize, Clone)]
pub struct KeepAliveConfig {
    /// Enable HTTP/1.1 keep-alive (persistent connections)
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TCP keep-alive interval for backend connections in seconds
    /// Default: 60
    #[serde(default = "default_keep_alive_timeout")]
    pub timeout_secs: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self { enabled: true, timeout_secs: default_keep_alive_timeout() }
    }
}

fn default_read_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_timeout() -> u64 {
    60
}
