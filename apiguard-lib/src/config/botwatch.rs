use serde::Deserialize;

/// Bot detection parameters
///
/// A client is considered bot-like when at least `num_requests_threshold` requests
/// arrive within `watched_time_window_secs` and the relative standard deviation of the
/// gaps between them stays at or below `rsd_threshold`.
#[derive(Debug, Deserialize, Clone)]
pub struct BotwatchConfig {
    /// Time window in which client activity is evaluated
    /// Default: 120
    #[serde(default = "default_window")]
    pub watched_time_window_secs: u64,
    /// Number of requests within the window needed to flag a client
    /// Default: 20
    #[serde(default = "default_num_requests")]
    pub num_requests_threshold: u64,
    /// Coefficient of variation of request gaps considered bot-like
    /// Default: 0.1
    #[serde(default = "default_rsd")]
    pub rsd_threshold: f64,
    /// Capacity of the observation queue
    /// Default: 1024
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl BotwatchConfig {
    /// Longest gap in seconds that still contributes to the statistics.
    pub fn max_gap_secs(&self) -> f64 {
        self.watched_time_window_secs as f64 / self.num_requests_threshold.max(1) as f64
    }
}

impl Default for BotwatchConfig {
    fn default() -> Self {
        Self {
            watched_time_window_secs: default_window(),
            num_requests_threshold: default_num_requests(),
            rsd_threshold: default_rsd(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_window() -> u64 {
    120
}

fn default_num_requests() -> u64 {
    20
}

fn default_rsd() -> f64 {
    0.1
}

fn default_queue_capacity() -> usize {
    1024
}
