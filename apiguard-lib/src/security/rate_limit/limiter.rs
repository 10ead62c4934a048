use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::warn;

use crate::config::Limit;

/// Token buckets keyed by client IP.
pub struct ClientRateLimiter {
    quota: Option<Quota>,
    limit: Option<Limit>,
    limiters: Mutex<AHashMap<String, Arc<DefaultDirectRateLimiter>>>,
}

impl ClientRateLimiter {
    /// Build a limiter from the configured limits. Only the first limit is applied,
    /// an empty list disables limiting.
    pub fn new(limits: &[Limit]) -> Self {
        let limit = limits.first().copied();
        Self { quota: limit.as_ref().and_then(quota_for), limit, limiters: Mutex::new(AHashMap::new()) }
    }

    pub fn is_enabled(&self) -> bool {
        self.quota.is_some()
    }

    pub fn limit(&self) -> Option<&Limit> {
        self.limit.as_ref()
    }

    /// Take one token from the bucket of `ip`. Never blocks.
    pub fn allow(&self, ip: &str) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        let limiter = match self.limiters.lock() {
            Ok(mut guard) => Arc::clone(
                guard
                    .entry(ip.to_string())
                    .or_insert_with(|| Arc::new(RateLimiter::direct(quota))),
            ),
            Err(_) => {
                warn!("Client rate limiter lock poisoned");
                return true;
            }
        };
        limiter.check().is_ok()
    }

    /// Number of clients with a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.limiters.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// Sustained rate in requests per second, rounded up, at least 1.
fn default_burst(limit: &Limit) -> u32 {
    let per_sec = f64::from(limit.req_per_time_threshold) / limit.req_checking_interval_secs as f64;
    (per_sec.ceil() as u32).max(1)
}

fn quota_for(limit: &Limit) -> Option<Quota> {
    if limit.req_per_time_threshold == 0 || limit.req_checking_interval_secs == 0 {
        return None;
    }
    let period = Duration::from_secs_f64(
        limit.req_checking_interval_secs as f64 / f64::from(limit.req_per_time_threshold),
    );
    let burst = match limit.burst_limit {
        0 => default_burst(limit),
        b => b,
    };
    Some(Quota::with_period(period)?.allow_burst(NonZeroU32::new(burst)?))
}
