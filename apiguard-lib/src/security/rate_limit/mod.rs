//! Per-client rate limiting.
//!
//! Every client IP gets its own GCRA token bucket (`governor`), created on first
//! sight and kept for the lifetime of the guard. The bucket refills one token every
//! `req_checking_interval_secs / req_per_time_threshold` seconds and holds at most
//! `burst_limit` tokens.
//!
//! ```toml
//! [[services.limits]]
//! req_per_time_threshold = 100
//! req_checking_interval_secs = 60
//! burst_limit = 20
//! ```

mod limiter;

pub use limiter::ClientRateLimiter;
