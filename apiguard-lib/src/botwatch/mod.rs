//! Statistical bot detection.
//!
//! Regular, machine-like request series are recognised by the relative standard
//! deviation of the gaps between subsequent requests of one client.

mod stats;
mod watchdog;

pub use stats::{IpProcData, IpStats};
pub use watchdog::{analyze, should_flag, should_reset, Analysis, Watchdog};
