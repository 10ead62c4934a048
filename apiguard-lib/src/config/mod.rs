mod botwatch;
mod cache;
mod loader;
mod root;
mod service;
mod telemetry;
mod timeout;

pub use botwatch::BotwatchConfig;
pub use cache::{CacheBackend, CacheConfig, RedisCacheConfig};
pub use loader::{load_from_path, validate_config};
pub use root::Config;
pub use service::{GuardConfig, Limit, LoginConfig, ServiceConfig, TokenEntry};
pub use telemetry::LoggingConfig;
pub use timeout::{KeepAliveConfig, TimeoutConfig};
