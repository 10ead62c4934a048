#![forbid(unsafe_code)]

pub mod botwatch;
pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod guard;
pub mod proxy;
pub mod security;
pub mod session;
pub mod storage;
pub mod telemetry;

pub use config::{load_from_path, Config};
pub use error::{ProxyError, Result};
pub use proxy::{run, CoreProxy, ProxyContext, ServerOptions};
