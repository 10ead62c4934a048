use thiserror::Error;

/// Errors that can occur in the gateway
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("Guard error: {0}")]
    Guard(#[from] crate::guard::GuardError),

    #[error("State file error: {0}")]
    State(String),

    #[error("No services configured")]
    NoServices,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
