use http::StatusCode;
use thiserror::Error;

/// HTTP result type, T is typically a hyper::Response
/// HttpError is used to generate a synthetic error response
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// Describes things that can go wrong while handling a proxied request
#[derive(Debug, Error, Clone)]
pub enum HttpError {
    #[error("Invalid path detected")]
    InvalidPath,

    #[error("Failed to read request body: {0}")]
    FailedToReadRequestBody(String),

    #[error("Failed to generate upstream request for backend: {0}")]
    FailedToGenerateUpstreamRequest(String),

    #[error("Failed to get response from backend: {0}")]
    FailedToGetResponseFromBackend(String),

    #[error("Backend did not respond within {0} s")]
    BackendTimeout(u64),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

impl From<HttpError> for StatusCode {
    fn from(e: HttpError) -> StatusCode {
        match e {
            HttpError::InvalidPath => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::FailedToReadRequestBody(_) => StatusCode::BAD_REQUEST,
            HttpError::FailedToGenerateUpstreamRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::FailedToGetResponseFromBackend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::BackendTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::InvalidUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
