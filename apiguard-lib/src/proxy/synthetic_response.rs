use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::Response;

use crate::config::Limit;

pub type RespBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> RespBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Clients talking JSON (or event streams) get JSON error bodies.
pub fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v.starts_with("application/json") || v.starts_with("text/event-stream")
        })
        .unwrap_or(false)
}

/// Build an error response with a 4xx or 5xx status
pub fn synthetic_error_response(
    status: StatusCode,
    message: &str,
    json: bool,
) -> Response<RespBody> {
    let (body, content_type) = if json {
        let body = serde_json::json!({ "error": message }).to_string();
        (body, "application/json")
    } else {
        (message.to_string(), "text/plain; charset=utf-8")
    };
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// Error response for a client over its rate limit
pub fn too_many_requests_response(limit: Option<&Limit>, json: bool) -> Response<RespBody> {
    let status = StatusCode::TOO_MANY_REQUESTS;
    let mut resp =
        synthetic_error_response(status, status.canonical_reason().unwrap_or("Too Many Requests"), json);
    if let Some(limit) = limit {
        resp.headers_mut().insert(
            hyper::header::HeaderName::from_static("x-rate-limit-limit"),
            HeaderValue::from(limit.req_per_time_threshold),
        );
        resp.headers_mut().insert(
            hyper::header::HeaderName::from_static("x-rate-limit-remaining"),
            HeaderValue::from_static("0"),
        );
        resp.headers_mut().insert(
            hyper::header::HeaderName::from_static("x-rate-limit-reset"),
            HeaderValue::from(limit.req_checking_interval_secs),
        );
    }
    resp
}
