use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, HOST, LOCATION};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::proxy::client_pool::HttpClient;
use crate::proxy::http_result::{HttpError, HttpResult};

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Fully read backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Remove hop-by-hop headers, including the ones listed in `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Normalize `rest` into an absolute path: empty and `.` segments are dropped,
/// `..` removes the previous segment and never climbs above the root.
pub fn clean_path(rest: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Backend URI of a request: the request path without the service path, appended to
/// the internal URL, with the original query.
pub fn backend_uri(internal_url: &str, service_path: &str, uri: &Uri) -> HttpResult<Uri> {
    let rest = uri.path().strip_prefix(service_path).ok_or(HttpError::InvalidPath)?;
    let mut target = format!("{}{}", internal_url.trim_end_matches('/'), clean_path(rest));
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    target.parse::<Uri>().map_err(|e| HttpError::InvalidUri(e.to_string()))
}

/// Point redirects issued by the backend to the public URL of the service.
pub fn rewrite_location(headers: &mut HeaderMap, internal_url: &str, external_url: &str) {
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let internal = internal_url.trim_end_matches('/');
    let Some(rest) = location.strip_prefix(internal) else {
        return;
    };
    let rewritten = format!("{}{}", external_url.trim_end_matches('/'), rest);
    debug!(from = %location, to = %rewritten, "rewriting backend redirect");
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}

/// Send a request to the backend and read the whole response.
pub async fn forward(
    client: &HttpClient,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> HttpResult<BackendResponse> {
    remove_hop_by_hop_headers(&mut headers);
    headers.remove(HOST);

    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(body))
        .map_err(|e| HttpError::FailedToGenerateUpstreamRequest(e.to_string()))?;
    *req.headers_mut() = headers;

    let timeout_secs = timeout.as_secs();
    let resp = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| HttpError::BackendTimeout(timeout_secs))?
        .map_err(|e| HttpError::FailedToGetResponseFromBackend(e.to_string()))?;

    let (parts, body) = resp.into_parts();
    let body = tokio::time::timeout(timeout, body.collect())
        .await
        .map_err(|_| HttpError::BackendTimeout(timeout_secs))?
        .map_err(|e| HttpError::FailedToGetResponseFromBackend(e.to_string()))?
        .to_bytes();

    let mut headers = parts.headers;
    remove_hop_by_hop_headers(&mut headers);
    Ok(BackendResponse { status: parts.status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/query//x/"), "/query/x");
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("/../../etc"), "/etc");
    }

    #[test]
    fn test_backend_uri() {
        let uri: Uri = "/service/1/treq/api/search?q=dog&lang=en".parse().unwrap();
        let target = backend_uri("http://10.0.0.2:8000/treq/", "/service/1/treq", &uri).unwrap();
        assert_eq!(target.to_string(), "http://10.0.0.2:8000/treq/api/search?q=dog&lang=en");

        let other: Uri = "/service/2/kwords/x".parse().unwrap();
        assert!(matches!(
            backend_uri("http://10.0.0.2:8000", "/service/1/treq", &other),
            Err(HttpError::InvalidPath)
        ));
    }

    #[test]
    fn test_rewrite_location() {
        let mut h = HeaderMap::new();
        h.insert(LOCATION, HeaderValue::from_static("http://10.0.0.2:8000/treq/login?next=x"));
        rewrite_location(&mut h, "http://10.0.0.2:8000/treq", "https://api.example.org/treq");
        assert_eq!(h[LOCATION], "https://api.example.org/treq/login?next=x");

        let mut h = HeaderMap::new();
        h.insert(LOCATION, HeaderValue::from_static("https://elsewhere.org/"));
        rewrite_location(&mut h, "http://10.0.0.2:8000/treq", "https://api.example.org/treq");
        assert_eq!(h[LOCATION], "https://elsewhere.org/");
    }

    #[test]
    fn test_hop_by_hop_removed() {
        let mut h = HeaderMap::new();
        h.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        h.insert("x-private", HeaderValue::from_static("1"));
        h.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        h.insert("x-api-user", HeaderValue::from_static("7"));
        remove_hop_by_hop_headers(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key("x-api-user"));
    }
}
