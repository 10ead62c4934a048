use http::request::Parts;
use http::Method;
use sha2::{Digest, Sha256};

use super::CacheEntryOptions;
use crate::proxy::cookies::request_cookies;

/// Hex SHA-256 fingerprint of a request.
///
/// Covers method, path, query (pairs sorted by name), the allow-listed cookies as
/// sorted `name=value` pairs joined by `;`, the tag and, for cacheable POST
/// requests, the body. Identical inputs always give the same key.
pub fn cache_key(parts: &Parts, opts: &CacheEntryOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.method.as_str().as_bytes());
    hasher.update(parts.uri.path().as_bytes());
    hasher.update(sorted_query(parts.uri.query().unwrap_or("")).as_bytes());

    let mut cookies: Vec<String> = request_cookies(&parts.headers)
        .into_iter()
        .filter(|c| opts.respect_cookies.iter().any(|name| *name == c.name))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    cookies.sort();
    hasher.update(cookies.join(";").as_bytes());

    if let Some(tag) = &opts.tag {
        hasher.update(tag.as_bytes());
    }
    if opts.cacheable_post && parts.method == Method::POST {
        hasher.update(&opts.request_body);
    }
    hex::encode(hasher.finalize())
}

fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    form_urlencoded::Serializer::new(String::new()).extend_pairs(pairs).finish()
}
