use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};

/// A request cookie reduced to its name and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    /// Parse the `name=value` pair at the start of a `Set-Cookie` header value.
    pub fn from_set_cookie(raw: &str) -> Option<Self> {
        let pair = raw.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, value.trim().trim_matches('"')))
    }
}

/// All cookies sent with a request, in header order.
pub fn request_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value.trim_matches('"')))
        })
        .collect()
}

/// Value of the first cookie called `name`, if present and not empty.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    request_cookies(headers)
        .into_iter()
        .find(|c| c.name == name)
        .map(|c| c.value)
        .filter(|v| !v.is_empty())
}

fn write_cookies(headers: &mut HeaderMap, cookies: &[Cookie]) {
    headers.remove(COOKIE);
    if cookies.is_empty() {
        return;
    }
    let joined = cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ");
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(COOKIE, value);
    }
}

/// Remove every cookie called `name`.
pub fn delete_cookie(headers: &mut HeaderMap, name: &str) {
    let remaining: Vec<_> = request_cookies(headers)
        .into_iter()
        .filter(|c| c.name != name)
        .collect();
    write_cookies(headers, &remaining);
}

pub fn add_cookie(headers: &mut HeaderMap, cookie: &Cookie) {
    let mut cookies = request_cookies(headers);
    cookies.push(cookie.clone());
    write_cookies(headers, &cookies);
}

/// Rename cookie `from` to `to`, dropping any cookie already called `to`.
///
/// Returns `false` when the request carries no `from` cookie.
pub fn rename_cookie(headers: &mut HeaderMap, from: &str, to: &str) -> bool {
    let cookies = request_cookies(headers);
    if !cookies.iter().any(|c| c.name == from) {
        return false;
    }
    let renamed: Vec<_> = cookies
        .into_iter()
        .filter(|c| c.name != to)
        .map(|c| if c.name == from { Cookie::new(to, c.value) } else { c })
        .collect();
    write_cookies(headers, &renamed);
    true
}

/// Cookies set by a response, one per `Set-Cookie` header.
pub fn response_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(Cookie::from_set_cookie)
        .collect()
}

/// Rewrite the cookie name of a raw `Set-Cookie` value, keeping its attributes.
pub fn rename_set_cookie(raw: &str, new_name: &str) -> String {
    match raw.split_once('=') {
        Some((_, rest)) => format!("{new_name}={rest}"),
        None => raw.to_string(),
    }
}
