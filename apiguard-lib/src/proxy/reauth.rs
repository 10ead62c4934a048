//! Re-authentication against the central login endpoint.
//!
//! When a guard rejects a request with 401 and the service has fallback credentials,
//! the proxy logs in with the shared application token and retries the request with
//! the obtained session cookie. Concurrent rejections share a single login call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::LoginConfig;
use crate::proxy::client_pool::HttpClient;
use crate::proxy::cookies::Cookie;

/// First message of a login response rejecting the token.
pub const INVALID_CREDENTIALS_MSG: &str = "Invalid credentials";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReauthError {
    #[error("no fallback credentials configured")]
    NotConfigured,

    #[error("login rejected the credentials")]
    InvalidCredentials,

    #[error("login response does not set the {0} cookie")]
    MissingCookie(String),

    #[error("login endpoint responded with status {0}")]
    Status(u16),

    #[error("login request failed: {0}")]
    Request(String),

    #[error("login endpoint did not respond within {0} s")]
    Timeout(u64),

    #[error("failed to decode login response: {0}")]
    Decode(String),
}

/// Deduplicates concurrent calls sharing a key.
///
/// Callers arriving while a call for the same key is in flight wait for it and get
/// a clone of its result. The key is forgotten once the call completes.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self { calls: Mutex::new(HashMap::new()) }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        let value = cell.get_or_init(call).await.clone();

        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            calls.remove(key);
        }
        value
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Decoded answer of the login endpoint.
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub status: StatusCode,
    pub messages: Vec<String>,
    pub cookies: Vec<Cookie>,
    /// `Set-Cookie` values as sent by the endpoint
    pub raw_set_cookies: Vec<String>,
}

impl LoginResponse {
    pub fn message(&self) -> &str {
        self.messages.first().map(String::as_str).unwrap_or("")
    }

    pub fn is_rejected(&self) -> bool {
        self.message() == INVALID_CREDENTIALS_MSG
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name && !c.value.is_empty())
    }
}

/// Client of the form-based login endpoint of a service.
pub struct LoginClient {
    client: HttpClient,
    conf: LoginConfig,
    backend_cookie: String,
    timeout: Duration,
}

impl LoginClient {
    pub fn new(
        client: HttpClient,
        conf: LoginConfig,
        backend_cookie: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self { client, conf, backend_cookie: backend_cookie.into(), timeout }
    }

    pub fn conf(&self) -> &LoginConfig {
        &self.conf
    }

    pub fn backend_cookie(&self) -> &str {
        &self.backend_cookie
    }

    pub fn has_fallback(&self) -> bool {
        self.conf.fallback_token.is_some()
    }

    /// Post `token` to the login endpoint.
    ///
    /// Rejected credentials are not an error here, see [`LoginResponse::is_rejected`].
    pub async fn login_with_token(&self, token: &str) -> Result<LoginResponse, ReauthError> {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair(&self.conf.token_field, token)
            .finish();
        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.conf.url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form)))
            .map_err(|e| ReauthError::Request(e.to_string()))?;

        let timeout_secs = self.timeout.as_secs();
        let resp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| ReauthError::Timeout(timeout_secs))?
            .map_err(|e| ReauthError::Request(e.to_string()))?;
        let (parts, body) = resp.into_parts();
        let body = tokio::time::timeout(self.timeout, body.collect())
            .await
            .map_err(|_| ReauthError::Timeout(timeout_secs))?
            .map_err(|e| ReauthError::Request(e.to_string()))?
            .to_bytes();

        let messages: Vec<String> = if body.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&body).map_err(|e| ReauthError::Decode(e.to_string()))?
        };
        let raw_set_cookies: Vec<String> = parts
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let cookies = raw_set_cookies.iter().filter_map(|raw| Cookie::from_set_cookie(raw)).collect();

        debug!(status = %parts.status, messages = ?messages, "login endpoint responded");
        Ok(LoginResponse { status: parts.status, messages, cookies, raw_set_cookies })
    }

    /// Log in with the fallback token and return the backend session cookie it yields.
    pub async fn fallback_cookie(&self) -> Result<Cookie, ReauthError> {
        let token = self.conf.fallback_token.as_deref().ok_or(ReauthError::NotConfigured)?;
        let resp = self.login_with_token(token).await?;
        if resp.is_rejected() {
            warn!(url = %self.conf.url, "fallback credentials rejected");
            return Err(ReauthError::InvalidCredentials);
        }
        if !resp.status.is_success() {
            return Err(ReauthError::Status(resp.status.as_u16()));
        }
        let cookie = resp
            .cookie(&self.backend_cookie)
            .cloned()
            .ok_or_else(|| ReauthError::MissingCookie(self.backend_cookie.clone()))?;
        info!(cookie = %cookie.name, "obtained fallback session");
        Ok(cookie)
    }
}
