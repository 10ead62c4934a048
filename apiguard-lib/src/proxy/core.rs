use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache::{should_read_from_cache, should_write_to_cache, Cache, CacheEntry, CacheEntryOptions};
use crate::common::UserId;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::guard::{build_guard, Guard, ReqEvaluation};
use crate::proxy::client_pool::ClientPool;
use crate::proxy::context::ProxyContext;
use crate::proxy::cookies::{add_cookie, cookie_value, delete_cookie, rename_cookie, rename_set_cookie, Cookie};
use crate::proxy::forwarding::{backend_uri, forward, rewrite_location};
use crate::proxy::http_result::HttpError;
use crate::proxy::reauth::{LoginClient, ReauthError, SingleFlight};
use crate::proxy::report::{ProxyProcReport, ReportSink, RequestInfo};
use crate::proxy::synthetic_response::{
    full_body, synthetic_error_response, too_many_requests_response, wants_json, RespBody,
};

pub const X_API_USER: HeaderName = HeaderName::from_static("x-api-user");
pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

const REAUTH_KEY: &str = "reauth";

/// Request lifecycle of one protected service: admission, throttling, cache,
/// identity remapping and forwarding to the backend.
pub struct CoreProxy {
    conf: ServiceConfig,
    service_path: String,
    guard: Arc<dyn Guard>,
    cache: Arc<dyn Cache>,
    pool: ClientPool,
    login: Option<LoginClient>,
    fallback_cookie: ArcSwapOption<Cookie>,
    reauth_flight: SingleFlight<std::result::Result<Arc<Cookie>, ReauthError>>,
    read_timeout: Duration,
    write_timeout: Duration,
    reports: Option<ReportSink>,
    counter: Option<mpsc::Sender<RequestInfo>>,
}

impl CoreProxy {
    /// Create the proxy of the service at position `index` of the configuration.
    pub fn new(index: usize, conf: ServiceConfig, ctx: &ProxyContext) -> Result<Self> {
        let service_path = conf.service_path(index);
        let guard = build_guard(&conf, &service_path, &ctx.guard_deps)?;
        let pool = ClientPool::new(&ctx.keep_alive, conf.idle_conn_timeout_secs);
        let login = conf.login.clone().map(|login| {
            LoginClient::new(
                pool.client().clone(),
                login,
                conf.backend_session_cookie.clone(),
                Duration::from_secs(conf.req_timeout_secs),
            )
        });
        debug!(
            service = %conf.service_type,
            path = %service_path,
            guard = %guard.guard_type(),
            "service proxy created"
        );
        Ok(Self {
            conf,
            service_path,
            guard,
            cache: ctx.cache.clone(),
            pool,
            login,
            fallback_cookie: ArcSwapOption::empty(),
            reauth_flight: SingleFlight::new(),
            read_timeout: ctx.read_timeout,
            write_timeout: ctx.write_timeout,
            reports: ctx.reports.clone(),
            counter: ctx.counter.clone(),
        })
    }

    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    pub fn service_type(&self) -> &str {
        &self.conf.service_type
    }

    pub fn guard(&self) -> &Arc<dyn Guard> {
        &self.guard
    }

    /// Session cookie of the shared account, once re-authentication succeeded.
    pub fn fallback_cookie(&self) -> Option<Arc<Cookie>> {
        self.fallback_cookie.load_full()
    }

    fn login_path(&self) -> Option<String> {
        self.login
            .as_ref()
            .filter(|l| l.conf().passthrough)
            .map(|_| format!("{}/login", self.service_path))
    }

    /// Dispatch a request addressed to this service.
    ///
    /// Requests not answered within the write timeout, throttling included, get 504.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<RespBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let json = wants_json(req.headers());
        match tokio::time::timeout(self.write_timeout, self.dispatch(req)).await {
            Ok(resp) => resp,
            Err(_) => {
                warn!(
                    service = %self.conf.service_type,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "request not answered within write timeout"
                );
                synthetic_error_response(StatusCode::GATEWAY_TIMEOUT, "request timed out", json)
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Response<RespBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let e = HttpError::FailedToReadRequestBody(e.to_string());
                return synthetic_error_response(e.clone().into(), &e.to_string(), wants_json(&parts.headers));
            }
        };
        if parts.method == Method::OPTIONS {
            return self.preflight(parts).await;
        }
        if parts.method == Method::POST && self.login_path().as_deref() == Some(parts.uri.path()) {
            return self.login(parts, body).await;
        }
        self.any_path(parts, body).await
    }

    /// Serve a request through the guard, the cache and the backend.
    pub async fn any_path(&self, parts: Parts, body: Bytes) -> Response<RespBody> {
        let started = Instant::now();
        let (resp, is_cached) = self.process(parts, body).await;
        self.report(started, resp.status(), is_cached);
        resp
    }

    async fn process(&self, mut parts: Parts, body: Bytes) -> (Response<RespBody>, bool) {
        let json = wants_json(&parts.headers);
        if !parts.uri.path().starts_with(&self.service_path) {
            let e = HttpError::InvalidPath;
            return (synthetic_error_response(e.clone().into(), &e.to_string(), json), false);
        }

        let (eval, reauth_error) = self.evaluate(&parts).await;
        if let Some(resp) = self.rejection(&eval, reauth_error, json) {
            return (resp, false);
        }

        if eval.requires_fallback_cookie {
            if let Some(cookie) = self.fallback_cookie.load_full() {
                delete_cookie(&mut parts.headers, &cookie.name);
                add_cookie(&mut parts.headers, &cookie);
            }
        }

        let user_id = match self.guard.determine_true_user_id(&parts).await {
            Ok(user_id) if user_id.is_valid() => user_id,
            Ok(_) => eval.client_id.user_id,
            Err(e) => {
                warn!(error = %e, client_ip = %eval.client_id.ip, "failed to determine true user id");
                eval.client_id.user_id
            }
        };

        let delay = match self.guard.calc_delay(&parts, &eval.client_id).await {
            Ok(delay) => delay,
            Err(e) => {
                error!(error = %e, client_ip = %eval.client_id.ip, "failed to calculate delay");
                let msg = format!("Failed to proxy request: {e}");
                return (synthetic_error_response(StatusCode::INTERNAL_SERVER_ERROR, &msg, json), false);
            }
        };
        if delay.delay >= self.read_timeout {
            warn!(
                client_ip = %eval.client_id.ip,
                delay_secs = delay.delay.as_secs_f64(),
                is_ban = delay.is_ban,
                "delay exceeds read timeout"
            );
            return (
                synthetic_error_response(StatusCode::SERVICE_UNAVAILABLE, "service overloaded", json),
                false,
            );
        }
        if !delay.delay.is_zero() {
            if let Err(e) = self.guard.log_applied_delay(&delay, &eval.client_id).await {
                warn!(error = %e, "failed to log applied delay");
            }
            debug!(client_ip = %eval.client_id.ip, delay_ms = delay.delay.as_millis() as u64, "delaying request");
            tokio::time::sleep(delay.delay).await;
        }

        self.remap_identity(&mut parts.headers, user_id);

        let opts = self.cache_options(&body);
        if should_read_from_cache(&parts, &opts) {
            match self.cache.get(&parts, &opts).await {
                Ok(Some(entry)) => {
                    debug!(path = %parts.uri.path(), "serving cached response");
                    self.count_request(user_id, &eval);
                    let resp = build_response(entry.status_code(), entry.header_map(), Bytes::from(entry.data));
                    return (resp, true);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache lookup failed"),
            }
        }

        let uri = match backend_uri(&self.conf.internal_url, &self.service_path, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => return (self.backend_error(e, json), false),
        };
        let timeout = Duration::from_secs(self.conf.req_timeout_secs);
        let backend = match forward(
            self.pool.client(),
            parts.method.clone(),
            uri,
            parts.headers.clone(),
            body,
            timeout,
        )
        .await
        {
            Ok(backend) => backend,
            Err(e) => return (self.backend_error(e, json), false),
        };

        let mut headers = backend.headers;
        if let Some(external_url) = &self.conf.external_url {
            rewrite_location(&mut headers, &self.conf.internal_url, external_url);
        }
        let entry = CacheEntry::new(backend.status, &headers, backend.body.clone());
        if should_write_to_cache(&parts, &entry, &opts) {
            if let Err(e) = self.cache.set(&parts, &entry, &opts).await {
                warn!(error = %e, "failed to store response in cache");
            }
        }
        self.count_request(user_id, &eval);
        (build_response(backend.status, headers, backend.body), false)
    }

    /// Evaluate the request, re-authenticating once when the guard answers 401,
    /// can serve the request with fallback credentials and those are configured.
    async fn evaluate(&self, parts: &Parts) -> (ReqEvaluation, Option<ReauthError>) {
        let fallback = self.fallback_cookie.load_full();
        let eval = self.guard.evaluate_request(parts, fallback.as_deref()).await;
        if eval.proposed_status != StatusCode::UNAUTHORIZED || !self.guard.accepts_fallback_cookie() {
            return (eval, None);
        }
        // a stored fallback session that was not used cannot change the outcome
        if fallback.is_some() && !eval.requires_fallback_cookie {
            return (eval, None);
        }
        let Some(login) = self.login.as_ref().filter(|l| l.has_fallback()) else {
            return (eval, None);
        };
        match self.reauthenticate(login).await {
            Ok(cookie) => (self.guard.evaluate_request(parts, Some(cookie.as_ref())).await, None),
            Err(e) => {
                warn!(error = %e, service = %self.conf.service_type, "re-authentication failed");
                (eval, Some(e))
            }
        }
    }

    async fn reauthenticate(&self, login: &LoginClient) -> std::result::Result<Arc<Cookie>, ReauthError> {
        self.reauth_flight
            .run(REAUTH_KEY, || async {
                let cookie = Arc::new(login.fallback_cookie().await?);
                self.fallback_cookie.store(Some(cookie.clone()));
                Ok(cookie)
            })
            .await
    }

    fn rejection(
        &self,
        eval: &ReqEvaluation,
        reauth_error: Option<ReauthError>,
        json: bool,
    ) -> Option<Response<RespBody>> {
        let status = eval.proposed_status;
        if let Some(e) = &eval.error {
            error!(error = %e, client_ip = %eval.client_id.ip, "request evaluation failed");
            return Some(synthetic_error_response(status, &format!("Failed to proxy request: {e}"), json));
        }
        if eval.is_admitted() {
            return None;
        }
        debug!(client_ip = %eval.client_id.ip, status = %status, "request rejected");
        let resp = match (status, reauth_error) {
            (StatusCode::TOO_MANY_REQUESTS, _) => too_many_requests_response(self.conf.limits.first(), json),
            (StatusCode::UNAUTHORIZED, Some(e)) => synthetic_error_response(status, &e.to_string(), json),
            (status, _) => synthetic_error_response(status, status.canonical_reason().unwrap_or(""), json),
        };
        Some(resp)
    }

    fn remap_identity(&self, headers: &mut HeaderMap, user_id: UserId) {
        let value = HeaderValue::from(user_id.0);
        headers.insert(X_API_USER, value.clone());
        if let Some(name) = &self.conf.true_user_id_header {
            match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => {
                    headers.insert(name, value);
                }
                Err(e) => warn!(header = %name, error = %e, "invalid true user id header name"),
            }
        }

        let frontend = &self.conf.external_session_cookie;
        let backend = &self.conf.backend_session_cookie;
        if self.conf.use_header_x_api_key {
            let session = cookie_value(headers, frontend).or_else(|| cookie_value(headers, backend));
            if let Some(value) = session.and_then(|s| HeaderValue::from_str(&s).ok()) {
                headers.insert(X_API_KEY, value);
            }
        } else if !frontend.is_empty() && rename_cookie(headers, frontend, backend) {
            debug!(from = %frontend, to = %backend, "session cookie renamed");
        }
    }

    fn cache_options(&self, body: &Bytes) -> CacheEntryOptions {
        let mut respect_cookies = Vec::new();
        if self.conf.caching_per_session {
            respect_cookies.push(self.conf.backend_session_cookie.clone());
            if !self.conf.external_session_cookie.is_empty() {
                respect_cookies.push(self.conf.external_session_cookie.clone());
            }
        }
        CacheEntryOptions {
            respect_cookies,
            request_body: if self.conf.cacheable_post { body.clone() } else { Bytes::new() },
            cacheable_post: self.conf.cacheable_post,
            tag: None,
        }
    }

    fn backend_error(&self, e: HttpError, json: bool) -> Response<RespBody> {
        error!(error = %e, service = %self.conf.service_type, "failed to proxy request");
        synthetic_error_response(e.clone().into(), &format!("Failed to proxy request: {e}"), json)
    }

    fn count_request(&self, user_id: UserId, eval: &ReqEvaluation) {
        let Some(counter) = &self.counter else {
            return;
        };
        let user_id = if self.guard.test_user_is_anonymous(user_id) { UserId::INVALID } else { user_id };
        let info = RequestInfo::new(self.conf.service_type.clone(), user_id, eval.client_id.ip.clone());
        if let Err(e) = counter.try_send(info) {
            debug!(error = %e, "request counter queue unavailable, dropping record");
        }
    }

    fn report(&self, started: Instant, status: StatusCode, is_cached: bool) {
        let Some(reports) = &self.reports else {
            return;
        };
        let report = ProxyProcReport {
            date_time: Utc::now(),
            proc_time: started.elapsed().as_secs_f64(),
            status: status.as_u16(),
            service: self.conf.service_type.clone(),
            is_cached,
        };
        if reports.send(report).is_err() {
            debug!("report sink closed");
        }
    }

    /// Answer a CORS preflight: `204` with an empty JSON object when the guard admits
    /// the request.
    pub async fn preflight(&self, parts: Parts) -> Response<RespBody> {
        let json = wants_json(&parts.headers);
        let (eval, reauth_error) = self.evaluate(&parts).await;
        if let Some(resp) = self.rejection(&eval, reauth_error, json) {
            return resp;
        }
        let mut resp = Response::new(full_body("{}"));
        *resp.status_mut() = StatusCode::NO_CONTENT;
        resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }

    /// Pass a login form through to the login endpoint and hand the obtained
    /// backend session to the client under the frontend cookie name.
    pub async fn login(&self, parts: Parts, body: Bytes) -> Response<RespBody> {
        let Some(login) = self.login.as_ref().filter(|l| l.conf().passthrough) else {
            return synthetic_error_response(StatusCode::NOT_FOUND, "Not Found", true);
        };
        let token_field = &login.conf().token_field;
        let token = form_urlencoded::parse(&body)
            .find(|(name, _)| name == token_field.as_str())
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty());
        let Some(token) = token else {
            return synthetic_error_response(
                StatusCode::BAD_REQUEST,
                &format!("missing {token_field}"),
                true,
            );
        };

        let resp = match login.login_with_token(&token).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "failed to perform login");
                return synthetic_error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Failed to proxy request: {e}"),
                    true,
                );
            }
        };
        if resp.is_rejected() {
            warn!(path = %parts.uri.path(), "login rejected, invalid credentials");
            return synthetic_error_response(StatusCode::UNAUTHORIZED, resp.message(), true);
        }

        let frontend = &self.conf.external_session_cookie;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (raw, cookie) in resp.raw_set_cookies.iter().filter_map(|raw| {
            Cookie::from_set_cookie(raw).map(|cookie| (raw, cookie))
        }) {
            let value = if cookie.name == login.backend_cookie() && !frontend.is_empty() {
                debug!(backend_cookie = %cookie.name, frontend_cookie = %frontend, "mapping login cookie");
                rename_set_cookie(raw, frontend)
            } else {
                raw.clone()
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(SET_COOKIE, value);
            }
        }
        let body = serde_json::Value::String(resp.message().to_string()).to_string();
        build_response(StatusCode::OK, headers, Bytes::from(body))
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<RespBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::session::SessionType;

    fn service(frontend: &str, x_api_key: bool) -> ServiceConfig {
        ServiceConfig {
            service_type: "kontext".to_string(),
            internal_url: "http://127.0.0.1:1/api".to_string(),
            external_url: None,
            external_session_cookie: frontend.to_string(),
            backend_session_cookie: "cnc_toolbar_sid".to_string(),
            session_type: SessionType::Cnc,
            use_header_x_api_key: x_api_key,
            true_user_id_header: Some("X-Kontext-User".to_string()),
            limits: vec![],
            req_timeout_secs: 1,
            idle_conn_timeout_secs: 1,
            caching_per_session: true,
            cacheable_post: false,
            guard: GuardConfig::Null,
            login: None,
        }
    }

    fn cookie_headers(cookie: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        h
    }

    #[tokio::test]
    async fn test_remap_renames_frontend_cookie() {
        let proxy = CoreProxy::new(0, service("front_sid", false), &ProxyContext::default()).unwrap();
        let mut h = cookie_headers("front_sid=a-b; other=1");
        proxy.remap_identity(&mut h, UserId(42));
        assert_eq!(h[X_API_USER], "42");
        assert_eq!(h["x-kontext-user"], "42");
        assert_eq!(cookie_value(&h, "cnc_toolbar_sid").as_deref(), Some("a-b"));
        assert_eq!(cookie_value(&h, "front_sid"), None);
    }

    #[tokio::test]
    async fn test_remap_uses_api_key_header() {
        let proxy = CoreProxy::new(0, service("front_sid", true), &ProxyContext::default()).unwrap();
        let mut h = cookie_headers("front_sid=a-b");
        proxy.remap_identity(&mut h, UserId::INVALID);
        assert_eq!(h[X_API_USER], "-1");
        assert_eq!(h[X_API_KEY], "a-b");
    }

    #[tokio::test]
    async fn test_cache_options_follow_service() {
        let proxy = CoreProxy::new(3, service("front_sid", false), &ProxyContext::default()).unwrap();
        assert_eq!(proxy.service_path(), "/service/3/kontext");
        let opts = proxy.cache_options(&Bytes::from_static(b"q=1"));
        assert_eq!(opts.respect_cookies, vec!["cnc_toolbar_sid", "front_sid"]);
        assert!(opts.request_body.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let proxy = CoreProxy::new(0, service("", false), &ProxyContext::default()).unwrap();
        let (parts, _) = Request::builder().uri("/service/1/treq/x").body(()).unwrap().into_parts();
        let resp = proxy.any_path(parts, Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Invalid path detected");
    }
}
