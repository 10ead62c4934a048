mod common;

use std::sync::Arc;
use std::time::Duration;

use apiguard_lib::cache::MemoryCache;
use apiguard_lib::common::{AnonymousUsers, UserId};
use apiguard_lib::config::{GuardConfig, LoginConfig, ServiceConfig, TokenEntry};
use apiguard_lib::guard::GuardDeps;
use apiguard_lib::proxy::{CoreProxy, ProxyContext};
use apiguard_lib::storage::MemoryUserFinder;
use bytes::Bytes;
use common::{json_response, service, spawn_server, TestResult};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::sync::mpsc;

fn login_response(messages: &str, set_cookie: Option<&str>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(200).header("content-type", "application/json");
    if let Some(cookie) = set_cookie {
        builder = builder.header("set-cookie", cookie);
    }
    builder
        .body(Full::new(Bytes::from(messages.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Backend echoing the forwarded session cookie and user id
fn echo_backend(parts: &http::request::Parts) -> Response<Full<Bytes>> {
    let cookie = parts.headers.get("cookie").and_then(|v| v.to_str().ok()).unwrap_or("");
    let user = parts.headers.get("x-api-user").and_then(|v| v.to_str().ok()).unwrap_or("");
    Response::builder()
        .status(200)
        .header("x-seen-user", user)
        .body(Full::new(Bytes::from(cookie.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn login_conf(url: String, fallback: Option<&str>, passthrough: bool) -> LoginConfig {
    LoginConfig {
        url,
        token_field: "personal_access_token".to_string(),
        fallback_token: fallback.map(str::to_string),
        passthrough,
    }
}

fn cnc_context(finder: Arc<MemoryUserFinder>) -> ProxyContext {
    let deps = GuardDeps {
        user_finder: Some(finder),
        telemetry: None,
        watchdog: None,
        anonymous_users: AnonymousUsers::default(),
    };
    ProxyContext { guard_deps: deps, ..ProxyContext::default() }
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "10.0.0.1")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|e| panic!("bad request: {e}"))
}

async fn body_string(resp: Response<apiguard_lib::proxy::synthetic_response::RespBody>) -> TestResult<String> {
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn cnc_service(backend: &str, login: LoginConfig) -> ServiceConfig {
    let mut svc = service("kontext", backend, GuardConfig::CncAuth);
    svc.login = Some(login);
    svc
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unauthorized_requests_share_one_login() -> TestResult<()> {
    let login = spawn_server(Duration::from_millis(200), |_| {
        login_response(r#"["OK"]"#, Some("cnc_toolbar_sid=shared-account; Path=/"))
    })
    .await?;
    let backend = spawn_server(Duration::ZERO, echo_backend).await?;

    let finder = Arc::new(MemoryUserFinder::new());
    finder.insert_cnc_session("shared-account", UserId(7));
    let svc = cnc_service(&backend.url("/api"), login_conf(login.url("/login"), Some("app-token"), false));
    let proxy = Arc::new(CoreProxy::new(0, svc, &cnc_context(finder))?);
    assert!(proxy.fallback_cookie().is_none());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let proxy = proxy.clone();
        tasks.spawn(async move { proxy.handle(get("/service/0/kontext/data")).await });
    }
    while let Some(resp) = tasks.join_next().await {
        let resp = resp?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-seen-user"], "7");
        assert_eq!(body_string(resp).await?, "cnc_toolbar_sid=shared-account");
    }

    assert_eq!(login.hits(), 1);
    assert_eq!(backend.hits(), 10);
    let cookie = proxy.fallback_cookie().ok_or("fallback cookie not stored")?;
    assert_eq!(cookie.value, "shared-account");

    // subsequent requests reuse the stored session
    let resp = proxy.handle(get("/service/0/kontext/more")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(login.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_fallback_credentials_answer_unauthorized() -> TestResult<()> {
    let login = spawn_server(Duration::ZERO, |_| login_response(r#"["Invalid credentials"]"#, None)).await?;
    let backend = spawn_server(Duration::ZERO, echo_backend).await?;

    let finder = Arc::new(MemoryUserFinder::new());
    let svc = cnc_service(&backend.url("/api"), login_conf(login.url("/login"), Some("bad-token"), false));
    let proxy = CoreProxy::new(0, svc, &cnc_context(finder))?;

    let resp = proxy.handle(get("/service/0/kontext/data")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_string(resp).await?, "login rejected the credentials");
    assert_eq!(backend.hits(), 0);
    assert!(proxy.fallback_cookie().is_none());
    Ok(())
}

#[tokio::test]
async fn test_cached_response_skips_backend() -> TestResult<()> {
    let backend = spawn_server(Duration::ZERO, |_| json_response(200, r#"{"items":[1,2]}"#)).await?;
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let (counter_tx, mut counter) = mpsc::channel(16);
    let ctx = ProxyContext::new(GuardDeps::default(), Arc::new(MemoryCache::new(Duration::from_secs(60))))
        .with_reports(report_tx)
        .with_counter(counter_tx);
    let proxy = CoreProxy::new(0, service("treq", &backend.url("/api"), GuardConfig::Null), &ctx)?;

    for _ in 0..2 {
        let resp = proxy.handle(get("/service/0/treq/items?page=1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/json");
        assert_eq!(body_string(resp).await?, r#"{"items":[1,2]}"#);
    }
    assert_eq!(backend.hits(), 1);

    let first = reports.recv().await.ok_or("missing report")?;
    let second = reports.recv().await.ok_or("missing report")?;
    assert!(!first.is_cached);
    assert!(second.is_cached);
    assert_eq!(second.service, "treq");
    assert_eq!(second.status, 200);

    for _ in 0..2 {
        let info = counter.recv().await.ok_or("missing request record")?;
        assert_eq!(info.service, "treq");
        assert_eq!(info.ip, "10.0.0.1");
    }
    Ok(())
}

#[tokio::test]
async fn test_post_is_not_cached_by_default() -> TestResult<()> {
    let backend = spawn_server(Duration::ZERO, |_| json_response(200, "{}")).await?;
    let ctx = ProxyContext::new(GuardDeps::default(), Arc::new(MemoryCache::new(Duration::from_secs(60))));
    let proxy = CoreProxy::new(0, service("treq", &backend.url("/api"), GuardConfig::Null), &ctx)?;

    for _ in 0..2 {
        let req = Request::builder()
            .method("POST")
            .uri("/service/0/treq/items")
            .body(Full::new(Bytes::from_static(b"q=1")))?;
        assert_eq!(proxy.handle(req).await.status(), StatusCode::OK);
    }
    assert_eq!(backend.hits(), 2);
    Ok(())
}

#[tokio::test]
async fn test_preflight_is_answered_locally() -> TestResult<()> {
    let backend = spawn_server(Duration::ZERO, |_| json_response(200, "{}")).await?;
    let proxy =
        CoreProxy::new(0, service("treq", &backend.url("/api"), GuardConfig::Null), &ProxyContext::default())?;
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/service/0/treq/items")
        .body(Full::new(Bytes::new()))?;
    let resp = proxy.handle(req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(backend.hits(), 0);
    Ok(())
}

#[tokio::test]
async fn test_login_passthrough_maps_session_cookie() -> TestResult<()> {
    let login = spawn_server(Duration::ZERO, |_| {
        login_response(r#"["Welcome"]"#, Some("cnc_toolbar_sid=abc-def; Path=/; HttpOnly"))
    })
    .await?;
    let mut svc = cnc_service("http://127.0.0.1:1/api", login_conf(login.url("/login"), None, true));
    svc.external_session_cookie = "kontext_sid".to_string();
    let proxy = CoreProxy::new(0, svc, &cnc_context(Arc::new(MemoryUserFinder::new())))?;

    let req = Request::builder()
        .method("POST")
        .uri("/service/0/kontext/login")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Full::new(Bytes::from_static(b"personal_access_token=user-token")))?;
    let resp = proxy.handle(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["set-cookie"], "kontext_sid=abc-def; Path=/; HttpOnly");
    assert_eq!(body_string(resp).await?, r#""Welcome""#);
    assert_eq!(login.hits(), 1);

    let missing = Request::builder()
        .method("POST")
        .uri("/service/0/kontext/login")
        .body(Full::new(Bytes::from_static(b"other=1")))?;
    assert_eq!(proxy.handle(missing).await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(login.hits(), 1);
    Ok(())
}

#[tokio::test]
async fn test_login_passthrough_rejects_invalid_token() -> TestResult<()> {
    let login = spawn_server(Duration::ZERO, |_| login_response(r#"["Invalid credentials"]"#, None)).await?;
    let svc = cnc_service("http://127.0.0.1:1/api", login_conf(login.url("/login"), None, true));
    let proxy = CoreProxy::new(0, svc, &cnc_context(Arc::new(MemoryUserFinder::new())))?;

    let req = Request::builder()
        .method("POST")
        .uri("/service/0/kontext/login")
        .body(Full::new(Bytes::from_static(b"personal_access_token=wrong")))?;
    let resp = proxy.handle(req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(body_string(resp).await?.contains("Invalid credentials"));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backend_answers_internal_error() -> TestResult<()> {
    let port = common::pick_free_port()?.port();
    let svc = service("treq", &format!("http://127.0.0.1:{port}/api"), GuardConfig::Null);
    let proxy = CoreProxy::new(0, svc, &ProxyContext::default())?;

    let resp = proxy.handle(get("/service/0/treq/x")).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(resp).await?.starts_with("Failed to proxy request"));
    Ok(())
}

#[tokio::test]
async fn test_sessionmap_serves_anonymous_requests_with_fallback_session() -> TestResult<()> {
    let login = spawn_server(Duration::ZERO, |_| {
        login_response(r#"["OK"]"#, Some("cnc_toolbar_sid=shared-account; Path=/"))
    })
    .await?;
    let backend = spawn_server(Duration::ZERO, echo_backend).await?;

    let finder = Arc::new(MemoryUserFinder::new());
    finder.insert_cnc_session("shared-account", UserId(7));
    let mut svc = service("kontext", &backend.url("/api"), GuardConfig::SessionMap { allow_anonymous: false });
    svc.login = Some(login_conf(login.url("/login"), Some("app-token"), false));
    let proxy = CoreProxy::new(0, svc, &cnc_context(finder))?;

    for _ in 0..3 {
        let resp = proxy.handle(get("/service/0/kontext/data")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-seen-user"], "7");
        assert_eq!(body_string(resp).await?, "cnc_toolbar_sid=shared-account");
    }
    assert_eq!(login.hits(), 1);
    assert_eq!(backend.hits(), 3);

    // a session of an unknown user is not replaced by the fallback session
    let forged = Request::builder()
        .uri("/service/0/kontext/data")
        .header("cookie", "cnc_toolbar_sid=someone-else")
        .body(Full::new(Bytes::new()))?;
    assert_eq!(proxy.handle(forged).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(login.hits(), 1);
    assert_eq!(backend.hits(), 3);
    Ok(())
}

#[tokio::test]
async fn test_token_guard_never_triggers_login() -> TestResult<()> {
    let login = spawn_server(Duration::ZERO, |_| {
        login_response(r#"["OK"]"#, Some("cnc_toolbar_sid=shared-account; Path=/"))
    })
    .await?;
    let guard = GuardConfig::Token {
        header: "X-Api-Key".to_string(),
        tokens: vec![TokenEntry {
            value: "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08".to_string(),
            user_id: 7,
        }],
        excluded_paths: vec![],
    };
    let mut svc = service("treq", "http://127.0.0.1:1/api", guard);
    svc.login = Some(login_conf(login.url("/login"), Some("app-token"), false));
    let proxy = CoreProxy::new(0, svc, &ProxyContext::default())?;

    let resp = proxy.handle(get("/service/0/treq/x")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(login.hits(), 0);
    assert!(proxy.fallback_cookie().is_none());
    Ok(())
}

#[tokio::test]
async fn test_cached_response_per_session() -> TestResult<()> {
    let backend = spawn_server(Duration::ZERO, echo_backend).await?;
    let finder = Arc::new(MemoryUserFinder::new());
    finder.insert_cnc_session("alice-pw", UserId(5));
    finder.insert_cnc_session("bob-pw", UserId(6));
    let (report_tx, mut reports) = mpsc::unbounded_channel();
    let ctx = ProxyContext {
        cache: Arc::new(MemoryCache::new(Duration::from_secs(60))),
        ..cnc_context(finder)
    }
    .with_reports(report_tx);
    let mut svc = service("kontext", &backend.url("/api"), GuardConfig::CncAuth);
    svc.caching_per_session = true;
    let proxy = CoreProxy::new(0, svc, &ctx)?;

    let with_session = |session: &str| {
        Request::builder()
            .uri("/service/0/kontext/data")
            .header("cookie", format!("cnc_toolbar_sid={session}"))
            .body(Full::new(Bytes::new()))
    };
    for _ in 0..2 {
        let resp = proxy.handle(with_session("alice-pw")?).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await?, "cnc_toolbar_sid=alice-pw");
    }
    let resp = proxy.handle(with_session("bob-pw")?).await;
    assert_eq!(body_string(resp).await?, "cnc_toolbar_sid=bob-pw");
    assert_eq!(backend.hits(), 2);

    let cached: Vec<bool> = [reports.recv().await, reports.recv().await, reports.recv().await]
        .into_iter()
        .map(|r| r.map(|r| r.is_cached))
        .collect::<Option<_>>()
        .ok_or("missing report")?;
    assert_eq!(cached, vec![false, true, false]);
    Ok(())
}

#[tokio::test]
async fn test_slow_request_hits_write_timeout() -> TestResult<()> {
    let backend = spawn_server(Duration::from_secs(2), |_| json_response(200, "{}")).await?;
    let mut ctx = ProxyContext::default();
    ctx.write_timeout = Duration::from_millis(300);
    let proxy = CoreProxy::new(0, service("treq", &backend.url("/api"), GuardConfig::Null), &ctx)?;

    let started = tokio::time::Instant::now();
    let resp = proxy.handle(get("/service/0/treq/slow")).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(body_string(resp).await?, "request timed out");
    Ok(())
}
