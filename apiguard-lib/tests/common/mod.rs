//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apiguard_lib::config::{GuardConfig, ServiceConfig};
use apiguard_lib::session::SessionType;
use bytes::Bytes;
use http::request::Parts;
use http::Response;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub fn pick_free_port() -> TestResult<SocketAddr> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// A running mock HTTP server counting the requests it answered
pub struct MockServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Spawn an HTTP/1.1 server answering every request with `handler` after `delay`
pub async fn spawn_server<F>(delay: Duration, handler: F) -> TestResult<MockServer>
where
    F: Fn(&Parts) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let hits = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);
    let server_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let handler = handler.clone();
            let hits = server_hits.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: hyper::Request<Incoming>| {
                    let handler = handler.clone();
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        let (parts, _) = req.into_parts();
                        Ok::<_, hyper::Error>(handler(&parts))
                    }
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), svc).await;
            });
        }
    });
    Ok(MockServer { addr, hits })
}

pub fn json_response(status: u16, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

pub fn service(service_type: &str, internal_url: &str, guard: GuardConfig) -> ServiceConfig {
    ServiceConfig {
        service_type: service_type.to_string(),
        internal_url: internal_url.to_string(),
        external_url: None,
        external_session_cookie: String::new(),
        backend_session_cookie: "cnc_toolbar_sid".to_string(),
        session_type: SessionType::Cnc,
        use_header_x_api_key: false,
        true_user_id_header: None,
        limits: vec![],
        req_timeout_secs: 5,
        idle_conn_timeout_secs: 5,
        caching_per_session: false,
        cacheable_post: false,
        guard,
        login: None,
    }
}

pub fn request_parts(uri: &str, headers: &[(&str, &str)]) -> Parts {
    let mut builder = http::Request::builder().uri(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    builder.body(()).map(|r| r.into_parts().0).unwrap_or_else(|e| panic!("bad request: {e}"))
}
