use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::KeepAliveConfig;

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Shared HTTP/1.1 client for the backend of one service
///
/// Connections are pooled and dropped after `idle_conn_timeout_secs` of inactivity.
/// Redirects are never followed, they are passed to the client instead.
#[derive(Clone)]
pub struct ClientPool {
    client: Arc<HttpClient>,
}

impl ClientPool {
    pub fn new(keep_alive: &KeepAliveConfig, idle_conn_timeout_secs: u64) -> Self {
        let mut connector = HttpConnector::new();
        // TCP keep-alive: sends periodic packets to keep TCP connection alive
        if keep_alive.enabled {
            connector.set_keepalive(Some(Duration::from_secs(keep_alive.timeout_secs)));
        } else {
            connector.set_keepalive(None);
        }

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_idle_timeout(Duration::from_secs(idle_conn_timeout_secs));

        Self { client: Arc::new(builder.build(connector)) }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}
