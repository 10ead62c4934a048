use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::common::ClientAddr;
use crate::config::{load_from_path, Config, ServiceConfig};
use crate::error::{ProxyError, Result};
use crate::proxy::context::ProxyContext;
use crate::proxy::core::CoreProxy;
use crate::proxy::report::RequestCounter;
use crate::proxy::synthetic_response::{synthetic_error_response, wants_json, RespBody};

/// Split `/service/{index}/{type}/...` into the service index and type.
pub fn parse_service_path(path: &str) -> Option<(usize, &str)> {
    let mut segments = path.strip_prefix("/service/")?.splitn(3, '/');
    let index = segments.next()?.parse().ok()?;
    let service_type = segments.next().filter(|t| !t.is_empty())?;
    Some((index, service_type))
}

/// Proxies of all configured services, indexed by their position in the configuration.
pub struct ServiceRouter {
    services: Vec<Arc<CoreProxy>>,
}

impl ServiceRouter {
    /// Must be called from within a tokio runtime.
    pub fn build(services: &[ServiceConfig], ctx: &ProxyContext) -> Result<Self> {
        if services.is_empty() {
            return Err(ProxyError::NoServices);
        }
        let services = services
            .iter()
            .enumerate()
            .map(|(index, conf)| CoreProxy::new(index, conf.clone(), ctx).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        for proxy in &services {
            info!(path = %proxy.service_path(), guard = %proxy.guard().guard_type(), "service registered");
        }
        Ok(Self { services })
    }

    pub fn route(&self, path: &str) -> Option<&Arc<CoreProxy>> {
        let (index, service_type) = parse_service_path(path)?;
        self.services.get(index).filter(|proxy| proxy.service_type() == service_type)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Collaborators the server is started with.
pub struct ServerOptions {
    pub ctx: ProxyContext,
    /// Counter fed by `ctx.counter`, its snapshot is persisted on shutdown and reload
    pub counter: Option<RequestCounter>,
    /// Configuration file re-read on SIGHUP
    pub config_path: Option<PathBuf>,
}

impl ServerOptions {
    pub fn new(ctx: ProxyContext) -> Self {
        Self { ctx, counter: None, config_path: None }
    }
}

/// Guard to decrement active connections counter when dropped
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

fn proxy_context(config: &Config, base: &ProxyContext) -> ProxyContext {
    let mut ctx = base.clone();
    ctx.read_timeout = Duration::from_secs(config.timeout.read_secs);
    ctx.write_timeout = Duration::from_secs(config.timeout.write_secs);
    ctx.keep_alive = config.timeout.keep_alive.clone();
    ctx
}

async fn handle(
    router: Arc<ServiceRouter>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<RespBody> {
    req.extensions_mut().insert(ClientAddr(peer));
    match router.route(req.uri().path()) {
        Some(proxy) => proxy.handle(req).await,
        None => {
            debug!(path = %req.uri().path(), "no service matches path");
            synthetic_error_response(StatusCode::NOT_FOUND, "Not Found", wants_json(req.headers()))
        }
    }
}

fn persist_counter(counter: Option<&RequestCounter>, path: Option<&Path>) {
    if let (Some(counter), Some(path)) = (counter, path) {
        if let Err(e) = counter.save(path) {
            error!(error = %e, "failed to save request counter state");
        }
    }
}

fn reload(path: &Path, base: &ProxyContext, router: &ArcSwap<ServiceRouter>) -> Result<usize> {
    let config = load_from_path(path)?;
    let ctx = proxy_context(&config, base);
    let fresh = ServiceRouter::build(&config.services, &ctx)?;
    let num_services = fresh.len();
    router.store(Arc::new(fresh));
    Ok(num_services)
}

pub async fn run(config: Arc<Config>, opts: ServerOptions) -> Result<()> {
    let addr = config.listen;
    let listener = TcpListener::bind(addr).await.map_err(ProxyError::Io)?;

    let ctx = proxy_context(&config, &opts.ctx);
    let router = Arc::new(ArcSwap::from_pointee(ServiceRouter::build(&config.services, &ctx)?));
    let counter_state_path = config.counter_state_path.clone();

    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .keep_alive(config.timeout.keep_alive.enabled)
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(config.timeout.read_secs));

    // Track active connections for graceful shutdown
    let active_connections = Arc::new(AtomicUsize::new(0));

    // Setup signal handlers
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
        ProxyError::Io(std::io::Error::other(format!("Failed to setup SIGTERM handler: {e}")))
    })?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
        ProxyError::Io(std::io::Error::other(format!("Failed to setup SIGINT handler: {e}")))
    })?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup()).map_err(|e| {
        ProxyError::Io(std::io::Error::other(format!("Failed to setup SIGHUP handler: {e}")))
    })?;

    info!(?addr, services = config.services.len(), "starting API guard");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading");
                persist_counter(opts.counter.as_ref(), counter_state_path.as_deref());
                match opts.config_path.as_deref() {
                    Some(path) => match reload(path, &opts.ctx, &router) {
                        Ok(num_services) => info!(path = %path.display(), num_services, "configuration reloaded"),
                        Err(e) => error!(error = %e, "configuration reload failed, keeping current services"),
                    },
                    None => warn!("no configuration file to reload from"),
                }
            }
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok((stream, peer)) => (stream, peer),
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };

                active_connections.fetch_add(1, Ordering::Relaxed);

                let builder = builder.clone();
                let router = router.clone();
                let active_connections = active_connections.clone();

                tokio::spawn(async move {
                    // Ensure counter is decremented when connection finishes
                    let _guard = ConnectionGuard(active_connections);
                    let svc = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let router = router.load_full();
                        async move { Ok::<_, hyper::Error>(handle(router, peer, req).await) }
                    });
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), svc).await {
                        warn!(?peer, error = %e, "serve_connection error");
                    }
                });
            }
        }
    }

    drop(listener);
    info!(
        "Waiting for active connections to finish (timeout: {}s)",
        config.timeout.shutdown_secs
    );
    let shutdown_timeout = Duration::from_secs(config.timeout.shutdown_secs);
    let start = std::time::Instant::now();

    loop {
        let active = active_connections.load(Ordering::Relaxed);
        if active == 0 {
            info!("All connections closed, shutdown complete");
            break;
        }

        if start.elapsed() >= shutdown_timeout {
            warn!(
                active_connections = active,
                "Shutdown timeout reached, {} connections still active", active
            );
            break;
        }

        debug!(active_connections = active, "Waiting for connections to close");
        sleep(Duration::from_millis(100)).await;
    }

    persist_counter(opts.counter.as_ref(), counter_state_path.as_deref());
    info!("API guard stopped");
    Ok(())
}
