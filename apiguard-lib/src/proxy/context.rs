use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::{Cache, NullCache};
use crate::config::KeepAliveConfig;
use crate::guard::GuardDeps;
use crate::proxy::report::{ReportSink, RequestInfo};

/// Collaborators shared by the proxies of all services
#[derive(Clone)]
pub struct ProxyContext {
    pub guard_deps: GuardDeps,
    pub cache: Arc<dyn Cache>,
    pub keep_alive: KeepAliveConfig,
    /// Requests delayed by this much or more are answered with 503
    pub read_timeout: Duration,
    /// Upper bound for answering a request
    pub write_timeout: Duration,
    pub reports: Option<ReportSink>,
    pub counter: Option<mpsc::Sender<RequestInfo>>,
}

impl ProxyContext {
    pub fn new(guard_deps: GuardDeps, cache: Arc<dyn Cache>) -> Self {
        Self {
            guard_deps,
            cache,
            keep_alive: KeepAliveConfig::default(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            reports: None,
            counter: None,
        }
    }

    pub fn with_reports(mut self, reports: ReportSink) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn with_counter(mut self, counter: mpsc::Sender<RequestInfo>) -> Self {
        self.counter = Some(counter);
        self
    }
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self::new(GuardDeps::default(), Arc::new(NullCache))
    }
}
