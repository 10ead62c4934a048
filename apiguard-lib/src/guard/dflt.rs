use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use http::request::Parts;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::admission::Admission;
use super::{DelayInfo, Guard, GuardDeps, GuardError, GuardType, ReqEvaluation};
use crate::common::{extract_client_ip, AnonymousUsers, ClientId, UserId};
use crate::config::{GuardConfig, ServiceConfig};
use crate::proxy::cookies::Cookie;

const COUNTER_QUEUE_CAPACITY: usize = 4096;

/// Delay for a client that has sent `count` requests within the current window.
///
/// Requests up to `free_quota` are not delayed; above it the delay follows a sigmoid
/// approaching 5 seconds.
pub fn sigmoid_delay(count: u64, free_quota: u64) -> Duration {
    if count <= free_quota {
        return Duration::ZERO;
    }
    let over = (count - free_quota) as f64;
    let secs = 10.0 * (1.0 / (1.0 + (-over / 100.0).exp()) - 0.5);
    Duration::from_secs_f64(secs)
}

#[derive(Debug, Clone, Copy)]
struct RequestCount {
    count: u64,
    window_start: Instant,
}

/// Counts requests per IP and delays busy clients.
pub struct DefaultGuard {
    admission: Admission,
    anonymous_users: AnonymousUsers,
    counts: Arc<DashMap<String, RequestCount>>,
    counter_tx: mpsc::Sender<String>,
    free_quota: u64,
}

pub(super) fn build(
    service: &ServiceConfig,
    _: &str,
    deps: &GuardDeps,
) -> Result<Arc<dyn Guard>, GuardError> {
    let GuardConfig::Default { free_quota, cleanup_interval_secs } = &service.guard else {
        return Err(GuardError::ConfigMismatch(GuardType::Default));
    };
    Ok(Arc::new(DefaultGuard::new(
        Admission::new(GuardType::Default, service, deps),
        deps.anonymous_users.clone(),
        *free_quota,
        Duration::from_secs(*cleanup_interval_secs),
    )))
}

impl DefaultGuard {
    fn new(
        admission: Admission,
        anonymous_users: AnonymousUsers,
        free_quota: u64,
        cleanup_interval: Duration,
    ) -> Self {
        let (counter_tx, counter_rx) = mpsc::channel(COUNTER_QUEUE_CAPACITY);
        let counts = Arc::new(DashMap::new());
        tokio::spawn(count_requests(counter_rx, Arc::clone(&counts), cleanup_interval));
        Self { admission, anonymous_users, counts, counter_tx, free_quota }
    }

    /// Requests counted for `ip` in the current window.
    pub fn request_count(&self, ip: &str) -> u64 {
        self.counts.get(ip).map(|c| c.count).unwrap_or(0)
    }
}

/// The only writer of the request counters.
async fn count_requests(
    mut rx: mpsc::Receiver<String>,
    counts: Arc<DashMap<String, RequestCount>>,
    cleanup_interval: Duration,
) {
    while let Some(ip) = rx.recv().await {
        let now = Instant::now();
        let mut entry = counts.entry(ip).or_insert(RequestCount { count: 0, window_start: now });
        if now.duration_since(entry.window_start) > cleanup_interval {
            *entry = RequestCount { count: 0, window_start: now };
        }
        entry.count += 1;
    }
    debug!("request counter finished");
}

#[async_trait]
impl Guard for DefaultGuard {
    async fn evaluate_request(&self, parts: &Parts, _: Option<&Cookie>) -> ReqEvaluation {
        let client_ip = extract_client_ip(parts);
        if self.counter_tx.try_send(client_ip.clone()).is_err() {
            warn!(client_ip = %client_ip, "request counter queue full, request not counted");
        }
        self.admission.check(ClientId::anonymous(client_ip), String::new()).await
    }

    async fn calc_delay(&self, _: &Parts, client_id: &ClientId) -> Result<DelayInfo, GuardError> {
        Ok(DelayInfo::of(sigmoid_delay(self.request_count(&client_id.ip), self.free_quota)))
    }

    async fn determine_true_user_id(&self, _: &Parts) -> Result<UserId, GuardError> {
        Ok(UserId::INVALID)
    }

    fn test_user_is_anonymous(&self, user_id: UserId) -> bool {
        self.anonymous_users.is_anonymous(user_id)
    }

    async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), GuardError> {
        self.admission.log_applied_delay(delay, client_id).await
    }

    fn guard_type(&self) -> GuardType {
        GuardType::Default
    }
}
