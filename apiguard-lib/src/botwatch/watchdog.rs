use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{IpProcData, IpStats};
use crate::config::BotwatchConfig;
use crate::storage::TelemetryStorage;

/// Outcome of analysing one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// Copy of the statistics at the moment the client was flagged
    pub flagged: Option<IpProcData>,
    pub reset: bool,
}

/// Regular enough and long enough series of gaps.
pub fn should_flag(stats: &IpProcData, conf: &BotwatchConfig) -> bool {
    if stats.count < conf.num_requests_threshold || stats.mean <= 0.0 {
        return false;
    }
    stats.stdev() / stats.mean <= conf.rsd_threshold
}

pub fn should_reset(stats: &IpProcData, now: DateTime<Utc>, conf: &BotwatchConfig) -> bool {
    if should_flag(stats, conf) {
        return true;
    }
    match stats.first_access {
        Some(first) => {
            (now - first).num_milliseconds() > conf.watched_time_window_secs as i64 * 1000
        }
        None => false,
    }
}

/// Apply one request seen at `now` to the statistics of its client.
pub fn analyze(stats: &mut IpProcData, now: DateTime<Utc>, conf: &BotwatchConfig) -> Analysis {
    let mut flagged = None;
    match stats.last_access {
        None => stats.first_access = Some(now),
        Some(last) => {
            let gap = (now - last).num_milliseconds() as f64 / 1000.0;
            if gap <= conf.max_gap_secs() {
                stats.push_gap(gap);
            }
            if should_flag(stats, conf) {
                let mut snapshot = stats.clone();
                snapshot.last_access = Some(now);
                flagged = Some(snapshot);
            }
        }
    }
    let reset = should_reset(stats, now, conf);
    if reset {
        stats.reset(now);
    }
    stats.last_access = Some(now);
    Analysis { flagged, reset }
}

enum WatchdogMsg {
    Observe { client_ip: String, session_id: String, time: DateTime<Utc> },
    ResetAll,
}

/// Consumes request observations and keeps track of bot-like clients.
///
/// Statistics are owned by a single consumer task; everything else talks to it
/// through a bounded channel. The task stops once the watchdog is dropped.
pub struct Watchdog {
    tx: mpsc::Sender<WatchdogMsg>,
    suspicions: Arc<DashMap<String, IpProcData>>,
    conf: BotwatchConfig,
}

impl Watchdog {
    pub fn start(conf: BotwatchConfig, storage: Arc<dyn TelemetryStorage>) -> Self {
        let (tx, rx) = mpsc::channel(conf.queue_capacity.max(1));
        let suspicions = Arc::new(DashMap::new());
        tokio::spawn(consume(rx, conf.clone(), storage, Arc::clone(&suspicions)));
        Self { tx, suspicions, conf }
    }

    pub async fn observe(&self, client_ip: &str, session_id: &str, time: DateTime<Utc>) {
        let msg = WatchdogMsg::Observe {
            client_ip: client_ip.to_string(),
            session_id: session_id.to_string(),
            time,
        };
        if self.tx.send(msg).await.is_err() {
            warn!(client_ip = %client_ip, "watchdog consumer stopped, observation dropped");
        }
    }

    pub fn suspicious_records(&self) -> Vec<IpStats> {
        self.suspicions.iter().map(|e| e.value().to_stats()).collect()
    }

    pub fn reset_bot_candidates(&self) {
        self.suspicions.clear();
    }

    /// Forget all statistics and suspicions.
    pub async fn reset_all(&self) {
        self.suspicions.clear();
        if self.tx.send(WatchdogMsg::ResetAll).await.is_err() {
            warn!("watchdog consumer stopped, reset ignored");
        }
    }

    pub fn conf(&self) -> &BotwatchConfig {
        &self.conf
    }
}

async fn consume(
    mut rx: mpsc::Receiver<WatchdogMsg>,
    conf: BotwatchConfig,
    storage: Arc<dyn TelemetryStorage>,
    suspicions: Arc<DashMap<String, IpProcData>>,
) {
    let mut statistics: AHashMap<String, IpProcData> = AHashMap::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            WatchdogMsg::ResetAll => {
                statistics.clear();
                info!("watchdog statistics reset");
            }
            WatchdogMsg::Observe { client_ip, session_id, time } => {
                let key = format!("{client_ip}#{session_id}");
                if !statistics.contains_key(&key) {
                    let loaded = match storage.load_stats(&client_ip, &session_id).await {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(client_ip = %client_ip, error = %e, "failed to load client statistics");
                            IpProcData::new(&client_ip, &session_id)
                        }
                    };
                    statistics.insert(key.clone(), loaded);
                }
                let Some(stats) = statistics.get_mut(&key) else {
                    continue;
                };
                let analysis = analyze(stats, time, &conf);
                if let Some(flagged) = analysis.flagged {
                    report_suspicion(&*storage, &suspicions, flagged).await;
                }
                if analysis.reset {
                    if let Err(e) = storage.reset_stats(stats).await {
                        error!(client_ip = %client_ip, error = %e, "failed to reset client statistics");
                    }
                }
                if let Err(e) = storage.update_stats(stats).await {
                    error!(client_ip = %client_ip, error = %e, "failed to update client statistics");
                }
            }
        }
    }
    debug!("watchdog consumer finished");
}

async fn report_suspicion(
    storage: &dyn TelemetryStorage,
    suspicions: &DashMap<String, IpProcData>,
    flagged: IpProcData,
) {
    info!(
        client_ip = %flagged.client_ip,
        count = flagged.count,
        mean = flagged.mean,
        stdev = flagged.stdev(),
        "detected bot-like request series"
    );
    let client_ip = flagged.client_ip.clone();
    let session_id = flagged.session_id.clone();
    suspicions
        .entry(flagged.key())
        .and_modify(|prev| {
            if flagged.req_per_second() > prev.req_per_second() {
                *prev = flagged.clone();
            }
        })
        .or_insert(flagged);

    let tx = match storage.start_tx().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(client_ip = %client_ip, error = %e, "failed to start telemetry transaction");
            return;
        }
    };
    match storage.insert_bot_like_telemetry(tx, &client_ip, &session_id).await {
        Ok(()) => {
            if let Err(e) = storage.commit_tx(tx).await {
                error!(client_ip = %client_ip, error = %e, "failed to commit bot-like telemetry");
            }
        }
        Err(e) => {
            error!(client_ip = %client_ip, error = %e, "failed to store bot-like telemetry");
            if let Err(e) = storage.rollback_tx(tx).await {
                error!(error = %e, "failed to roll back telemetry transaction");
            }
        }
    }
}
