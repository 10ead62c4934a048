//! Per-request reporting and request counting.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::common::UserId;
use crate::error::{ProxyError, Result};

const COUNTER_QUEUE_CAPACITY: usize = 1024;

/// Processing record of one proxied request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProcReport {
    pub date_time: DateTime<Utc>,
    /// Seconds spent on the request, including guard delays
    pub proc_time: f64,
    pub status: u16,
    pub service: String,
    pub is_cached: bool,
}

/// A request served on behalf of a user.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub created: DateTime<Utc>,
    pub service: String,
    pub num_requests: u64,
    pub user_id: UserId,
    pub ip: String,
}

impl RequestInfo {
    pub fn new(service: impl Into<String>, user_id: UserId, ip: impl Into<String>) -> Self {
        Self {
            created: Utc::now(),
            service: service.into(),
            num_requests: 1,
            user_id,
            ip: ip.into(),
        }
    }
}

pub type ReportSink = mpsc::UnboundedSender<ProxyProcReport>;

/// Start the default reporting consumer, which logs each report.
///
/// The task ends once every sender is dropped.
pub fn spawn_report_logger() -> (ReportSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProxyProcReport>();
    let handle = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            info!(
                service = %report.service,
                status = report.status,
                proc_time = report.proc_time,
                is_cached = report.is_cached,
                "request processed"
            );
        }
        debug!("report logger stopped");
    });
    (tx, handle)
}

/// Persisted form of the request counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub saved_at: Option<DateTime<Utc>>,
    /// Total requests per service
    pub services: BTreeMap<String, u64>,
}

/// Per-service request totals fed through a bounded channel.
#[derive(Clone, Default)]
pub struct RequestCounter {
    totals: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the consumer and return the sender the proxy reports to.
    pub fn start(&self) -> (mpsc::Sender<RequestInfo>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RequestInfo>(COUNTER_QUEUE_CAPACITY);
        let counter = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(info) = rx.recv().await {
                counter.add(&info);
            }
            debug!("request counter stopped");
        });
        (tx, handle)
    }

    pub fn add(&self, info: &RequestInfo) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        *totals.entry(info.service.clone()).or_insert(0) += info.num_requests;
    }

    pub fn total(&self, service: &str) -> u64 {
        self.totals
            .lock()
            .map(|t| t.get(service).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let services = self.totals.lock().map(|t| t.clone()).unwrap_or_default();
        CounterSnapshot { saved_at: Some(Utc::now()), services }
    }

    /// Replace the totals with the ones of a snapshot.
    pub fn restore(&self, snapshot: CounterSnapshot) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        *totals = snapshot.services;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.snapshot())
            .map_err(|e| ProxyError::State(e.to_string()))?;
        std::fs::write(path, data)?;
        info!(path = %path.display(), "request counter state saved");
        Ok(())
    }

    /// Restore the totals from `path`. A missing file leaves the counter untouched.
    pub fn load(&self, path: &Path) -> Result<()> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no stored request counter state");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: CounterSnapshot =
            serde_json::from_slice(&data).map_err(|e| ProxyError::State(e.to_string()))?;
        info!(path = %path.display(), services = snapshot.services.len(), "request counter state loaded");
        self.restore(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_consumes_until_closed() {
        let counter = RequestCounter::new();
        let (tx, handle) = counter.start();
        for _ in 0..3 {
            tx.send(RequestInfo::new("kontext", UserId(1), "10.0.0.1")).await.unwrap();
        }
        tx.send(RequestInfo::new("treq", UserId::INVALID, "10.0.0.2")).await.unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(counter.total("kontext"), 3);
        assert_eq!(counter.total("treq"), 1);
        assert_eq!(counter.total("missing"), 0);
    }

    #[test]
    fn test_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.json");
        let counter = RequestCounter::new();
        counter.add(&RequestInfo::new("kontext", UserId(1), "10.0.0.1"));
        counter.save(&path).unwrap();

        let restored = RequestCounter::new();
        restored.load(&path).unwrap();
        assert_eq!(restored.total("kontext"), 1);

        let untouched = RequestCounter::new();
        untouched.load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(untouched.snapshot().services.len(), 0);
    }
}
