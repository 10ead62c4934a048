use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running statistics of inter-request gaps of one client (IP + session).
///
/// Mean and variance are maintained with Welford's online algorithm; the gap values
/// themselves are never stored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IpProcData {
    pub client_ip: String,
    pub session_id: String,
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub first_access: Option<DateTime<Utc>>,
    pub last_access: Option<DateTime<Utc>>,
}

impl IpProcData {
    pub fn new(client_ip: &str, session_id: &str) -> Self {
        Self {
            client_ip: client_ip.to_string(),
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    /// Key of the client this record belongs to.
    pub fn key(&self) -> String {
        format!("{}#{}", self.client_ip, self.session_id)
    }

    /// Add one gap (in seconds) to the statistics.
    pub fn push_gap(&mut self, gap_secs: f64) {
        self.count += 1;
        let delta = gap_secs - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = gap_secs - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn req_per_second(&self) -> f64 {
        match (self.first_access, self.last_access) {
            (Some(first), Some(last)) => {
                let secs = (last - first).num_milliseconds() as f64 / 1000.0;
                if secs > 0.0 {
                    self.count as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Drop the accumulated statistics, starting a new window at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.count = 0;
        self.mean = 0.0;
        self.m2 = 0.0;
        self.first_access = Some(now);
    }

    pub fn to_stats(&self) -> IpStats {
        IpStats {
            ip: self.client_ip.clone(),
            session_id: self.session_id.clone(),
            mean: self.mean,
            stdev: self.stdev(),
            count: self.count,
            req_per_second: self.req_per_second(),
            first_request: self.first_access,
            last_request: self.last_access,
        }
    }
}

/// Serializable snapshot of [`IpProcData`] used for reporting.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpStats {
    pub ip: String,
    pub session_id: String,
    pub mean: f64,
    pub stdev: f64,
    pub count: u64,
    pub req_per_second: f64,
    pub first_request: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
}
