use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;

use super::{StorageError, TelemetryStorage, TxHandle, UserFinder};
use crate::botwatch::IpProcData;
use crate::common::{ClientId, UserId};
use crate::guard::DelayInfo;
use crate::session::{sha256_hex, CncSessionValue, HttpSession};

fn poisoned() -> StorageError {
    StorageError::Backend("memory storage lock poisoned".to_string())
}

/// Session store kept in process memory.
///
/// Entries are keyed by the session search selector and hold the stored validator
/// (hashed for `cnc` sessions, raw for `simple` ones).
#[derive(Default)]
pub struct MemoryUserFinder {
    sessions: RwLock<AHashMap<String, (String, UserId)>>,
}

impl MemoryUserFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `selector-validator` cookie value for a user.
    pub fn insert_cnc_session(&self, raw: &str, user_id: UserId) {
        let value = CncSessionValue::parse(raw);
        if let Ok(mut guard) = self.sessions.write() {
            guard.insert(value.selector.clone(), (sha256_hex(&value.validator), user_id));
        }
    }

    pub fn insert_simple_session(&self, raw: &str, user_id: UserId) {
        if let Ok(mut guard) = self.sessions.write() {
            guard.insert(raw.to_string(), (raw.to_string(), user_id));
        }
    }

    pub fn remove_session(&self, selector: &str) {
        if let Ok(mut guard) = self.sessions.write() {
            guard.remove(selector);
        }
    }
}

#[async_trait]
impl UserFinder for MemoryUserFinder {
    async fn find_user_by_session(&self, session: &HttpSession) -> Result<UserId, StorageError> {
        let guard = self.sessions.read().map_err(|_| poisoned())?;
        match guard.get(session.search_selector()) {
            Some((stored, user_id)) if session.matches_stored_value(stored) => Ok(*user_id),
            _ => Ok(UserId::INVALID),
        }
    }
}

/// Telemetry storage kept in process memory.
#[derive(Default)]
pub struct MemoryTelemetryStorage {
    stats: Mutex<AHashMap<String, IpProcData>>,
    bans: RwLock<AHashSet<String>>,
    applied_delays: Mutex<Vec<(ClientId, DelayInfo)>>,
    telemetry_counts: Mutex<AHashMap<String, i64>>,
    pending_bot_like: Mutex<AHashMap<u64, Vec<(String, String)>>>,
    bot_like: Mutex<Vec<(String, String)>>,
    next_tx: AtomicU64,
}

fn stats_key(client_ip: &str, session_id: &str) -> String {
    format!("{client_ip}#{session_id}")
}

impl MemoryTelemetryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban_ip(&self, ip: &str) {
        if let Ok(mut guard) = self.bans.write() {
            guard.insert(ip.to_string());
        }
    }

    pub fn unban_ip(&self, ip: &str) -> bool {
        self.bans.write().map(|mut g| g.remove(ip)).unwrap_or(false)
    }

    /// Count one telemetry record for a client.
    pub fn record_telemetry(&self, client_ip: &str, session_id: &str) {
        if let Ok(mut guard) = self.telemetry_counts.lock() {
            *guard.entry(stats_key(client_ip, session_id)).or_insert(0) += 1;
        }
    }

    pub fn applied_delays(&self) -> Vec<(ClientId, DelayInfo)> {
        self.applied_delays.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Clients reported as bot-like by committed transactions.
    pub fn bot_like_clients(&self) -> Vec<(String, String)> {
        self.bot_like.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn stored_stats(&self, client_ip: &str, session_id: &str) -> Option<IpProcData> {
        self.stats
            .lock()
            .ok()
            .and_then(|g| g.get(&stats_key(client_ip, session_id)).cloned())
    }
}

#[async_trait]
impl TelemetryStorage for MemoryTelemetryStorage {
    async fn load_stats(
        &self,
        client_ip: &str,
        session_id: &str,
    ) -> Result<IpProcData, StorageError> {
        let guard = self.stats.lock().map_err(|_| poisoned())?;
        Ok(guard
            .get(&stats_key(client_ip, session_id))
            .cloned()
            .unwrap_or_else(|| IpProcData::new(client_ip, session_id)))
    }

    async fn reset_stats(&self, data: &IpProcData) -> Result<(), StorageError> {
        let mut guard = self.stats.lock().map_err(|_| poisoned())?;
        guard.insert(
            stats_key(&data.client_ip, &data.session_id),
            IpProcData::new(&data.client_ip, &data.session_id),
        );
        Ok(())
    }

    async fn update_stats(&self, data: &IpProcData) -> Result<(), StorageError> {
        let mut guard = self.stats.lock().map_err(|_| poisoned())?;
        guard.insert(stats_key(&data.client_ip, &data.session_id), data.clone());
        Ok(())
    }

    async fn test_ip_ban(&self, ip: &str) -> Result<bool, StorageError> {
        let guard = self.bans.read().map_err(|_| poisoned())?;
        Ok(guard.contains(ip))
    }

    async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), StorageError> {
        let mut guard = self.applied_delays.lock().map_err(|_| poisoned())?;
        guard.push((client_id.clone(), *delay));
        Ok(())
    }

    // The in-memory store keeps no timestamps, so the whole history is compared.
    async fn calc_stats_telemetry_discrepancy(
        &self,
        client_ip: &str,
        session_id: &str,
        _history_secs: u64,
    ) -> Result<i64, StorageError> {
        let key = stats_key(client_ip, session_id);
        let stats_count = {
            let guard = self.stats.lock().map_err(|_| poisoned())?;
            guard.get(&key).map(|s| s.count as i64).unwrap_or(0)
        };
        let telemetry_count = {
            let guard = self.telemetry_counts.lock().map_err(|_| poisoned())?;
            guard.get(&key).copied().unwrap_or(0)
        };
        Ok(stats_count - telemetry_count)
    }

    async fn insert_bot_like_telemetry(
        &self,
        tx: TxHandle,
        client_ip: &str,
        session_id: &str,
    ) -> Result<(), StorageError> {
        let mut guard = self.pending_bot_like.lock().map_err(|_| poisoned())?;
        let pending = guard.get_mut(&tx.0).ok_or(StorageError::UnknownTransaction(tx.0))?;
        pending.push((client_ip.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn start_tx(&self) -> Result<TxHandle, StorageError> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.pending_bot_like.lock().map_err(|_| poisoned())?;
        guard.insert(id, Vec::new());
        Ok(TxHandle(id))
    }

    async fn commit_tx(&self, tx: TxHandle) -> Result<(), StorageError> {
        let pending = {
            let mut guard = self.pending_bot_like.lock().map_err(|_| poisoned())?;
            guard.remove(&tx.0).ok_or(StorageError::UnknownTransaction(tx.0))?
        };
        let mut committed = self.bot_like.lock().map_err(|_| poisoned())?;
        committed.extend(pending);
        Ok(())
    }

    async fn rollback_tx(&self, tx: TxHandle) -> Result<(), StorageError> {
        let mut guard = self.pending_bot_like.lock().map_err(|_| poisoned())?;
        guard.remove(&tx.0).ok_or(StorageError::UnknownTransaction(tx.0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionType;

    #[tokio::test]
    async fn test_user_finder_checks_validator() -> Result<(), StorageError> {
        let finder = MemoryUserFinder::new();
        finder.insert_cnc_session("sel-secret", UserId(42));

        let ok = SessionType::Cnc.parse("sel-secret");
        assert_eq!(finder.find_user_by_session(&ok).await?, UserId(42));

        let forged = SessionType::Cnc.parse("sel-forged");
        assert_eq!(finder.find_user_by_session(&forged).await?, UserId::INVALID);

        let unknown = SessionType::Cnc.parse("nope-secret");
        assert_eq!(finder.find_user_by_session(&unknown).await?, UserId::INVALID);
        Ok(())
    }

    #[tokio::test]
    async fn test_transactions_commit_and_rollback() -> Result<(), StorageError> {
        let storage = MemoryTelemetryStorage::new();

        let tx = storage.start_tx().await?;
        storage.insert_bot_like_telemetry(tx, "10.0.0.1", "s1").await?;
        storage.rollback_tx(tx).await?;
        assert!(storage.bot_like_clients().is_empty());

        let tx = storage.start_tx().await?;
        storage.insert_bot_like_telemetry(tx, "10.0.0.2", "s2").await?;
        storage.commit_tx(tx).await?;
        assert_eq!(
            storage.bot_like_clients(),
            vec![("10.0.0.2".to_string(), "s2".to_string())]
        );

        assert!(storage.commit_tx(tx).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_discrepancy_and_bans() -> Result<(), StorageError> {
        let storage = MemoryTelemetryStorage::new();
        let mut stats = storage.load_stats("10.0.0.1", "").await?;
        stats.count = 5;
        storage.update_stats(&stats).await?;
        storage.record_telemetry("10.0.0.1", "");
        storage.record_telemetry("10.0.0.1", "");
        assert_eq!(
            storage.calc_stats_telemetry_discrepancy("10.0.0.1", "", 3600).await?,
            3
        );

        assert!(!storage.test_ip_ban("10.0.0.1").await?);
        storage.ban_ip("10.0.0.1");
        assert!(storage.test_ip_ban("10.0.0.1").await?);
        assert!(storage.unban_ip("10.0.0.1"));
        Ok(())
    }
}
