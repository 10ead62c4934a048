//! Contracts of the persistence collaborators consumed by guards and the watchdog.
//!
//! The gateway never talks to SQL directly. Session lookup goes through [`UserFinder`],
//! ban checks, delay logs and bot statistics through [`TelemetryStorage`].

mod memory;

pub use memory::{MemoryTelemetryStorage, MemoryUserFinder};

use async_trait::async_trait;
use thiserror::Error;

use crate::botwatch::IpProcData;
use crate::common::{ClientId, UserId};
use crate::guard::DelayInfo;
use crate::session::HttpSession;

#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(u64),
}

/// Opaque handle of a storage transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(pub u64);

/// Resolves session cookies to users.
#[async_trait]
pub trait UserFinder: Send + Sync {
    /// Returns [`UserId::INVALID`] for unknown sessions or mismatching validators.
    async fn find_user_by_session(&self, session: &HttpSession) -> Result<UserId, StorageError>;
}

#[async_trait]
pub trait TelemetryStorage: Send + Sync {
    /// Load persisted statistics of a client, or a fresh record when none exist.
    async fn load_stats(&self, client_ip: &str, session_id: &str)
        -> Result<IpProcData, StorageError>;

    async fn reset_stats(&self, data: &IpProcData) -> Result<(), StorageError>;

    async fn update_stats(&self, data: &IpProcData) -> Result<(), StorageError>;

    async fn test_ip_ban(&self, ip: &str) -> Result<bool, StorageError>;

    async fn log_applied_delay(
        &self,
        delay: &DelayInfo,
        client_id: &ClientId,
    ) -> Result<(), StorageError>;

    /// Difference between the number of requests seen by the statistics and by telemetry
    /// for a client within the last `history_secs`.
    async fn calc_stats_telemetry_discrepancy(
        &self,
        client_ip: &str,
        session_id: &str,
        history_secs: u64,
    ) -> Result<i64, StorageError>;

    async fn insert_bot_like_telemetry(
        &self,
        tx: TxHandle,
        client_ip: &str,
        session_id: &str,
    ) -> Result<(), StorageError>;

    async fn start_tx(&self) -> Result<TxHandle, StorageError>;

    async fn commit_tx(&self, tx: TxHandle) -> Result<(), StorageError>;

    async fn rollback_tx(&self, tx: TxHandle) -> Result<(), StorageError>;
}
