use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use http::request::Parts;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::{cache_key, Cache, CacheEntry, CacheEntryOptions, CacheError};
use crate::config::RedisCacheConfig;

pub const WRITE_QUEUE_CAPACITY: usize = 100;

const DEFAULT_REDIS_PORT: u16 = 6379;
const KEY_PREFIX: &str = "apiguard:cache:";

/// `host:port`, with the default Redis port when the address has none.
pub fn redis_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_REDIS_PORT}")
    }
}

fn redis_url(conf: &RedisCacheConfig) -> String {
    let auth = match &conf.password {
        Some(password) if !password.is_empty() => format!(":{password}@"),
        _ => String::new(),
    };
    format!("redis://{auth}{}/{}", redis_address(&conf.address), conf.db)
}

/// Deferred Redis write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: String, value: Vec<u8>, ttl_secs: u64 },
    Expire { key: String, ttl_secs: u64 },
}

/// Bounded queue of writes; operations are dropped when it is full.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteOp>,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WriteOp>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn push(&self, op: WriteOp) -> Result<(), CacheError> {
        self.tx.try_send(op).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                error!("Redis cache write queue full");
                CacheError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => CacheError::QueueClosed,
        })
    }
}

async fn drain_writes(mut rx: mpsc::Receiver<WriteOp>, mut conn: ConnectionManager) {
    while let Some(op) = rx.recv().await {
        let res: Result<(), ::redis::RedisError> = match &op {
            WriteOp::Set { key, value, ttl_secs } => {
                ::redis::cmd("SETEX")
                    .arg(key)
                    .arg(*ttl_secs)
                    .arg(value.as_slice())
                    .query_async(&mut conn)
                    .await
            }
            WriteOp::Expire { key, ttl_secs } => {
                ::redis::cmd("EXPIRE").arg(key).arg(*ttl_secs).query_async(&mut conn).await
            }
        };
        if let Err(e) = res {
            error!(error = %e, "failed to write to Redis cache");
        }
    }
    debug!("Redis cache writer finished");
}

/// Queue the sliding TTL refresh of a hit. A dropped refresh never turns the hit
/// into a miss.
fn refresh_on_hit(queue: &WriteQueue, key: String, ttl_secs: u64, entry: CacheEntry) -> CacheEntry {
    if let Err(e) = queue.push(WriteOp::Expire { key, ttl_secs }) {
        warn!(error = %e, "Redis cache TTL refresh dropped");
    }
    entry
}

/// Cache stored in Redis. Reads are synchronous, writes and TTL refreshes go
/// through the [`WriteQueue`].
pub struct RedisCache {
    conn: ConnectionManager,
    queue: WriteQueue,
    ttl: Duration,
}

impl RedisCache {
    pub async fn connect(conf: &RedisCacheConfig, ttl: Duration) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(redis_url(conf))?;
        let conn = ConnectionManager::new(client).await?;
        let (queue, rx) = WriteQueue::new(WRITE_QUEUE_CAPACITY);
        tokio::spawn(drain_writes(rx, conn.clone()));
        debug!(address = %redis_address(&conf.address), db = conf.db, "connected to Redis cache");
        Ok(Self { conn, queue, ttl })
    }

    fn key(parts: &Parts, opts: &CacheEntryOptions) -> String {
        format!("{KEY_PREFIX}{}", cache_key(parts, opts))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(
        &self,
        parts: &Parts,
        opts: &CacheEntryOptions,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let key = Self::key(parts, opts);
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = ::redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry = CacheEntry::decode(&raw)?;
        Ok(Some(refresh_on_hit(&self.queue, key, self.ttl.as_secs(), entry)))
    }

    async fn set(
        &self,
        parts: &Parts,
        entry: &CacheEntry,
        opts: &CacheEntryOptions,
    ) -> Result<(), CacheError> {
        self.queue.push(WriteOp::Set {
            key: Self::key(parts, opts),
            value: entry.encode()?,
            ttl_secs: self.ttl.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_address_default_port() {
        assert_eq!(redis_address("localhost"), "localhost:6379");
        assert_eq!(redis_address("10.0.0.5:7000"), "10.0.0.5:7000");
    }

    #[test]
    fn test_redis_url() {
        let conf =
            RedisCacheConfig { address: "cache".to_string(), db: 2, password: Some("pw".to_string()) };
        assert_eq!(redis_url(&conf), "redis://:pw@cache:6379/2");
    }

    #[tokio::test]
    async fn test_full_queue_drops_operations() {
        let (queue, _rx) = WriteQueue::new(WRITE_QUEUE_CAPACITY);
        for i in 0..WRITE_QUEUE_CAPACITY {
            queue
                .push(WriteOp::Expire { key: format!("k{i}"), ttl_secs: 10 })
                .expect("queue has room");
        }
        let res = queue.push(WriteOp::Expire { key: "overflow".to_string(), ttl_secs: 10 });
        assert!(matches!(res, Err(CacheError::QueueFull)));
        assert_eq!(CacheError::QueueFull.to_string(), "Redis cache write queue full");
    }

    fn entry() -> CacheEntry {
        CacheEntry { status: 200, headers: Default::default(), data: b"{}".to_vec() }
    }

    #[tokio::test]
    async fn test_hit_refreshes_ttl() {
        let (queue, mut rx) = WriteQueue::new(4);
        let hit = refresh_on_hit(&queue, "apiguard:cache:ab".to_string(), 60, entry());
        assert_eq!(hit, entry());
        assert_eq!(
            rx.recv().await,
            Some(WriteOp::Expire { key: "apiguard:cache:ab".to_string(), ttl_secs: 60 })
        );
    }

    #[tokio::test]
    async fn test_hit_survives_full_queue() {
        let (queue, mut rx) = WriteQueue::new(1);
        queue.push(WriteOp::Expire { key: "k".to_string(), ttl_secs: 1 }).expect("queue has room");

        let hit = refresh_on_hit(&queue, "apiguard:cache:ab".to_string(), 60, entry());
        assert_eq!(hit, entry());
        assert_eq!(rx.recv().await, Some(WriteOp::Expire { key: "k".to_string(), ttl_secs: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (queue, rx) = WriteQueue::new(1);
        drop(rx);
        let res = queue.push(WriteOp::Expire { key: "k".to_string(), ttl_secs: 1 });
        assert!(matches!(res, Err(CacheError::QueueClosed)));
    }
}
