//! Short-lived "open requested" markers.
//!
//! A marker is set right before an OPEN position is requested and expires on
//! its own, so a symbol cannot be claimed twice while the journal write is
//! still in flight.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::info;

/// Key/value store with set-if-absent semantics and per-key expiry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Set `key` for `ttl` unless it is already set. Returns true when this call set it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Drop `key` before it expires.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process marker store.
#[derive(Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<HashMap<String, Instant>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut markers = self
            .markers
            .lock()
            .map_err(|_| anyhow!("marker lock poisoned"))?;

        markers.retain(|_, expires_at| *expires_at > now);

        if markers.contains_key(key) {
            return Ok(false);
        }
        markers.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.markers
            .lock()
            .map_err(|_| anyhow!("marker lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Marker store shared between nodes through Redis `SET NX EX`.
pub struct RedisMarkerStore {
    conn: ConnectionManager,
}

impl RedisMarkerStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| anyhow!("Redis connection timeout after 5 seconds"))??;

        info!("Marker store connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl MarkerStore for RedisMarkerStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
