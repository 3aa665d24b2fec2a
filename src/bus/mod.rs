//! Signal bus: latest decision per instrument plus change notifications.
//!
//! Writers replace an instrument's entry atomically; readers see their own
//! writes per key. There is no ordering across keys. Two backends share one
//! trait: an in-process map and a Redis hash with pub/sub.

mod memory;
mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::market::{Action, Category, Decision, Instrument};

pub use memory::MemoryBus;
pub use remote::RedisBus;

/// Errors raised by bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("entry codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Admission label attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Admission {
    Allowed,
    Blocked { reason: String },
}

impl Admission {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Admission::Blocked {
            reason: reason.into(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Admission::Blocked { .. })
    }
}

/// Latest published state for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    pub symbol: String,
    pub category: Category,
    pub decision: Decision,
    pub admission: Admission,
    pub updated_at: DateTime<Utc>,
}

impl SignalEntry {
    pub fn new(
        instrument: &Instrument,
        decision: Decision,
        admission: Admission,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            category: instrument.category,
            decision,
            admission,
            updated_at,
        }
    }

    /// Entry written while the instrument's market window is closed.
    pub fn market_closed(instrument: &Instrument, updated_at: DateTime<Utc>) -> Self {
        Self::new(
            instrument,
            Decision::MarketClosed,
            Admission::Allowed,
            updated_at,
        )
    }

    pub fn action(&self) -> Action {
        self.decision.action()
    }
}

/// Shared store of the latest entry per instrument.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Replace the entry for `entry.symbol` and notify subscribers.
    ///
    /// Store and notify are attempted independently; a failed store is
    /// reported even when the notification went out.
    async fn put(&self, entry: SignalEntry) -> Result<(), BusError>;

    async fn get(&self, symbol: &str) -> Result<Option<SignalEntry>, BusError>;

    async fn get_all(&self) -> Result<HashMap<String, SignalEntry>, BusError>;

    /// Drop every entry. Administrative only.
    async fn clear(&self) -> Result<(), BusError>;

    /// Receive every entry written after this call.
    fn subscribe(&self) -> broadcast::Receiver<SignalEntry>;
}
