//! Position journal boundary.
//!
//! The pipeline needs four things from storage:
//! - Realized loss since a point in time and the most recent closed outcomes
//!   (circuit breaker inputs)
//! - Open position counts per correlation group (correlation guard input)
//! - A fast check for an existing OPEN position per symbol
//! - Idempotent creation of OPEN positions
//!
//! `SqliteJournal` is the bundled implementation. Duplicate opens are blocked
//! twice: a short-lived marker (`MarkerStore`) absorbs repeated claims from
//! consecutive scans, and the journal itself refuses a second OPEN row.

mod guard;
mod marker;
mod sqlite;
mod writer;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::market::Action;

pub use guard::{ClaimOutcome, OpenPositionGuard};
pub use marker::{MarkerStore, MemoryMarkerStore, RedisMarkerStore};
pub use sqlite::SqliteJournal;
pub use writer::PositionWriter;

/// Lifecycle status of a journaled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Win,
    Loss,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Win => "WIN",
            PositionStatus::Loss => "LOSS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(PositionStatus::Open),
            "WIN" => Some(PositionStatus::Win),
            "LOSS" => Some(PositionStatus::Loss),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An OPEN position requested by the scan scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPositionRecord {
    pub symbol: String,
    /// Correlation group at the time of opening
    pub group: String,
    pub action: Action,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub size: Decimal,
    pub confidence: f64,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
}

/// Result of an open-position creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// An OPEN position already exists for the symbol; nothing was written
    Duplicate,
}

/// Storage contract required by the admission controller and the
/// open-position path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PositionJournal: Send + Sync {
    /// Sum of absolute realized losses on positions closed as LOSS at or after `since`.
    async fn daily_loss(&self, since: DateTime<Utc>) -> Result<Decimal>;

    /// Statuses of the most recently closed positions, most recent first.
    async fn recent_closed(&self, limit: usize) -> Result<Vec<PositionStatus>>;

    /// Number of OPEN positions in a correlation group.
    async fn open_in_group(&self, group: &str) -> Result<usize>;

    /// Whether an OPEN position exists for `symbol`.
    async fn exists_open(&self, symbol: &str) -> Result<bool>;

    /// Create an OPEN position unless one already exists for the symbol.
    async fn create_open(&self, record: &OpenPositionRecord) -> Result<CreateOutcome>;
}
