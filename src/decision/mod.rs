//! Decision providers.
//!
//! A provider turns an instrument into a `Decision`. It may be slow and it
//! may fail; the scan scheduler bounds every call with a timeout.

mod http;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::market::{Decision, Instrument};

pub use http::HttpDecisionProvider;

/// Context passed alongside each decision request.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionContext {
    pub now: DateTime<Utc>,
    /// Account balance the decision is sized against
    pub balance: Decimal,
}

/// Produces a decision for one instrument.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, instrument: &Instrument, ctx: &DecisionContext) -> Result<Decision>;
}

/// Provider used when no inference endpoint is configured: always holds.
#[derive(Debug, Default, Clone)]
pub struct HoldProvider;

#[async_trait]
impl DecisionProvider for HoldProvider {
    async fn decide(&self, _instrument: &Instrument, _ctx: &DecisionContext) -> Result<Decision> {
        Ok(Decision::none("No Model Trained"))
    }
}
