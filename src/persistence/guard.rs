//! Idempotent open-position claims.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{MarkerStore, PositionJournal};

/// Outcome of a claim attempt for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller may request an OPEN position
    Claimed,
    /// A recent claim is still pending
    Pending,
    /// The journal already holds an OPEN position
    AlreadyOpen,
}

/// Combines the marker store and the journal so each actionable decision
/// results in at most one OPEN position per symbol.
pub struct OpenPositionGuard {
    journal: Arc<dyn PositionJournal>,
    markers: Arc<dyn MarkerStore>,
    ttl: Duration,
}

impl OpenPositionGuard {
    pub fn new(
        journal: Arc<dyn PositionJournal>,
        markers: Arc<dyn MarkerStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            journal,
            markers,
            ttl,
        }
    }

    fn marker_key(symbol: &str) -> String {
        format!("open_marker:{}", symbol)
    }

    /// Claim the right to open a position for `symbol`.
    ///
    /// The marker is set first; if the journal already has an OPEN position the
    /// marker stays in place until it expires. A failed journal lookup drops
    /// the marker again so the next cycle can retry.
    pub async fn try_claim(&self, symbol: &str) -> Result<ClaimOutcome> {
        if !self
            .markers
            .set_if_absent(&Self::marker_key(symbol), self.ttl)
            .await?
        {
            debug!(symbol, "Open already requested recently");
            return Ok(ClaimOutcome::Pending);
        }

        match self.journal.exists_open(symbol).await {
            Ok(true) => {
                debug!(symbol, "Open position already journaled");
                Ok(ClaimOutcome::AlreadyOpen)
            }
            Ok(false) => Ok(ClaimOutcome::Claimed),
            Err(e) => {
                if let Err(release_err) = self.release(symbol).await {
                    warn!(symbol, error = %release_err, "Failed to release open marker");
                }
                Err(e)
            }
        }
    }

    /// Drop the marker so the next cycle may claim again.
    pub async fn release(&self, symbol: &str) -> Result<()> {
        self.markers.remove(&Self::marker_key(symbol)).await
    }
}
