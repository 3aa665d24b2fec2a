//! Background writer draining open-position requests into the journal.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{CreateOutcome, OpenPositionGuard, OpenPositionRecord, PositionJournal};

/// Consumes `OpenPositionRecord`s off the scheduler's hot path.
pub struct PositionWriter {
    journal: Arc<dyn PositionJournal>,
    guard: Arc<OpenPositionGuard>,
}

impl PositionWriter {
    pub fn new(journal: Arc<dyn PositionJournal>, guard: Arc<OpenPositionGuard>) -> Self {
        Self { journal, guard }
    }

    /// Drain `rx` until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<OpenPositionRecord>) {
        let mut created = 0u64;
        while let Some(record) = rx.recv().await {
            if self.write(&record).await == Some(CreateOutcome::Created) {
                created += 1;
            }
        }
        info!(created, "Position writer stopped");
    }

    /// Write one record. A failed write releases the symbol's marker so the
    /// next scan can retry.
    pub async fn write(&self, record: &OpenPositionRecord) -> Option<CreateOutcome> {
        match self.journal.create_open(record).await {
            Ok(CreateOutcome::Created) => {
                info!(
                    symbol = %record.symbol,
                    action = %record.action,
                    entry = %record.entry,
                    size = %record.size,
                    "📝 Opened position"
                );
                Some(CreateOutcome::Created)
            }
            Ok(CreateOutcome::Duplicate) => {
                warn!(symbol = %record.symbol, "Open position already exists, skipping");
                Some(CreateOutcome::Duplicate)
            }
            Err(e) => {
                error!(symbol = %record.symbol, error = %e, "Failed to record open position");
                if let Err(e) = self.guard.release(&record.symbol).await {
                    warn!(symbol = %record.symbol, error = %e, "Failed to release open marker");
                }
                None
            }
        }
    }
}
