//! SQLite position journal.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{CreateOutcome, OpenPositionRecord, PositionJournal, PositionStatus};
use crate::market::Action;

/// Charged against the daily limit for a LOSS closed without a usable pnl.
const UNPRICED_LOSS: Decimal = dec!(5);

/// SQLite-backed journal of opened and closed positions.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort lexicographically.
fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_action(value: &str) -> Action {
    match value {
        "LONG" => Action::Long,
        "SHORT" => Action::Short,
        _ => Action::None,
    }
}

impl SqliteJournal {
    /// Open (or create) the journal at `db_path`. Use `":memory:"` for tests.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.init_schema()?;

        info!("Position journal initialized at {:?}", db_path.as_ref());
        Ok(journal)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("journal connection lock poisoned"))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                grouping TEXT NOT NULL,
                action TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                stop_loss TEXT NOT NULL,
                take_profit TEXT NOT NULL,
                size TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL,
                pnl TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT
            );

            -- At most one OPEN position per symbol
            CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_one_open
                ON positions(symbol) WHERE status = 'OPEN';
            CREATE INDEX IF NOT EXISTS idx_positions_closed ON positions(status, closed_at);
            CREATE INDEX IF NOT EXISTS idx_positions_group ON positions(grouping, status);
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    /// Close the OPEN position for `symbol` as WIN or LOSS.
    ///
    /// Returns false when no OPEN position exists.
    pub fn close_position(
        &self,
        symbol: &str,
        outcome: PositionStatus,
        pnl: Decimal,
        closed_at: DateTime<Utc>,
    ) -> Result<bool> {
        anyhow::ensure!(
            outcome != PositionStatus::Open,
            "a position can only be closed as WIN or LOSS"
        );

        let updated = self.conn()?.execute(
            r#"
            UPDATE positions SET status = ?1, pnl = ?2, closed_at = ?3
            WHERE symbol = ?4 AND status = 'OPEN'
            "#,
            params![
                outcome.as_str(),
                pnl.to_string(),
                to_db_time(closed_at),
                symbol
            ],
        )?;

        if updated == 0 {
            warn!(symbol, "No open position to close");
        } else {
            info!(symbol, outcome = %outcome, pnl = %pnl, "Position closed");
        }
        Ok(updated > 0)
    }

    /// All currently OPEN positions, oldest first.
    pub fn list_open(&self) -> Result<Vec<OpenPositionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, grouping, action, entry_price, stop_loss, take_profit,
                   size, confidence, created_at
            FROM positions WHERE status = 'OPEN'
            ORDER BY created_at ASC, id ASC
            "#,
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(OpenPositionRecord {
                    symbol: row.get(0)?,
                    group: row.get(1)?,
                    action: parse_action(&row.get::<_, String>(2)?),
                    entry: Decimal::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                    stop: Decimal::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
                    target: Decimal::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
                    size: Decimal::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
                    confidence: row.get(7)?,
                    status: PositionStatus::Open,
                    created_at: from_db_time(&row.get::<_, String>(8)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(records)
    }
}

#[async_trait]
impl PositionJournal for SqliteJournal {
    async fn daily_loss(&self, since: DateTime<Utc>) -> Result<Decimal> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pnl FROM positions WHERE status = 'LOSS' AND closed_at >= ?1",
        )?;

        let total = stmt
            .query_map([to_db_time(since)], |row| row.get::<_, Option<String>>(0))?
            .filter_map(|r| r.ok())
            .map(|pnl| {
                pnl.and_then(|p| Decimal::from_str(&p).ok())
                    .filter(|p| !p.is_zero())
                    .map_or(UNPRICED_LOSS, |p| p.abs())
            })
            .sum();

        Ok(total)
    }

    async fn recent_closed(&self, limit: usize) -> Result<Vec<PositionStatus>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT status FROM positions
            WHERE status IN ('WIN', 'LOSS')
            ORDER BY closed_at DESC, id DESC
            LIMIT ?1
            "#,
        )?;

        let statuses = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| PositionStatus::parse(&s))
            .collect();

        Ok(statuses)
    }

    async fn open_in_group(&self, group: &str) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM positions WHERE status = 'OPEN' AND grouping = ?1",
            [group],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn exists_open(&self, symbol: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM positions WHERE status = 'OPEN' AND symbol = ?1",
            [symbol],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn create_open(&self, record: &OpenPositionRecord) -> Result<CreateOutcome> {
        // The partial unique index turns a second OPEN row into a no-op
        let inserted = self.conn()?.execute(
            r#"
            INSERT OR IGNORE INTO positions (symbol, grouping, action, entry_price, stop_loss,
                                             take_profit, size, confidence, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'OPEN', ?9)
            "#,
            params![
                record.symbol,
                record.group,
                record.action.as_str(),
                record.entry.to_string(),
                record.stop.to_string(),
                record.target.to_string(),
                record.size.to_string(),
                record.confidence,
                to_db_time(record.created_at),
            ],
        )?;

        if inserted == 0 {
            return Ok(CreateOutcome::Duplicate);
        }

        debug!(symbol = %record.symbol, action = %record.action, "Open position recorded");
        Ok(CreateOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn record(symbol: &str, group: &str) -> OpenPositionRecord {
        OpenPositionRecord {
            symbol: symbol.to_string(),
            group: group.to_string(),
            action: Action::Long,
            entry: dec!(1.1000),
            stop: dec!(1.0950),
            target: dec!(1.1100),
            size: dec!(0.2),
            confidence: 75.0,
            status: PositionStatus::Open,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_open_is_idempotent() {
        let journal = SqliteJournal::new(":memory:").unwrap();

        let first = journal.create_open(&record("EURUSD=X", "FX")).await.unwrap();
        let second = journal.create_open(&record("EURUSD=X", "FX")).await.unwrap();

        assert_eq!(first, CreateOutcome::Created);
        assert_eq!(second, CreateOutcome::Duplicate);
        assert_eq!(journal.list_open().unwrap().len(), 1);
        assert!(journal.exists_open("EURUSD=X").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let journal = SqliteJournal::new(":memory:").unwrap();

        journal.create_open(&record("BTC-USD", "CRYPTO")).await.unwrap();
        assert!(journal
            .close_position("BTC-USD", PositionStatus::Win, dec!(12.5), Utc::now())
            .unwrap());
        assert!(!journal.exists_open("BTC-USD").await.unwrap());

        let outcome = journal.create_open(&record("BTC-USD", "CRYPTO")).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
    }

    #[tokio::test]
    async fn test_close_without_open_position() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        let closed = journal
            .close_position("AAPL", PositionStatus::Loss, dec!(-3), Utc::now())
            .unwrap();
        assert!(!closed);
        assert!(journal
            .close_position("AAPL", PositionStatus::Open, dec!(0), Utc::now())
            .is_err());
    }

    #[tokio::test]
    async fn test_daily_loss_counts_only_losses_since_cutoff() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        let now = Utc::now();

        for (symbol, status, pnl, closed_at) in [
            ("A", PositionStatus::Loss, dec!(-10), now - Duration::days(2)),
            ("B", PositionStatus::Loss, dec!(-15.5), now),
            ("C", PositionStatus::Win, dec!(40), now),
            ("D", PositionStatus::Loss, dec!(-4.5), now),
        ] {
            journal.create_open(&record(symbol, "G")).await.unwrap();
            journal.close_position(symbol, status, pnl, closed_at).unwrap();
        }

        let loss = journal.daily_loss(now - Duration::hours(1)).await.unwrap();
        assert_eq!(loss, dec!(20.0));
    }

    #[tokio::test]
    async fn test_daily_loss_charges_unpriced_losses() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        let now = Utc::now();

        journal.create_open(&record("A", "G")).await.unwrap();
        journal
            .close_position("A", PositionStatus::Loss, Decimal::ZERO, now)
            .unwrap();
        journal.create_open(&record("B", "G")).await.unwrap();
        journal
            .close_position("B", PositionStatus::Loss, dec!(-2), now)
            .unwrap();

        // Row closed outside the CLI with no pnl recorded
        journal.create_open(&record("C", "G")).await.unwrap();
        journal
            .conn()
            .unwrap()
            .execute(
                "UPDATE positions SET status = 'LOSS', pnl = NULL, closed_at = ?1 WHERE symbol = 'C'",
                [to_db_time(now)],
            )
            .unwrap();

        let loss = journal.daily_loss(now - Duration::hours(1)).await.unwrap();
        assert_eq!(loss, dec!(12));
    }

    #[tokio::test]
    async fn test_recent_closed_most_recent_first() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        let now = Utc::now();

        for (i, status) in [PositionStatus::Win, PositionStatus::Loss, PositionStatus::Loss]
            .into_iter()
            .enumerate()
        {
            journal.create_open(&record("X", "G")).await.unwrap();
            journal
                .close_position("X", status, dec!(1), now + Duration::seconds(i as i64))
                .unwrap();
        }

        let recent = journal.recent_closed(10).await.unwrap();
        assert_eq!(
            recent,
            vec![PositionStatus::Loss, PositionStatus::Loss, PositionStatus::Win]
        );
        assert_eq!(journal.recent_closed(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_in_group() {
        let journal = SqliteJournal::new(":memory:").unwrap();
        journal.create_open(&record("BBCA.JK", "BANKING")).await.unwrap();
        journal.create_open(&record("BBRI.JK", "BANKING")).await.unwrap();
        journal.create_open(&record("TLKM.JK", "TELCO")).await.unwrap();

        assert_eq!(journal.open_in_group("BANKING").await.unwrap(), 2);
        assert_eq!(journal.open_in_group("TELCO").await.unwrap(), 1);
        assert_eq!(journal.open_in_group("FX").await.unwrap(), 0);
    }
}
