//! Outbound alerts for newly actionable signals.
//!
//! The scheduler enqueues a `SignalAlert` when an instrument enters an
//! actionable state; `AlertDispatcher` drains the queue and fans each alert
//! out to every configured sink. A failing sink never blocks the others.

mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::market::{Action, Category, Instrument, TradeSetup};

pub use telegram::TelegramAlertSink;

/// A transition into LONG or SHORT.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub category: Category,
    pub action: Action,
    /// Action observed before this transition
    pub previous: Action,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub confidence: f64,
    pub rationale: String,
}

impl SignalAlert {
    pub fn new(
        instrument: &Instrument,
        action: Action,
        previous: Action,
        setup: &TradeSetup,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let alert_id = format!(
            "signal-{}-{}-{}",
            instrument.symbol,
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );

        Self {
            alert_id,
            timestamp,
            symbol: instrument.symbol.clone(),
            category: instrument.category,
            action,
            previous,
            entry: setup.entry,
            stop: setup.stop,
            target: setup.target,
            confidence: setup.confidence,
            rationale: setup.rationale.clone(),
        }
    }
}

/// Delivery channel for alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, alert: &SignalAlert) -> Result<()>;
}

/// Emits each alert as one structured log line for log analysis.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, alert: &SignalAlert) -> Result<()> {
        let json = serde_json::to_string(alert)?;
        info!(target: "signal_alert", "SIGNAL_ALERT: {}", json);
        Ok(())
    }
}

/// Drains the alert queue into the configured sinks.
pub struct AlertDispatcher {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl AlertDispatcher {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    /// Deliver to every sink; returns how many succeeded.
    pub async fn dispatch(&self, alert: &SignalAlert) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.deliver(alert).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    sink = sink.name(),
                    symbol = %alert.symbol,
                    error = %e,
                    "Alert delivery failed"
                ),
            }
        }
        delivered
    }

    /// Run until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<SignalAlert>) {
        let mut dispatched = 0u64;
        while let Some(alert) = rx.recv().await {
            self.dispatch(&alert).await;
            dispatched += 1;
        }
        info!(dispatched, "Alert dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn alert() -> SignalAlert {
        let inst = Instrument::new("BTC-USD", Category::Crypto);
        let setup = TradeSetup::new(dec!(64000), dec!(63000), dec!(66000), 71.0)
            .with_rationale("breakout above range");
        SignalAlert::new(&inst, Action::Long, Action::None, &setup, Utc::now())
    }

    #[test]
    fn test_alert_fields() {
        let alert = alert();
        assert!(alert.alert_id.starts_with("signal-BTC-USD-"));
        assert_eq!(alert.action, Action::Long);
        assert_eq!(alert.previous, Action::None);
        assert_eq!(alert.stop, dec!(63000));

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["action"], "LONG");
        assert_eq!(json["category"], "CRYPTO");
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let mut failing = MockAlertSink::new();
        failing.expect_name().return_const("failing");
        failing
            .expect_deliver()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("connection refused")));

        let mut healthy = MockAlertSink::new();
        healthy.expect_name().return_const("healthy");
        healthy.expect_deliver().times(1).returning(|_| Ok(()));

        let dispatcher = AlertDispatcher::new(vec![
            Arc::new(failing),
            Arc::new(healthy),
            Arc::new(LogAlertSink),
        ]);

        assert_eq!(dispatcher.dispatch(&alert()).await, 2);
    }

    #[tokio::test]
    async fn test_dispatcher_drains_queue() {
        let mut sink = MockAlertSink::new();
        sink.expect_name().return_const("counting");
        sink.expect_deliver().times(3).returning(|_| Ok(()));

        let (tx, rx) = mpsc::channel(4);
        for _ in 0..3 {
            tx.send(alert()).await.unwrap();
        }
        drop(tx);

        AlertDispatcher::new(vec![Arc::new(sink)]).run(rx).await;
    }
}
