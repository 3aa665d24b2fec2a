//! Per-instrument evaluation: gate, admit, decide, publish, persist.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::alerts::SignalAlert;
use crate::bus::{Admission, BusError, SignalBus, SignalEntry};
use crate::config::RiskConfig;
use crate::decision::{DecisionContext, DecisionProvider};
use crate::market::{window, Action, Decision, Instrument};
use crate::persistence::{ClaimOutcome, OpenPositionGuard, OpenPositionRecord, PositionStatus};
use crate::risk::{AdmissionCheck, AdmissionController, PositionSizer};

/// Why an instrument could not be evaluated this cycle.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("decision timed out after {0:?}")]
    Timeout(Duration),
    #[error("decision provider failed: {0}")]
    Provider(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// What happened to one instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentOutcome {
    /// Market window closed; `MARKET CLOSED` written
    MarketClosed,
    /// Circuit breaker open; provider not consulted
    Halted { reason: String },
    Decided {
        action: Action,
        admission: Admission,
        alerted: bool,
        open_requested: bool,
    },
}

/// Outbound queues fed by the evaluator.
#[derive(Clone)]
pub struct EvaluatorQueues {
    pub alerts: mpsc::Sender<SignalAlert>,
    pub positions: mpsc::Sender<OpenPositionRecord>,
}

/// Runs the sequential per-instrument steps of a scan cycle.
pub struct InstrumentEvaluator {
    bus: Arc<dyn SignalBus>,
    provider: Arc<dyn DecisionProvider>,
    admission: Arc<AdmissionController>,
    guard: Arc<OpenPositionGuard>,
    sizer: PositionSizer,
    balance: Decimal,
    decision_timeout: Duration,
    queues: EvaluatorQueues,
}

impl InstrumentEvaluator {
    pub fn new(
        bus: Arc<dyn SignalBus>,
        provider: Arc<dyn DecisionProvider>,
        admission: Arc<AdmissionController>,
        guard: Arc<OpenPositionGuard>,
        risk: &RiskConfig,
        decision_timeout: Duration,
        queues: EvaluatorQueues,
    ) -> Self {
        Self {
            bus,
            provider,
            admission,
            guard,
            sizer: PositionSizer::new(risk),
            balance: risk.balance,
            decision_timeout,
            queues,
        }
    }

    /// Evaluate `instrument` as of `now`.
    ///
    /// On error the bus entry is left untouched.
    pub async fn evaluate(
        &self,
        instrument: &Instrument,
        now: DateTime<Utc>,
    ) -> Result<InstrumentOutcome, EvaluationError> {
        let symbol = instrument.symbol.as_str();

        if !window::is_open(instrument.category, now) {
            debug!(symbol, category = %instrument.category, "Market closed");
            self.bus
                .put(SignalEntry::market_closed(instrument, now))
                .await?;
            return Ok(InstrumentOutcome::MarketClosed);
        }

        let prior = self.bus.get(symbol).await?;

        if let AdmissionCheck::Denied(reason) = self.admission.can_act_at(now).await {
            let reason = reason.to_string();
            // Keep whatever was last published; only the label changes
            let decision = match &prior {
                Some(entry) => entry.decision.clone(),
                None => Decision::none(reason.clone()),
            };
            self.bus
                .put(SignalEntry::new(
                    instrument,
                    decision,
                    Admission::blocked(reason.clone()),
                    now,
                ))
                .await?;
            info!(symbol, %reason, "Trading halted, decision skipped");
            return Ok(InstrumentOutcome::Halted { reason });
        }

        let ctx = DecisionContext {
            now,
            balance: self.balance,
        };
        let decided = timeout(self.decision_timeout, self.provider.decide(instrument, &ctx)).await;
        let decision = match decided {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => return Err(EvaluationError::Provider(format!("{:#}", e))),
            Err(_) => return Err(EvaluationError::Timeout(self.decision_timeout)),
        };
        let action = decision.action();

        let admission = if decision.is_actionable() {
            match self.admission.correlation_ok(instrument).await {
                AdmissionCheck::Allowed => Admission::Allowed,
                AdmissionCheck::Denied(reason) => {
                    info!(symbol, %action, %reason, "Signal blocked");
                    Admission::blocked(reason.to_string())
                }
            }
        } else {
            Admission::Allowed
        };

        let previous = prior.as_ref().map(|p| p.action()).unwrap_or(Action::None);
        let entering = action.is_actionable() && previous != action;

        self.bus
            .put(SignalEntry::new(
                instrument,
                decision.clone(),
                admission.clone(),
                now,
            ))
            .await?;

        let mut alerted = false;
        if let Some(setup) = decision.setup().filter(|_| entering) {
            let alert = SignalAlert::new(instrument, action, previous, setup, now);
            match self.queues.alerts.send(alert).await {
                Ok(()) => alerted = true,
                Err(_) => warn!(symbol, "Alert queue closed, alert dropped"),
            }
        }

        let open_requested = if admission.is_blocked() {
            false
        } else {
            self.request_open(instrument, &decision, now).await
        };

        Ok(InstrumentOutcome::Decided {
            action,
            admission,
            alerted,
            open_requested,
        })
    }

    /// Claim and enqueue an OPEN position for an actionable decision.
    async fn request_open(
        &self,
        instrument: &Instrument,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> bool {
        let symbol = instrument.symbol.as_str();
        let Some(setup) = decision.setup() else {
            return false;
        };

        match self.guard.try_claim(symbol).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(outcome) => {
                debug!(symbol, ?outcome, "Open position not requested");
                return false;
            }
            Err(e) => {
                warn!(symbol, error = %e, "Open position claim failed");
                return false;
            }
        }

        let size = self.sizer.size(instrument, setup);
        if size <= Decimal::ZERO {
            info!(symbol, "Position size rounds to zero, not opening");
            if let Err(e) = self.guard.release(symbol).await {
                warn!(symbol, error = %e, "Failed to release open marker");
            }
            return false;
        }

        let record = OpenPositionRecord {
            symbol: symbol.to_string(),
            group: instrument.group().to_string(),
            action: decision.action(),
            entry: setup.entry,
            stop: setup.stop,
            target: setup.target,
            size,
            confidence: setup.confidence,
            status: PositionStatus::Open,
            created_at: now,
        };

        if self.queues.positions.send(record).await.is_err() {
            warn!(symbol, "Position queue closed, open dropped");
            if let Err(e) = self.guard.release(symbol).await {
                warn!(symbol, error = %e, "Failed to release open marker");
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::decision::MockDecisionProvider;
    use crate::market::{infer_instrument, Category, TradeSetup};
    use crate::persistence::{MemoryMarkerStore, PositionJournal, SqliteJournal};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    /// Returns queued decisions in order, then holds.
    struct ScriptedProvider {
        script: Mutex<Vec<Decision>>,
    }

    impl ScriptedProvider {
        fn new(mut script: Vec<Decision>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl DecisionProvider for ScriptedProvider {
        async fn decide(
            &self,
            _instrument: &Instrument,
            _ctx: &DecisionContext,
        ) -> anyhow::Result<Decision> {
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Decision::none("AI Hold")))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl DecisionProvider for SlowProvider {
        async fn decide(
            &self,
            _instrument: &Instrument,
            _ctx: &DecisionContext,
        ) -> anyhow::Result<Decision> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Decision::none("too late"))
        }
    }

    struct Harness {
        evaluator: InstrumentEvaluator,
        bus: Arc<MemoryBus>,
        journal: Arc<SqliteJournal>,
        alerts: mpsc::Receiver<SignalAlert>,
        positions: mpsc::Receiver<OpenPositionRecord>,
    }

    fn risk_config() -> RiskConfig {
        RiskConfig {
            balance: dec!(1000),
            max_daily_loss_pct: dec!(0.05),
            max_consecutive_losses: 5,
            streak_lookback: 10,
            max_correlated_positions: 2,
            risk_per_trade: dec!(0.01),
        }
    }

    fn harness(provider: Arc<dyn DecisionProvider>) -> Harness {
        let bus = Arc::new(MemoryBus::new(64));
        let journal = Arc::new(SqliteJournal::new(":memory:").unwrap());
        let admission = Arc::new(AdmissionController::new(risk_config(), journal.clone()));
        let guard = Arc::new(OpenPositionGuard::new(
            journal.clone(),
            Arc::new(MemoryMarkerStore::new()),
            Duration::from_secs(120),
        ));
        let (alerts_tx, alerts) = mpsc::channel(16);
        let (positions_tx, positions) = mpsc::channel(16);

        let evaluator = InstrumentEvaluator::new(
            bus.clone(),
            provider,
            admission,
            guard,
            &risk_config(),
            Duration::from_millis(50),
            EvaluatorQueues {
                alerts: alerts_tx,
                positions: positions_tx,
            },
        );

        Harness {
            evaluator,
            bus,
            journal,
            alerts,
            positions,
        }
    }

    fn long() -> Decision {
        Decision::Long(TradeSetup::new(dec!(100), dec!(98), dec!(106), 70.0))
    }

    fn short() -> Decision {
        Decision::Short(TradeSetup::new(dec!(100), dec!(102), dec!(94), 64.0))
    }

    fn saturday() -> DateTime<Utc> {
        // 2024-06-08 10:00 UTC+7
        Utc.with_ymd_and_hms(2024, 6, 8, 3, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fx_closed_on_saturday_crypto_evaluated() {
        let mut provider = MockDecisionProvider::new();
        provider
            .expect_decide()
            .withf(|inst, _| inst.symbol == "BTC-USD")
            .times(1)
            .returning(|_, _| Ok(Decision::none("AI Hold")));
        let h = harness(Arc::new(provider));

        let fx = infer_instrument("EURUSD=X");
        let crypto = infer_instrument("BTC-USD");

        let fx_outcome = h.evaluator.evaluate(&fx, saturday()).await.unwrap();
        let crypto_outcome = h.evaluator.evaluate(&crypto, saturday()).await.unwrap();

        assert_eq!(fx_outcome, InstrumentOutcome::MarketClosed);
        assert_eq!(
            h.bus.get("EURUSD=X").await.unwrap().unwrap().action(),
            Action::MarketClosed
        );
        assert!(matches!(
            crypto_outcome,
            InstrumentOutcome::Decided {
                action: Action::None,
                ..
            }
        ));
        assert_eq!(
            h.bus.get("BTC-USD").await.unwrap().unwrap().decision,
            Decision::none("AI Hold")
        );
    }

    #[tokio::test]
    async fn test_hold_to_buy_alerts_once() {
        let provider = ScriptedProvider::new(vec![
            Decision::none("AI Hold"),
            long(),
            long(),
        ]);
        let mut h = harness(Arc::new(provider));
        let inst = Instrument::new("ETH-USD", Category::Crypto);

        for _ in 0..3 {
            h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        }

        let alert = h.alerts.try_recv().unwrap();
        assert_eq!(alert.action, Action::Long);
        assert_eq!(alert.previous, Action::None);
        assert!(h.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hold_to_hold_no_alert() {
        let mut h = harness(Arc::new(ScriptedProvider::new(vec![])));
        let inst = Instrument::new("ETH-USD", Category::Crypto);

        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();

        assert!(h.alerts.try_recv().is_err());
        assert!(h.positions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flip_alerts_again() {
        let provider = ScriptedProvider::new(vec![long(), short()]);
        let mut h = harness(Arc::new(provider));
        let inst = Instrument::new("SOL-USD", Category::Crypto);

        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();

        assert_eq!(h.alerts.try_recv().unwrap().action, Action::Long);
        let flip = h.alerts.try_recv().unwrap();
        assert_eq!(flip.action, Action::Short);
        assert_eq!(flip.previous, Action::Long);
    }

    #[tokio::test]
    async fn test_repeated_buy_opens_once() {
        let provider = ScriptedProvider::new(vec![long(), long(), long()]);
        let mut h = harness(Arc::new(provider));
        let inst = Instrument::new("ETH-USD", Category::Crypto);

        let first = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();

        assert!(matches!(
            first,
            InstrumentOutcome::Decided {
                open_requested: true,
                ..
            }
        ));
        let record = h.positions.try_recv().unwrap();
        assert_eq!(record.symbol, "ETH-USD");
        // 10 risk / 2 stop distance
        assert_eq!(record.size, dec!(5));
        assert!(h.positions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_breaker_relabels_prior_without_calling_provider() {
        let mut provider = MockDecisionProvider::new();
        provider.expect_decide().times(0);
        let h = harness(Arc::new(provider));
        let inst = Instrument::new("BTC-USD", Category::Crypto);

        let prior = SignalEntry::new(&inst, long(), Admission::Allowed, Utc::now());
        h.bus.put(prior).await.unwrap();

        // Today's losses exceed 5% of 1000
        let now = Utc::now();
        let record = OpenPositionRecord {
            symbol: "XRP-USD".to_string(),
            group: "CRYPTO".to_string(),
            action: Action::Long,
            entry: dec!(1),
            stop: dec!(0.9),
            target: dec!(1.2),
            size: dec!(100),
            confidence: 50.0,
            status: PositionStatus::Open,
            created_at: now,
        };
        h.journal.create_open(&record).await.unwrap();
        h.journal
            .close_position("XRP-USD", PositionStatus::Loss, dec!(-60), now)
            .unwrap();

        let outcome = h.evaluator.evaluate(&inst, now).await.unwrap();
        assert!(matches!(outcome, InstrumentOutcome::Halted { ref reason } if reason.contains("daily loss limit")));

        let entry = h.bus.get("BTC-USD").await.unwrap().unwrap();
        assert_eq!(entry.decision, long());
        assert!(entry.admission.is_blocked());
    }

    #[tokio::test]
    async fn test_breaker_without_prior_writes_none() {
        let mut provider = MockDecisionProvider::new();
        provider.expect_decide().times(0);
        let h = harness(Arc::new(provider));

        let now = Utc::now();
        for i in 0..5 {
            let symbol = format!("L{}", i);
            let record = OpenPositionRecord {
                symbol: symbol.clone(),
                group: "CRYPTO".to_string(),
                action: Action::Long,
                entry: dec!(1),
                stop: dec!(0.9),
                target: dec!(1.2),
                size: dec!(1),
                confidence: 50.0,
                status: PositionStatus::Open,
                created_at: now,
            };
            h.journal.create_open(&record).await.unwrap();
            h.journal
                .close_position(&symbol, PositionStatus::Loss, dec!(-1), now)
                .unwrap();
        }

        let inst = Instrument::new("BTC-USD", Category::Crypto);
        h.evaluator.evaluate(&inst, now).await.unwrap();

        let entry = h.bus.get("BTC-USD").await.unwrap().unwrap();
        match entry.decision {
            Decision::None { reason } => assert!(reason.contains("consecutive loss streak")),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_correlation_block_publishes_but_does_not_open() {
        let provider = ScriptedProvider::new(vec![long()]);
        let mut h = harness(Arc::new(provider));

        for symbol in ["BBCA.JK", "BBRI.JK"] {
            let record = OpenPositionRecord {
                symbol: symbol.to_string(),
                group: "BANKING".to_string(),
                action: Action::Long,
                entry: dec!(9000),
                stop: dec!(8900),
                target: dec!(9300),
                size: dec!(1),
                confidence: 60.0,
                status: PositionStatus::Open,
                created_at: Utc::now(),
            };
            h.journal.create_open(&record).await.unwrap();
        }

        let inst = Instrument::new("BMRI", Category::Crypto).with_group("BANKING");
        let outcome = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();

        match outcome {
            InstrumentOutcome::Decided {
                admission,
                alerted,
                open_requested,
                ..
            } => {
                assert!(admission.is_blocked());
                assert!(alerted);
                assert!(!open_requested);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.bus.get("BMRI").await.unwrap().unwrap().decision, long());
        assert!(h.positions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_prior_entry() {
        let mut provider = MockDecisionProvider::new();
        provider
            .expect_decide()
            .returning(|_, _| Err(anyhow::anyhow!("model unavailable")));
        let h = harness(Arc::new(provider));
        let inst = Instrument::new("BTC-USD", Category::Crypto);

        let prior = SignalEntry::new(&inst, short(), Admission::Allowed, Utc::now());
        h.bus.put(prior.clone()).await.unwrap();

        let err = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Provider(ref msg) if msg.contains("model unavailable")));
        assert_eq!(h.bus.get("BTC-USD").await.unwrap(), Some(prior));
    }

    #[tokio::test]
    async fn test_provider_timeout() {
        let h = harness(Arc::new(SlowProvider));
        let inst = Instrument::new("BTC-USD", Category::Crypto);

        let err = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Timeout(_)));
        assert!(h.bus.get("BTC-USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsizable_levels_release_the_claim() {
        let tiny_stop = Decision::Long(TradeSetup::new(
            dec!(0.0000000000000000000000000002),
            dec!(0.0000000000000000000000000001),
            dec!(1),
            50.0,
        ));
        let provider = ScriptedProvider::new(vec![tiny_stop, long()]);
        let mut h = harness(Arc::new(provider));
        let inst = Instrument::new("BTC-USD", Category::Crypto);

        let first = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        assert!(matches!(
            first,
            InstrumentOutcome::Decided {
                open_requested: false,
                ..
            }
        ));
        assert!(h.positions.try_recv().is_err());

        // The marker was released, so the next sane setup opens right away
        let second = h.evaluator.evaluate(&inst, Utc::now()).await.unwrap();
        assert!(matches!(
            second,
            InstrumentOutcome::Decided {
                open_requested: true,
                ..
            }
        ));
        assert_eq!(h.positions.try_recv().unwrap().size, dec!(5));
    }
}
