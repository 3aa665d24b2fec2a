//! Admission control: circuit breaker and correlation guard.
//!
//! Both checks are advisory. A denial labels the bus entry and suppresses the
//! open-position request; it never hides the decision itself.

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::RiskConfig;
use crate::market::Instrument;
use crate::persistence::{PositionJournal, PositionStatus};

/// Why an action was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum DenialReason {
    DailyLossLimit { loss: Decimal, limit: Decimal },
    ConsecutiveLosses { streak: u32, limit: u32 },
    CorrelatedExposure { group: String, open: usize, limit: usize },
    /// The journal could not be read; admission fails closed
    RiskStateUnavailable,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::DailyLossLimit { loss, limit } => {
                write!(f, "daily loss limit reached ({} >= {})", loss, limit)
            }
            DenialReason::ConsecutiveLosses { streak, limit } => {
                write!(f, "consecutive loss streak ({} >= {})", streak, limit)
            }
            DenialReason::CorrelatedExposure { group, open, limit } => write!(
                f,
                "correlated exposure in {} ({} open >= {})",
                group, open, limit
            ),
            DenialReason::RiskStateUnavailable => f.write_str("risk state unavailable"),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionCheck {
    Allowed,
    Denied(DenialReason),
}

impl AdmissionCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionCheck::Allowed)
    }

    /// Human-readable reason; "OK" when allowed.
    pub fn reason(&self) -> String {
        match self {
            AdmissionCheck::Allowed => "OK".to_string(),
            AdmissionCheck::Denied(reason) => reason.to_string(),
        }
    }
}

/// Snapshot of the inputs to the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskState {
    pub timestamp: DateTime<Utc>,
    /// Absolute realized loss since UTC midnight
    pub daily_loss: Decimal,
    pub daily_loss_limit: Decimal,
    /// Leading run of LOSS among the most recent closed positions
    pub loss_streak: u32,
}

/// Structured breaker event for log analysis.
#[derive(Debug, Serialize)]
struct BreakerEvent<'a> {
    event: &'static str,
    reason: Option<&'a DenialReason>,
    state: &'a RiskState,
}

/// Decides whether new risk may be taken.
pub struct AdmissionController {
    config: RiskConfig,
    journal: Arc<dyn PositionJournal>,
    /// Whether the breaker was open on the previous check
    tripped: AtomicBool,
}

impl AdmissionController {
    pub fn new(config: RiskConfig, journal: Arc<dyn PositionJournal>) -> Self {
        Self {
            config,
            journal,
            tripped: AtomicBool::new(false),
        }
    }

    fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive().and_time(NaiveTime::MIN).and_utc()
    }

    /// Leading LOSS run in a most-recent-first list.
    fn leading_losses(recent: &[PositionStatus]) -> u32 {
        recent
            .iter()
            .take_while(|status| **status == PositionStatus::Loss)
            .count() as u32
    }

    /// Recompute the circuit breaker inputs from closed-position history.
    pub async fn risk_state_at(&self, now: DateTime<Utc>) -> Result<RiskState> {
        let daily_loss = self
            .journal
            .daily_loss(Self::start_of_day(now))
            .await?
            .abs();
        let recent = self
            .journal
            .recent_closed(self.config.streak_lookback)
            .await?;

        Ok(RiskState {
            timestamp: now,
            daily_loss,
            daily_loss_limit: self.config.balance * self.config.max_daily_loss_pct,
            loss_streak: Self::leading_losses(&recent),
        })
    }

    pub async fn risk_state(&self) -> Result<RiskState> {
        self.risk_state_at(Utc::now()).await
    }

    /// Global circuit breaker evaluated as of `now`.
    pub async fn can_act_at(&self, now: DateTime<Utc>) -> AdmissionCheck {
        let state = match self.risk_state_at(now).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to load risk state, denying");
                return AdmissionCheck::Denied(DenialReason::RiskStateUnavailable);
            }
        };

        let check = if state.daily_loss >= state.daily_loss_limit {
            AdmissionCheck::Denied(DenialReason::DailyLossLimit {
                loss: state.daily_loss,
                limit: state.daily_loss_limit,
            })
        } else if state.loss_streak >= self.config.max_consecutive_losses {
            AdmissionCheck::Denied(DenialReason::ConsecutiveLosses {
                streak: state.loss_streak,
                limit: self.config.max_consecutive_losses,
            })
        } else {
            AdmissionCheck::Allowed
        };

        self.record_transition(&check, &state);
        check
    }

    /// Global circuit breaker.
    pub async fn can_act(&self) -> AdmissionCheck {
        self.can_act_at(Utc::now()).await
    }

    /// Correlation guard for a single instrument's group.
    #[instrument(skip(self, instrument), fields(symbol = %instrument.symbol))]
    pub async fn correlation_ok(&self, instrument: &Instrument) -> AdmissionCheck {
        let group = instrument.group();
        let open = match self.journal.open_in_group(group).await {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, group, "Failed to count open positions, denying");
                return AdmissionCheck::Denied(DenialReason::RiskStateUnavailable);
            }
        };

        if open >= self.config.max_correlated_positions {
            debug!(group, open, "Correlation limit reached");
            return AdmissionCheck::Denied(DenialReason::CorrelatedExposure {
                group: group.to_string(),
                open,
                limit: self.config.max_correlated_positions,
            });
        }

        AdmissionCheck::Allowed
    }

    /// Emit a structured event only when the breaker opens or closes.
    fn record_transition(&self, check: &AdmissionCheck, state: &RiskState) {
        let denied = !check.is_allowed();
        if self.tripped.swap(denied, Ordering::SeqCst) == denied {
            return;
        }

        let reason = match check {
            AdmissionCheck::Denied(reason) => Some(reason),
            AdmissionCheck::Allowed => None,
        };
        let event = BreakerEvent {
            event: if denied { "breaker_tripped" } else { "breaker_reset" },
            reason,
            state,
        };
        let json = serde_json::to_string(&event).unwrap_or_default();

        if denied {
            warn!(target: "risk_alert", "RISK_ALERT: {}", json);
        } else {
            info!(target: "risk_alert", "RISK_ALERT: {}", json);
        }
    }
}
