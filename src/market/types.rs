//! Instrument and decision types shared across the pipeline.

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

/// Instrument category; drives the trading session table and sizing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Domestic (IDX) equities, traded in whole lots
    EquityDomestic,
    /// Foreign equities, fractional or single-share units
    EquityForeign,
    Fx,
    Crypto,
    /// Anything the catalog could not classify
    #[serde(other)]
    Unknown,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::EquityDomestic => "EQUITY_DOMESTIC",
            Category::EquityForeign => "EQUITY_FOREIGN",
            Category::Fx => "FX",
            Category::Crypto => "CRYPTO",
            Category::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tradable instrument, immutable for the duration of a scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub category: Category,
    /// Price units per pip (10000 for most FX pairs, 100 for JPY pairs, 1 otherwise)
    pub pip_scale: Decimal,
    /// Units per lot (100 shares for IDX, 100k for a standard FX lot)
    pub lot_multiplier: Decimal,
    /// Correlation group; `None` falls back to the category
    pub group: Option<String>,
}

impl Instrument {
    /// Create an instrument with unit scaling.
    pub fn new(symbol: impl Into<String>, category: Category) -> Self {
        Self {
            symbol: symbol.into(),
            category,
            pip_scale: Decimal::ONE,
            lot_multiplier: Decimal::ONE,
            group: None,
        }
    }

    /// Set pip scale and lot multiplier.
    pub fn with_scaling(mut self, pip_scale: Decimal, lot_multiplier: Decimal) -> Self {
        self.pip_scale = pip_scale;
        self.lot_multiplier = lot_multiplier;
        self
    }

    /// Override the correlation group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Group used by the correlation guard.
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(self.category.as_str())
    }
}

/// Directional action of a decision, as observed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "MARKET CLOSED")]
    MarketClosed,
}

impl Action {
    pub fn is_actionable(&self) -> bool {
        matches!(self, Action::Long | Action::Short)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "NONE",
            Action::Long => "LONG",
            Action::Short => "SHORT",
            Action::MarketClosed => "MARKET CLOSED",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry/exit levels proposed by a decision provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSetup {
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    /// Confidence score in [0, 100]
    #[serde(deserialize_with = "clamped_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    /// Provider-suggested size; derived from risk budget when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
}

impl TradeSetup {
    pub fn new(entry: Decimal, stop: Decimal, target: Decimal, confidence: f64) -> Self {
        Self {
            entry,
            stop,
            target,
            confidence: confidence.clamp(0.0, 100.0),
            rationale: String::new(),
            size: None,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_size(mut self, size: Decimal) -> Self {
        self.size = Some(size);
        self
    }

    /// Absolute distance between entry and stop, zero when it overflows.
    pub fn stop_distance(&self) -> Decimal {
        self.entry
            .checked_sub(self.stop)
            .map_or(Decimal::ZERO, |d| d.abs())
    }
}

/// Provider confidence off the wire: non-finite values are rejected, the rest
/// clamped to [0, 100].
fn clamped_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if !raw.is_finite() {
        return Err(de::Error::custom(format!("confidence {} is not finite", raw)));
    }
    Ok(raw.clamp(0.0, 100.0))
}

/// Outcome of one evaluation for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Decision {
    #[serde(rename = "NONE")]
    None { reason: String },
    #[serde(rename = "LONG")]
    Long(TradeSetup),
    #[serde(rename = "SHORT")]
    Short(TradeSetup),
    /// Synthetic decision written while the instrument's market window is closed
    #[serde(rename = "MARKET CLOSED")]
    MarketClosed,
}

impl Decision {
    pub fn none(reason: impl Into<String>) -> Self {
        Decision::None {
            reason: reason.into(),
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Decision::None { .. } => Action::None,
            Decision::Long(_) => Action::Long,
            Decision::Short(_) => Action::Short,
            Decision::MarketClosed => Action::MarketClosed,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action().is_actionable()
    }

    pub fn setup(&self) -> Option<&TradeSetup> {
        match self {
            Decision::Long(setup) | Decision::Short(setup) => Some(setup),
            _ => None,
        }
    }
}
