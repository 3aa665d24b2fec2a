//! Instrument universe sources.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use super::{Category, Instrument};
use crate::config::InstrumentSpec;

/// Source of the instrument universe scanned each cycle.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstrumentCatalog: Send + Sync {
    /// List the instruments to evaluate. An empty list is valid.
    async fn list_instruments(&self) -> Result<Vec<Instrument>>;
}

/// Symbols scanned when no universe is configured.
const DEFAULT_UNIVERSE: &[&str] = &[
    "EURUSD=X", "JPY=X", "GBPUSD=X", "AUDUSD=X", // FX majors
    "BBCA.JK", "BBRI.JK", "TLKM.JK", "ASII.JK", "GOTO.JK", // IDX
    "BTC-USD", "ETH-USD", // Crypto
];

/// Foreign equities in the default universe, which symbol inference would
/// otherwise classify as crypto.
const DEFAULT_FOREIGN_EQUITIES: &[&str] = &["AAPL", "NVDA"];

/// Infer category and scaling from the symbol's naming convention.
///
/// - `*.JK` → domestic equity, 100-share lots
/// - `*=X`  → FX, 100k-unit lots, pip scale 100 for JPY pairs and 10000 otherwise
/// - anything else → crypto, unit scaling
pub fn infer_instrument(symbol: &str) -> Instrument {
    if symbol.ends_with(".JK") {
        return Instrument::new(symbol, Category::EquityDomestic)
            .with_scaling(Decimal::ONE, dec!(100));
    }

    if symbol.contains("=X") {
        let pip_scale = if symbol.contains("JPY") {
            dec!(100)
        } else {
            dec!(10000)
        };
        return Instrument::new(symbol, Category::Fx).with_scaling(pip_scale, dec!(100000));
    }

    Instrument::new(symbol, Category::Crypto)
}

/// Catalog backed by configuration, with symbol-based inference for any
/// field left unspecified.
pub struct StaticCatalog {
    instruments: Vec<Instrument>,
}

impl StaticCatalog {
    /// Build from configured instrument entries.
    pub fn from_specs(specs: &[InstrumentSpec]) -> Self {
        let instruments = specs.iter().map(Self::resolve).collect();
        Self { instruments }
    }

    /// Build a catalog holding exactly these instruments.
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self { instruments }
    }

    /// The built-in universe: FX majors, IDX blue chips, US tech, crypto majors.
    pub fn default_universe() -> Self {
        let mut instruments: Vec<Instrument> =
            DEFAULT_UNIVERSE.iter().map(|s| infer_instrument(s)).collect();
        instruments.extend(
            DEFAULT_FOREIGN_EQUITIES
                .iter()
                .map(|s| Instrument::new(*s, Category::EquityForeign)),
        );
        Self { instruments }
    }

    fn resolve(spec: &InstrumentSpec) -> Instrument {
        let inferred = infer_instrument(&spec.symbol);

        let mut instrument = match spec.category {
            // Explicit category wins; keep inferred scaling only if it was for the same category
            Some(category) if category != inferred.category => {
                Instrument::new(spec.symbol.clone(), category)
            }
            _ => inferred,
        };

        if let Some(pip_scale) = spec.pip_scale {
            instrument.pip_scale = pip_scale;
        }
        if let Some(lot_multiplier) = spec.lot_multiplier {
            instrument.lot_multiplier = lot_multiplier;
        }
        if let Some(group) = &spec.group {
            instrument.group = Some(group.clone());
        }

        instrument
    }
}

#[async_trait]
impl InstrumentCatalog for StaticCatalog {
    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        debug!(count = self.instruments.len(), "Listing static instrument universe");
        Ok(self.instruments.clone())
    }
}
