//! Risk-budget position sizing.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::config::RiskConfig;
use crate::market::{Category, Instrument, TradeSetup};
use crate::utils::decimal::{floor_to, units_for};

/// Smallest tradable FX size, in lots.
const MIN_FX_LOTS: Decimal = dec!(0.01);

/// Converts a risk budget into a position size.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    balance: Decimal,
    risk_per_trade: Decimal,
}

impl PositionSizer {
    pub fn new(config: &RiskConfig) -> Self {
        Self {
            balance: config.balance,
            risk_per_trade: config.risk_per_trade,
        }
    }

    /// Amount of balance put at risk on one trade.
    pub fn risk_amount(&self) -> Decimal {
        self.balance
            .checked_mul(self.risk_per_trade)
            .unwrap_or(Decimal::ZERO)
    }

    /// Size for `setup`. A provider-supplied size wins; otherwise the risk
    /// budget is divided by the stop distance:
    ///
    /// - domestic equities: whole lots, zero below one lot
    /// - FX: lots rounded to 0.01 with a 0.01 floor
    /// - everything else: whole units
    ///
    /// Zero means the position should not be opened, including when the
    /// levels are too extreme to size within the `Decimal` range.
    pub fn size(&self, instrument: &Instrument, setup: &TradeSetup) -> Decimal {
        if let Some(size) = setup.size {
            return size.max(Decimal::ZERO);
        }

        let stop_distance = setup.stop_distance();
        if stop_distance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let risk = self.risk_amount();
        let lots_for = || {
            stop_distance
                .checked_mul(instrument.lot_multiplier)
                .map_or(Decimal::ZERO, |lot_risk| units_for(risk, lot_risk))
        };

        match instrument.category {
            Category::EquityDomestic => {
                let lots = lots_for().floor();
                if lots < Decimal::ONE {
                    Decimal::ZERO
                } else {
                    lots
                }
            }
            Category::Fx => {
                let lots = lots_for();
                if lots.is_zero() {
                    return Decimal::ZERO;
                }
                let lots = lots
                    .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
                lots.max(MIN_FX_LOTS)
            }
            _ => floor_to(units_for(risk, stop_distance), Decimal::ONE),
        }
    }
}
