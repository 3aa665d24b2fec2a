//! Decimal helpers for sizing arithmetic.

use rust_decimal::Decimal;

/// How many units `budget` buys when each unit costs `unit_cost`.
///
/// Non-positive costs, and quotients outside the `Decimal` range, buy nothing.
pub fn units_for(budget: Decimal, unit_cost: Decimal) -> Decimal {
    if unit_cost <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    budget.checked_div(unit_cost).unwrap_or(Decimal::ZERO)
}

/// Truncate toward the lower multiple of `step`. A zero step returns `value`.
pub fn floor_to(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    value
        .checked_div(step)
        .and_then(|steps| steps.floor().checked_mul(step))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_units_for() {
        assert_eq!(units_for(dec!(100), dec!(40)), dec!(2.5));
        assert_eq!(units_for(dec!(100), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(units_for(dec!(100), dec!(-1)), Decimal::ZERO);
        // Quotient overflows the representable range
        assert_eq!(units_for(dec!(1000), dec!(0.0000000000000000000000000001)), Decimal::ZERO);
    }

    #[test]
    fn test_floor_to() {
        assert_eq!(floor_to(dec!(7.99), dec!(1)), dec!(7));
        assert_eq!(floor_to(dec!(0.129), dec!(0.01)), dec!(0.12));
        assert_eq!(floor_to(dec!(3.3), Decimal::ZERO), dec!(3.3));
    }
}
