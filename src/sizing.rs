// =============================================================================
// Sizing Engine — capital-ceiling sizing with coarser-step cross-venue alignment
// =============================================================================
//
// Mirrors strategy_logic.py's calculate_position_size: a pure function of the
// desired notional, leverage, both venues' balances, and both venues'
// lot-step/min-notional floors. No I/O, fully testable in isolation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::decimal_math::{coarser_step, floor_to};
use crate::error::EngineError;
use crate::types::VenueId;

/// Safety buffer applied to the smaller venue's capital ceiling.
const CAPITAL_SAFETY_BUFFER: Decimal = dec!(0.95);

/// Minimum notional this engine will ever deploy, regardless of config.
const DEFAULT_FLOOR_USD: Decimal = dec!(10);

#[derive(Debug, Clone, Copy)]
pub struct SizingInputs {
    pub desired_notional_usd: Decimal,
    pub leverage: u32,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub long_available: Decimal,
    pub short_available: Decimal,
    pub long_lot_step: Decimal,
    pub short_lot_step: Decimal,
    pub long_min_notional: Decimal,
    pub short_min_notional: Decimal,
    pub long_mid: Decimal,
    pub short_mid: Decimal,
    /// Existing same-side spot holding already satisfying part of the long leg.
    pub existing_long_holding: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct SizingOutput {
    pub size_base: Decimal,
    pub notional_actual: Decimal,
    pub limiting_venue: VenueId,
    pub was_capital_limited: bool,
    pub spot_buy_qty: Decimal,
    pub short_sell_qty: Decimal,
}

/// Compute the final, precision-aligned position size for both legs.
pub fn size_position(inputs: SizingInputs) -> Result<SizingOutput, EngineError> {
    let leverage_dec = Decimal::from(inputs.leverage);

    let max_long = inputs.long_available * leverage_dec;
    let max_short = inputs.short_available * leverage_dec;

    let (ceiling, limiting_venue) = if max_long <= max_short {
        (max_long * CAPITAL_SAFETY_BUFFER, inputs.long_venue)
    } else {
        (max_short * CAPITAL_SAFETY_BUFFER, inputs.short_venue)
    };

    let notional = inputs.desired_notional_usd.min(ceiling);
    let was_capital_limited = ceiling < inputs.desired_notional_usd;

    if notional < DEFAULT_FLOOR_USD {
        return Err(EngineError::InsufficientCapital {
            deployable: notional.to_string(),
            floor: DEFAULT_FLOOR_USD.to_string(),
        });
    }

    let mid_avg = (inputs.long_mid + inputs.short_mid) / Decimal::TWO;
    if mid_avg.is_zero() {
        return Err(EngineError::InsufficientCapital {
            deployable: notional.to_string(),
            floor: DEFAULT_FLOOR_USD.to_string(),
        });
    }

    let size_ideal = notional / mid_avg;
    let step = coarser_step(inputs.long_lot_step, inputs.short_lot_step);
    let size_final = floor_to(size_ideal, step);

    let long_min_base = min_base(inputs.long_lot_step, inputs.long_min_notional, inputs.long_mid);
    let short_min_base = min_base(
        inputs.short_lot_step,
        inputs.short_min_notional,
        inputs.short_mid,
    );

    if size_final < long_min_base || size_final < short_min_base {
        return Err(EngineError::BelowMinimum {
            long_min: long_min_base.to_string(),
            short_min: short_min_base.to_string(),
        });
    }

    let spot_buy_qty = floor_to(
        (size_final - inputs.existing_long_holding).max(Decimal::ZERO),
        step,
    );
    let short_sell_qty = floor_to(inputs.existing_long_holding + spot_buy_qty, step);

    let notional_actual = size_final * mid_avg;

    Ok(SizingOutput {
        size_base: size_final,
        notional_actual,
        limiting_venue,
        was_capital_limited,
        spot_buy_qty,
        short_sell_qty,
    })
}

fn min_base(lot_step: Decimal, min_notional: Decimal, mid: Decimal) -> Decimal {
    if mid.is_zero() {
        return lot_step;
    }
    lot_step.max(min_notional / mid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> SizingInputs {
        SizingInputs {
            desired_notional_usd: dec!(1000),
            leverage: 3,
            long_venue: VenueId::A,
            short_venue: VenueId::B,
            long_available: dec!(500),
            short_available: dec!(500),
            long_lot_step: dec!(0.01),
            short_lot_step: dec!(0.001),
            long_min_notional: dec!(5),
            short_min_notional: dec!(5),
            long_mid: dec!(100),
            short_mid: dec!(100),
            existing_long_holding: dec!(0),
        }
    }

    #[test]
    fn sizes_within_requested_notional_when_capital_allows() {
        let out = size_position(base_inputs()).unwrap();
        assert!(!out.was_capital_limited);
        assert_eq!(out.size_base, dec!(10.00));
        assert_eq!(out.spot_buy_qty, out.short_sell_qty);
    }

    #[test]
    fn caps_at_capital_ceiling_when_balances_are_small() {
        let mut inputs = base_inputs();
        inputs.long_available = dec!(10);
        inputs.short_available = dec!(10);
        let out = size_position(inputs).unwrap();
        assert!(out.was_capital_limited);
        assert_eq!(out.limiting_venue, VenueId::A);
    }

    #[test]
    fn rejects_when_deployable_notional_below_floor() {
        let mut inputs = base_inputs();
        inputs.long_available = dec!(0.1);
        inputs.short_available = dec!(0.1);
        let err = size_position(inputs).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientCapital { .. }));
    }

    #[test]
    fn rejects_when_final_size_below_either_venues_minimum() {
        let mut inputs = base_inputs();
        // min_notional far above what the requested notional can size into.
        inputs.long_min_notional = dec!(2000);
        let err = size_position(inputs).unwrap_err();
        assert!(matches!(err, EngineError::BelowMinimum { .. }));
    }

    #[test]
    fn aligns_to_coarser_step_across_venues() {
        let out = size_position(base_inputs()).unwrap();
        // coarser step of 0.01 / 0.001 is 0.01 — size_final must be a multiple.
        let remainder = out.size_base % dec!(0.01);
        assert_eq!(remainder, Decimal::ZERO);
    }

    #[test]
    fn existing_spot_holding_reduces_spot_buy_qty() {
        let mut inputs = base_inputs();
        inputs.existing_long_holding = dec!(5);
        let out = size_position(inputs).unwrap();
        assert_eq!(out.spot_buy_qty + inputs.existing_long_holding, out.short_sell_qty);
    }

    #[test]
    fn spot_buy_never_negative_when_existing_holding_exceeds_target() {
        let mut inputs = base_inputs();
        inputs.existing_long_holding = dec!(999);
        let out = size_position(inputs).unwrap();
        assert_eq!(out.spot_buy_qty, Decimal::ZERO);
    }
}
