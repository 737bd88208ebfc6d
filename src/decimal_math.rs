// =============================================================================
// Tick / Lot Arithmetic — precision-safe price & quantity rounding
// =============================================================================
//
// Every price or quantity that crosses a venue boundary is rounded with these
// functions, never with `f64` arithmetic. `rust_decimal::Decimal` carries an
// exact base-10 scale, so `floor_to`/`ceil_to`/`round_to` reduce to exact
// integer division on the scaled mantissa rather than an epsilon-fuzzed float
// comparison — this is what lets `round_to(x, step)` match a venue's own
// acceptance check bit-for-bit.

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

/// Round `v` down to the nearest multiple of `step` (toward negative infinity
/// for the magnitudes this engine deals in, `step` is always positive so this
/// is simply "round down").
pub fn floor_to(v: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return v;
    }
    (v / step).floor() * step
}

/// Round `v` up to the nearest multiple of `step`.
pub fn ceil_to(v: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return v;
    }
    (v / step).ceil() * step
}

/// Round `v` to the nearest multiple of `step`, ties rounding away from zero
/// ("half up"), matching the venue convention this core targets.
pub fn round_to(v: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return v;
    }
    let quotient = (v / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    quotient * step
}

/// Truncate `v` to `precision` fractional digits, always toward zero. Used to
/// format final submitted strings: truncation never rounds up, so a computed
/// quantity is never over-sized relative to what was validated.
pub fn truncate(v: Decimal, precision: u32) -> Decimal {
    v.trunc_with_scale(precision)
}

/// Number of fractional decimal digits implied by a step value (e.g. `0.01`
/// has precision 2, `1` has precision 0). Used to derive string-formatting
/// precision from a venue's advertised tick/lot step.
pub fn step_precision(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Pick the coarser (larger) of two venues' lot steps, so both legs of a
/// delta-neutral position round to the same granularity.
pub fn coarser_step(a: Decimal, b: Decimal) -> Decimal {
    if a >= b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn floor_to_basic() {
        assert_eq!(floor_to(dec!(4.756), dec!(0.01)), dec!(4.75));
        assert_eq!(floor_to(dec!(4.75), dec!(0.01)), dec!(4.75));
    }

    #[test]
    fn ceil_to_basic() {
        assert_eq!(ceil_to(dec!(4.751), dec!(0.01)), dec!(4.76));
        assert_eq!(ceil_to(dec!(4.75), dec!(0.01)), dec!(4.75));
    }

    #[test]
    fn round_to_half_up() {
        assert_eq!(round_to(dec!(4.755), dec!(0.01)), dec!(4.76));
        assert_eq!(round_to(dec!(4.754), dec!(0.01)), dec!(4.75));
    }

    #[test]
    fn round_to_is_idempotent() {
        for (x, s) in [
            (dec!(4.7551), dec!(0.01)),
            (dec!(100), dec!(1)),
            (dec!(0.000123), dec!(0.0001)),
        ] {
            let once = round_to(x, s);
            let twice = round_to(once, s);
            assert_eq!(once, twice, "round_to not idempotent for ({x}, {s})");
        }
    }

    #[test]
    fn truncate_never_rounds_up() {
        assert_eq!(truncate(dec!(4.7599), 2), dec!(4.75));
        assert_eq!(truncate(dec!(-4.7599), 2), dec!(-4.75));
    }

    #[test]
    fn step_precision_basic() {
        assert_eq!(step_precision(dec!(0.01)), 2);
        assert_eq!(step_precision(dec!(1)), 0);
        assert_eq!(step_precision(dec!(0.0001)), 4);
    }

    #[test]
    fn coarser_step_picks_larger() {
        assert_eq!(coarser_step(dec!(0.001), dec!(0.01)), dec!(0.01));
        assert_eq!(coarser_step(dec!(0.01), dec!(0.01)), dec!(0.01));
    }

    #[test]
    fn floor_to_idempotent_under_both_venues_rounding() {
        let size_ideal = dec!(4.999);
        let step = coarser_step(dec!(0.01), dec!(0.001));
        let size_final = floor_to(size_ideal, step);
        assert_eq!(floor_to(size_final, dec!(0.01)), size_final);
        assert_eq!(floor_to(size_final, dec!(0.001)), size_final);
    }
}
