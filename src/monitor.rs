// =============================================================================
// Hold Monitor — ordered exit-rule evaluation for the singleton open position
// =============================================================================
//
// Called once per `check_interval_seconds` while the controller is in
// HOLDING. Mirrors the original LiquidationCalculator's stop-loss formula
// exactly; rule evaluation order follows §4.6 (first rule to fire wins).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, instrument, warn};

use crate::executor::VenuePair;
use crate::scanner;
use crate::types::{CapitalStatus, Position};

const MAINTENANCE_MARGIN: f64 = 0.005;
const SAFETY_BUFFER: f64 = 0.007;

const ROTATION_APR_IMPROVEMENT_PTS: Decimal = dec!(10);
const MIN_HOLD_BEFORE_ROTATE_HOURS: i64 = 4;
const IMBALANCE_THRESHOLD_PCT: Decimal = dec!(10);

/// Pure function: the most negative integer percentage PnL, relative to
/// notional, at which the short leg's liquidation buffer is exhausted.
///
/// ```text
/// s_max = ((1 + 1/L) / (1 + m)) - 1 - b
/// pnl_pct_at_stop = -s_max * (L / (L+1)) * 100
/// emergency_stop_loss_pct = floor(pnl_pct_at_stop)
/// ```
pub fn emergency_stop_loss_pct(leverage: u32) -> i64 {
    let l = leverage as f64;
    let s_max = ((1.0 + 1.0 / l) / (1.0 + MAINTENANCE_MARGIN)) - 1.0 - SAFETY_BUFFER;
    let pnl_pct_at_stop = -s_max * (l / (l + 1.0)) * 100.0;
    pnl_pct_at_stop.floor() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    FeeCoverageMet,
    BetterOpportunity,
    MaxAge,
    Health,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::FeeCoverageMet => "FEE_COVERAGE_MET",
            ExitReason::BetterOpportunity => "BETTER_OPPORTUNITY",
            ExitReason::MaxAge => "MAX_AGE",
            ExitReason::Health => "HEALTH",
        };
        write!(f, "{s}")
    }
}

pub struct TickSnapshot {
    pub upnl_long: Decimal,
    pub upnl_short: Decimal,
    pub total_upnl: Decimal,
    pub cumulative_funding_received: Decimal,
    pub estimated_exit_fees: Decimal,
}

/// Refresh mark/funding/capital data for the open position and decide
/// whether any exit rule fires.
#[instrument(skip(position, venues, capital, fee_coverage_multiplier, max_position_age_hours))]
pub async fn tick(
    position: &Position,
    venues: &VenuePair,
    capital: &mut CapitalStatus,
    fee_coverage_multiplier: Decimal,
    max_position_age_hours: f64,
    universe: &[String],
    funding_cfg: &crate::config::FundingRateStrategyConfig,
) -> (TickSnapshot, Option<(ExitReason, String)>) {
    let long_adapter = venues.get(position.long_venue);
    let short_adapter = venues.get(position.short_venue);

    let (long_bba, short_bba) = tokio::join!(
        long_adapter.best_bid_ask(&position.symbol),
        short_adapter.best_bid_ask(&position.symbol),
    );

    let long_mark = long_bba.map(|b| b.mid()).unwrap_or(position.long_entry_price);
    let short_mark = short_bba.map(|b| b.mid()).unwrap_or(position.short_entry_price);

    let upnl_long = (long_mark - position.long_entry_price) * position.size_base;
    let upnl_short = (position.short_entry_price - short_mark) * position.size_base;
    let total_upnl = upnl_long + upnl_short;

    let (bal_a, bal_b) = tokio::join!(venues.a.account_balance(), venues.b.account_balance());
    if let (Ok(a), Ok(b)) = (bal_a, bal_b) {
        capital.refresh(a, b, position.leverage, chrono::Utc::now());
    }

    let funding_received = short_adapter
        .funding_income_since(&position.symbol, position.opened_at)
        .await
        .unwrap_or(position.cumulative_funding_received);

    let estimated_exit_fees = position.entry_fees_paid;

    let snapshot = TickSnapshot {
        upnl_long,
        upnl_short,
        total_upnl,
        cumulative_funding_received: funding_received,
        estimated_exit_fees,
    };

    let worst_leg_pnl = upnl_long.min(upnl_short);
    let worst_leg_pct = if position.actual_notional.is_zero() {
        Decimal::ZERO
    } else {
        (worst_leg_pnl / position.actual_notional) * Decimal::ONE_HUNDRED
    };
    let stop_pct = Decimal::from(emergency_stop_loss_pct(position.leverage));

    if worst_leg_pct <= stop_pct {
        warn!(symbol = %position.symbol, worst_leg_pct = %worst_leg_pct, stop_pct = %stop_pct, "stop-loss triggered");
        return (
            snapshot,
            Some((
                ExitReason::StopLoss,
                format!("worst-leg pnl {worst_leg_pct}% <= stop {stop_pct}%"),
            )),
        );
    }

    let fee_floor = fee_coverage_multiplier * (position.entry_fees_paid + estimated_exit_fees);
    if funding_received >= fee_floor {
        info!(symbol = %position.symbol, "fee coverage exit rule fired");
        return (
            snapshot,
            Some((
                ExitReason::FeeCoverageMet,
                format!("funding {funding_received} >= {fee_floor}"),
            )),
        );
    }

    let hold_duration = position.hold_duration(chrono::Utc::now());
    if hold_duration >= chrono::Duration::hours(MIN_HOLD_BEFORE_ROTATE_HOURS) {
        let scan = scanner::scan(universe, venues.a.clone(), venues.b.clone(), funding_cfg).await;
        if let Some(best) = scan.ranked.first() {
            if best.symbol != position.symbol
                && best.net_apr - position.expected_net_apr > ROTATION_APR_IMPROVEMENT_PTS
            {
                return (
                    snapshot,
                    Some((
                        ExitReason::BetterOpportunity,
                        format!(
                            "{} offers net_apr {} vs current {}",
                            best.symbol, best.net_apr, position.expected_net_apr
                        ),
                    )),
                );
            }
        }
    }

    if hold_duration.num_hours() as f64 >= max_position_age_hours {
        return (
            snapshot,
            Some((ExitReason::MaxAge, format!("held {} hours", hold_duration.num_hours()))),
        );
    }

    let imbalance_pct = if position.size_base.is_zero() {
        Decimal::ZERO
    } else {
        ((upnl_long - upnl_short).abs() / position.actual_notional.max(Decimal::new(1, 0)))
            * Decimal::ONE_HUNDRED
    };
    if imbalance_pct > IMBALANCE_THRESHOLD_PCT {
        return (
            snapshot,
            Some((
                ExitReason::Health,
                format!("per-leg imbalance {imbalance_pct}% exceeds threshold"),
            )),
        );
    }

    (snapshot, None)
}

/// Used by the reconciler: true if `a` and `b` are opposing and within one
/// lot step of each other in magnitude.
pub fn sizes_are_hedged(a: Decimal, b: Decimal, lot_step: Decimal) -> bool {
    let opposing = (a.is_sign_positive() && b.is_sign_negative())
        || (a.is_sign_negative() && b.is_sign_positive());
    opposing && (a.abs() - b.abs()).abs() <= lot_step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_loss_matches_known_defaults_at_1x() {
        assert_eq!(emergency_stop_loss_pct(1), -50);
    }

    #[test]
    fn stop_loss_matches_known_defaults_at_2x() {
        assert_eq!(emergency_stop_loss_pct(2), -33);
    }

    #[test]
    fn stop_loss_matches_known_defaults_at_3x() {
        assert_eq!(emergency_stop_loss_pct(3), -24);
    }

    #[test]
    fn stop_loss_is_monotonic_in_leverage() {
        let mut prev = emergency_stop_loss_pct(1);
        for l in 2..10 {
            let cur = emergency_stop_loss_pct(l);
            assert!(cur <= prev, "stop-loss should not loosen as leverage rises");
            prev = cur;
        }
    }

    #[test]
    fn sizes_are_hedged_detects_opposing_within_one_step() {
        assert!(sizes_are_hedged(dec!(5.0), dec!(-5.0), dec!(0.01)));
        assert!(sizes_are_hedged(dec!(5.0), dec!(-4.995), dec!(0.01)));
        assert!(!sizes_are_hedged(dec!(5.0), dec!(-4.0), dec!(0.01)));
        assert!(!sizes_are_hedged(dec!(5.0), dec!(5.0), dec!(0.01)));
    }
}
