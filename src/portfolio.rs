// =============================================================================
// Portfolio PnL Tracker — baseline capture and long-term PnL accounting (C10)
// =============================================================================
//
// `_capture_initial_portfolio` in the original source stores the portfolio's
// starting value exactly once, on the first successful balance read, and
// derives every later percentage figure from that single baseline rather
// than recomputing a moving average. `CapitalStatus::refresh` already
// implements the write-once baseline (types.rs); this module adds the
// long-term PnL figure derived from it, plus the dual accounting-mode split
// for realized PnL on close (DESIGN.md Open Question 1).

use rust_decimal::Decimal;

use crate::types::{AccountBalance, CapitalStatus, PnlAccountingMode, Position, RealizedPnlBreakdown};

/// Portfolio-level PnL relative to the write-once baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongTermPnl {
    pub pnl_usd: Decimal,
    pub pnl_pct: f64,
}

/// `long_term_pnl_usd` / `long_term_pnl_pct`, both `None`-safe against a
/// baseline that hasn't been captured yet (§3.2 invariant 3).
pub fn long_term_pnl(capital: &CapitalStatus) -> Option<LongTermPnl> {
    let baseline = capital.initial_total_capital?;
    let pnl_usd = capital.total_capital - baseline;
    let pnl_pct = if baseline.is_zero() {
        0.0
    } else {
        (pnl_usd / baseline * Decimal::ONE_HUNDRED)
            .to_string()
            .parse::<f64>()
            .unwrap_or(0.0)
    };
    Some(LongTermPnl { pnl_usd, pnl_pct })
}

/// Reconstruct realized PnL for a just-closed cycle under whichever
/// `PnlAccountingMode` the config selects. Both paths are kept side by
/// side rather than merged — see DESIGN.md.
pub fn realized_pnl_breakdown(
    mode: PnlAccountingMode,
    position: &Position,
    balances_before: (AccountBalance, AccountBalance),
    balances_after: (AccountBalance, AccountBalance),
    funding_received: Decimal,
    exit_fees: Decimal,
) -> RealizedPnlBreakdown {
    let fees_paid = position.entry_fees_paid + exit_fees;
    let funding_pnl = funding_received;

    let trading_pnl = match mode {
        PnlAccountingMode::BalanceDelta => {
            let (a_before, b_before) = balances_before;
            let (a_after, b_after) = balances_after;
            let total_before = a_before.total + b_before.total;
            let total_after = a_after.total + b_after.total;
            (total_after - total_before) - funding_pnl
        }
        PnlAccountingMode::LastUnrealizedSnapshot => position.last_unrealized_pnl_snapshot,
    };

    let net_pnl = trading_pnl + funding_pnl - fees_paid;

    RealizedPnlBreakdown {
        trading_pnl,
        funding_pnl,
        fees_paid,
        net_pnl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use crate::types::VenueId;

    fn balance(total: Decimal, available: Decimal) -> AccountBalance {
        AccountBalance { total, available }
    }

    #[test]
    fn long_term_pnl_none_before_baseline_captured() {
        let capital = CapitalStatus::empty(Utc::now());
        assert!(long_term_pnl(&capital).is_none());
    }

    #[test]
    fn long_term_pnl_computed_against_fixed_baseline() {
        let mut capital = CapitalStatus::empty(Utc::now());
        capital.refresh(balance(dec!(1000), dec!(1000)), balance(dec!(0), dec!(0)), 1, Utc::now());
        capital.refresh(balance(dec!(1100), dec!(1100)), balance(dec!(0), dec!(0)), 1, Utc::now());

        let pnl = long_term_pnl(&capital).unwrap();
        assert_eq!(pnl.pnl_usd, dec!(100));
        assert!((pnl.pnl_pct - 10.0).abs() < 1e-9);
    }

    fn sample_position() -> Position {
        Position {
            symbol: "SOL".into(),
            long_venue: VenueId::A,
            short_venue: VenueId::B,
            leverage: 2,
            opened_at: Utc::now(),
            target_close_at: Utc::now(),
            size_base: dec!(10),
            long_entry_price: dec!(100),
            short_entry_price: dec!(100),
            configured_notional: dec!(1000),
            actual_notional: dec!(1000),
            was_capital_limited: false,
            limiting_venue: None,
            balances_before: (balance(dec!(500), dec!(500)), balance(dec!(500), dec!(500))),
            expected_funding_rate_per_period: dec!(0.0001),
            expected_net_apr: dec!(20),
            cumulative_funding_received: dec!(5),
            entry_fees_paid: dec!(1),
            last_refreshed_pnl: dec!(0),
            stop_loss_triggered: false,
            stop_loss_reason: None,
            recovered: false,
            last_unrealized_pnl_snapshot: dec!(3),
        }
    }

    #[test]
    fn balance_delta_mode_derives_trading_pnl_from_balances() {
        let position = sample_position();
        let before = (balance(dec!(500), dec!(500)), balance(dec!(500), dec!(500)));
        let after = (balance(dec!(505), dec!(505)), balance(dec!(500), dec!(500)));

        let breakdown = realized_pnl_breakdown(
            PnlAccountingMode::BalanceDelta,
            &position,
            before,
            after,
            dec!(5),
            dec!(1),
        );

        // total_after - total_before = 10, minus funding_pnl(5) = 5 trading pnl
        assert_eq!(breakdown.trading_pnl, dec!(5));
        assert_eq!(breakdown.funding_pnl, dec!(5));
        assert_eq!(breakdown.fees_paid, dec!(2));
        assert_eq!(breakdown.net_pnl, dec!(8));
    }

    #[test]
    fn last_unrealized_snapshot_mode_uses_position_field_not_balances() {
        let position = sample_position();
        let before = (balance(dec!(500), dec!(500)), balance(dec!(500), dec!(500)));
        let after = (balance(dec!(999), dec!(999)), balance(dec!(1), dec!(1)));

        let breakdown = realized_pnl_breakdown(
            PnlAccountingMode::LastUnrealizedSnapshot,
            &position,
            before,
            after,
            dec!(5),
            dec!(1),
        );

        assert_eq!(breakdown.trading_pnl, dec!(3));
        assert_eq!(breakdown.net_pnl, dec!(3) + dec!(5) - dec!(2));
    }
}
