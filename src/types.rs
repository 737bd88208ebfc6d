// =============================================================================
// Core data model — the tagged records every component hands data through
// =============================================================================
//
// The source this engine is modeled on passed dicts of mixed types through
// its pipeline; every cross-component hand-off here goes through one of the
// records below instead.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which of the two perpetual-futures venues a leg lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueId {
    A,
    B,
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueId::A => write!(f, "venue_a"),
            VenueId::B => write!(f, "venue_b"),
        }
    }
}

impl VenueId {
    pub fn other(self) -> VenueId {
        match self {
            VenueId::A => VenueId::B,
            VenueId::B => VenueId::A,
        }
    }
}

/// Exchange-advertised metadata for a tradable symbol on one venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub price_tick: Decimal,
    pub lot_step: Decimal,
    pub min_notional: Decimal,
    /// Advertised funding interval, when the venue exposes it directly.
    pub funding_interval_hours: Option<f64>,
}

/// Best bid/ask snapshot for a symbol on one venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl BestBidAsk {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Account balance on one venue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountBalance {
    pub total: Decimal,
    pub available: Decimal,
}

/// A single historical or current funding-rate observation. Immutable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FundingSample {
    pub rate: Decimal,
    pub period_hours: f64,
    pub timestamp: DateTime<Utc>,
}

impl FundingSample {
    /// Annualized percentage rate implied by this single sample.
    pub fn apr_pct(&self) -> Decimal {
        let periods_per_day = Decimal::from_f64_retain(24.0 / self.period_hours).unwrap_or_default();
        self.rate * periods_per_day * Decimal::from(365) * Decimal::ONE_HUNDRED
    }
}

/// Scanner output: a ranked delta-neutral candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub symbol: String,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub long_apr: Decimal,
    pub short_apr: Decimal,
    pub net_apr: Decimal,
    pub combined_24h_volume_usd: Decimal,
    pub cross_spread_pct: Decimal,
    pub funding_freq_per_day: Decimal,
    pub using_ma_flag: bool,
}

/// Single-line reason a candidate symbol was excluded from a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExclusionReason {
    VolumeTooLow,
    SpreadTooWide,
    NegativeRate,
    DataUnavailable,
    Timeout,
    BelowAprThreshold,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExclusionReason::VolumeTooLow => "VOLUME_TOO_LOW",
            ExclusionReason::SpreadTooWide => "SPREAD_TOO_WIDE",
            ExclusionReason::NegativeRate => "NEGATIVE_RATE",
            ExclusionReason::DataUnavailable => "DATA_UNAVAILABLE",
            ExclusionReason::Timeout => "TIMEOUT",
            ExclusionReason::BelowAprThreshold => "BELOW_APR_THRESHOLD",
        };
        write!(f, "{s}")
    }
}

/// Full scanner result: ranked opportunities plus why everything else was cut.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResult {
    pub ranked: Vec<Opportunity>,
    pub excluded: Vec<(String, ExclusionReason)>,
}

/// How realized PnL is reconstructed at close — see DESIGN.md Open Question 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PnlAccountingMode {
    /// Realized PnL = balance-after − balance-before, per venue. The correct
    /// mode whenever the venue's balance endpoint reflects settled PnL
    /// promptly and accurately.
    #[default]
    BalanceDelta,
    /// Realized PnL is reconstructed from the last unrealized-PnL snapshot
    /// taken before close, rather than from balance deltas. The source
    /// carries this path for a specific venue citing "totalEquity quirks";
    /// whether it is still required is venue-dependent, so both paths are
    /// kept rather than merged (see DESIGN.md).
    LastUnrealizedSnapshot,
}

/// The singleton open position while `state = HOLDING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
    pub target_close_at: DateTime<Utc>,
    pub size_base: Decimal,
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub configured_notional: Decimal,
    pub actual_notional: Decimal,
    pub was_capital_limited: bool,
    pub limiting_venue: Option<VenueId>,
    pub balances_before: (AccountBalance, AccountBalance),
    pub expected_funding_rate_per_period: Decimal,
    pub expected_net_apr: Decimal,
    pub cumulative_funding_received: Decimal,
    pub entry_fees_paid: Decimal,
    pub last_refreshed_pnl: Decimal,
    pub stop_loss_triggered: bool,
    pub stop_loss_reason: Option<String>,
    /// Set by the reconciler when this Position was synthesized from live
    /// exchange state rather than opened by this process.
    #[serde(default)]
    pub recovered: bool,
    /// Last unrealized-PnL snapshot, retained for `PnlAccountingMode::LastUnrealizedSnapshot`.
    #[serde(default)]
    pub last_unrealized_pnl_snapshot: Decimal,
}

impl Position {
    pub fn hold_duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}

/// Immutable record of a closed Position, retained as a capped FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedCycle {
    pub symbol: String,
    pub long_venue: VenueId,
    pub short_venue: VenueId,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_hours: f64,
    pub size_base: Decimal,
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub exit_prices: (Decimal, Decimal),
    pub actual_notional: Decimal,
    pub exit_balances: (AccountBalance, AccountBalance),
    pub realized_pnl_breakdown: RealizedPnlBreakdown,
    pub cumulative_funding_received: Decimal,
    pub entry_fees_paid: Decimal,
    pub exit_reason: String,
    pub stop_loss_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RealizedPnlBreakdown {
    pub trading_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub fees_paid: Decimal,
    pub net_pnl: Decimal,
}

/// Per-symbol rollup inside `CumulativeStats`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SymbolStats {
    pub cycles: u64,
    pub total_pnl: Decimal,
    pub avg_pnl: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CumulativeStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub total_realized_pnl: Decimal,
    pub best_cycle_pnl: Option<Decimal>,
    pub worst_cycle_pnl: Option<Decimal>,
    pub total_volume_traded: Decimal,
    pub total_hold_time_hours: f64,
    pub by_symbol: HashMap<String, SymbolStats>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl CumulativeStats {
    pub fn record_cycle(&mut self, cycle: &CompletedCycle) {
        self.total_cycles += 1;
        self.successful_cycles += 1;
        let pnl = cycle.realized_pnl_breakdown.net_pnl;
        self.total_realized_pnl += pnl;
        self.total_volume_traded += cycle.actual_notional;
        self.total_hold_time_hours += cycle.duration_hours;
        self.best_cycle_pnl = Some(self.best_cycle_pnl.map_or(pnl, |b| b.max(pnl)));
        self.worst_cycle_pnl = Some(self.worst_cycle_pnl.map_or(pnl, |w| w.min(pnl)));

        let entry = self.by_symbol.entry(cycle.symbol.clone()).or_default();
        entry.cycles += 1;
        entry.total_pnl += pnl;
        entry.avg_pnl = entry.total_pnl / Decimal::from(entry.cycles);
    }

    pub fn record_failure(&mut self, error: String, at: DateTime<Utc>) {
        self.failed_cycles += 1;
        self.last_error = Some(error);
        self.last_error_at = Some(at);
    }
}

/// Capital snapshot across both venues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapitalStatus {
    pub venue_a_total: Decimal,
    pub venue_a_available: Decimal,
    pub venue_b_total: Decimal,
    pub venue_b_available: Decimal,
    pub total_capital: Decimal,
    pub total_available: Decimal,
    pub max_position_notional: Decimal,
    pub limiting_venue: Option<VenueId>,
    /// Written exactly once, at the first successful refresh with total > 0.
    pub initial_total_capital: Option<Decimal>,
    pub last_updated: DateTime<Utc>,
}

impl CapitalStatus {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            venue_a_total: Decimal::ZERO,
            venue_a_available: Decimal::ZERO,
            venue_b_total: Decimal::ZERO,
            venue_b_available: Decimal::ZERO,
            total_capital: Decimal::ZERO,
            total_available: Decimal::ZERO,
            max_position_notional: Decimal::ZERO,
            limiting_venue: None,
            initial_total_capital: None,
            last_updated: now,
        }
    }

    /// Refresh from live balances. `initial_total_capital` is set once and
    /// never overwritten thereafter — invariant 3 (§3.2), property 3 (§8).
    pub fn refresh(
        &mut self,
        a: AccountBalance,
        b: AccountBalance,
        leverage: u32,
        now: DateTime<Utc>,
    ) {
        self.venue_a_total = a.total;
        self.venue_a_available = a.available;
        self.venue_b_total = b.total;
        self.venue_b_available = b.available;
        self.total_capital = a.total + b.total;
        self.total_available = a.available + b.available;

        let leverage_dec = Decimal::from(leverage);
        let max_a = a.available * leverage_dec;
        let max_b = b.available * leverage_dec;
        if max_a <= max_b {
            self.max_position_notional = max_a;
            self.limiting_venue = Some(VenueId::A);
        } else {
            self.max_position_notional = max_b;
            self.limiting_venue = Some(VenueId::B);
        }

        if self.initial_total_capital.is_none() && self.total_capital > Decimal::ZERO {
            self.initial_total_capital = Some(self.total_capital);
        }
        self.last_updated = now;
    }
}

/// The rotation controller's single state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotState {
    Idle,
    Analyzing,
    Opening,
    Holding,
    Closing,
    Waiting,
    Error,
    Shutdown,
}

impl Default for BotState {
    fn default() -> Self {
        BotState::Idle
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotState::Idle => "IDLE",
            BotState::Analyzing => "ANALYZING",
            BotState::Opening => "OPENING",
            BotState::Holding => "HOLDING",
            BotState::Closing => "CLOSING",
            BotState::Waiting => "WAITING",
            BotState::Error => "ERROR",
            BotState::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn initial_total_capital_set_once() {
        let mut status = CapitalStatus::empty(Utc::now());
        let a = AccountBalance {
            total: dec!(0),
            available: dec!(0),
        };
        let b = a;
        status.refresh(a, b, 1, Utc::now());
        assert_eq!(status.initial_total_capital, None);

        let a2 = AccountBalance {
            total: dec!(500),
            available: dec!(500),
        };
        status.refresh(a2, b, 1, Utc::now());
        assert_eq!(status.initial_total_capital, Some(dec!(500)));

        let a3 = AccountBalance {
            total: dec!(900),
            available: dec!(900),
        };
        status.refresh(a3, b, 1, Utc::now());
        assert_eq!(status.initial_total_capital, Some(dec!(500)));
    }

    #[test]
    fn cumulative_stats_tracks_best_worst_and_avg() {
        let mut stats = CumulativeStats::default();
        let base = CompletedCycle {
            symbol: "SOL".into(),
            long_venue: VenueId::B,
            short_venue: VenueId::A,
            leverage: 1,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            duration_hours: 8.0,
            size_base: dec!(4.75),
            long_entry_price: dec!(100),
            short_entry_price: dec!(100),
            exit_prices: (dec!(100), dec!(100)),
            actual_notional: dec!(475),
            exit_balances: (
                AccountBalance {
                    total: dec!(500),
                    available: dec!(500),
                },
                AccountBalance {
                    total: dec!(500),
                    available: dec!(500),
                },
            ),
            realized_pnl_breakdown: RealizedPnlBreakdown {
                trading_pnl: dec!(0),
                funding_pnl: dec!(10),
                fees_paid: dec!(1),
                net_pnl: dec!(9),
            },
            cumulative_funding_received: dec!(10),
            entry_fees_paid: dec!(1),
            exit_reason: "FEE_COVERAGE_MET".into(),
            stop_loss_reason: None,
        };
        stats.record_cycle(&base);
        let mut second = base.clone();
        second.realized_pnl_breakdown.net_pnl = dec!(-3);
        stats.record_cycle(&second);

        assert_eq!(stats.total_cycles, 2);
        assert_eq!(stats.best_cycle_pnl, Some(dec!(9)));
        assert_eq!(stats.worst_cycle_pnl, Some(dec!(-3)));
        let sol = &stats.by_symbol["SOL"];
        assert_eq!(sol.cycles, 2);
        assert_eq!(sol.avg_pnl, dec!(3));
    }

    #[test]
    fn venue_other_is_involution() {
        assert_eq!(VenueId::A.other(), VenueId::B);
        assert_eq!(VenueId::B.other(), VenueId::A);
    }
}
