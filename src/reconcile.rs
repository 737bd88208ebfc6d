// =============================================================================
// Reconciler — exchange-is-source-of-truth recovery on startup and resume (C8)
// =============================================================================
//
// Mirrors `_reconcile_position_state` in the source this engine is modeled
// on: always compare persisted state against what the venues actually show
// before trusting it, rather than assuming the last-written state file is
// still accurate. Live position sizes always win; a Position this process
// didn't open is adopted, not rejected.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::RotationConfig;
use crate::executor::VenuePair;
use crate::monitor::sizes_are_hedged;
use crate::scanner;
use crate::types::{BotState, Position, VenueId};
use crate::venue::run_staggered;

/// One symbol's live open-position sizes on both venues, signed
/// (positive = long, negative = short).
#[derive(Debug, Clone, Copy)]
struct LiveLeg {
    size_a: Decimal,
    size_b: Decimal,
}

/// Outcome handed back to the controller: either a reconciled state to
/// adopt, or a fatal reason requiring operator intervention.
pub enum Reconciliation {
    /// No live position anywhere; stay/become IDLE.
    Idle,
    /// A hedged position was found (or the tracked one confirmed); the
    /// controller should transition to HOLDING with this Position.
    Holding(Box<Position>),
    /// The previously tracked position was closed externally while this
    /// process was down or paused.
    ClearedExternally,
    /// Live venue state cannot be reconciled automatically.
    Error(String),
}

/// Query both venues for every symbol in the monitored universe, with
/// bounded concurrency, and compare against `tracked` (the persisted
/// state's `BotState` + `Position`, if any).
pub async fn reconcile(
    tracked_state: BotState,
    tracked_position: Option<&Position>,
    universe: &[String],
    venues: &VenuePair,
    cfg: &RotationConfig,
) -> Reconciliation {
    let live_set = match fetch_live_set(universe, venues).await {
        Ok(set) => set,
        Err(e) => return Reconciliation::Error(format!("failed to read live positions: {e}")),
    };

    let hedged: BTreeMap<&String, (Decimal, Decimal)> = live_set
        .iter()
        .filter(|(_, leg)| !leg.size_a.is_zero() || !leg.size_b.is_zero())
        .map(|(symbol, leg)| (symbol, (leg.size_a, leg.size_b)))
        .collect();

    match (tracked_state, tracked_position) {
        (BotState::Holding, Some(position)) => {
            reconcile_holding(position, &hedged, universe, venues, cfg).await
        }

        (BotState::Holding, None) => {
            error!("state file claims HOLDING but carries no Position");
            Reconciliation::Error("state file is HOLDING with no tracked Position".into())
        }

        (BotState::Opening, _) | (BotState::Closing, _) => Reconciliation::Error(format!(
            "process stopped mid-{tracked_state}; an order may be resting on one or both venues — operator must verify and clear manually"
        )),

        // IDLE, ANALYZING, WAITING, ERROR, SHUTDOWN all carry no position
        // commitment; they recover identically.
        (_, _) if hedged.is_empty() => Reconciliation::Idle,

        (_, _) if hedged.len() == 1 => {
            let (symbol, (size_a, size_b)) = hedged.into_iter().next().unwrap();
            match symbol_lot_step(symbol, venues).await {
                Some(lot_step) if sizes_are_hedged(size_a, size_b, lot_step) => {
                    match adopt(symbol, size_a, size_b, universe, venues, cfg).await {
                        Ok(position) => Reconciliation::Holding(Box::new(position)),
                        Err(e) => Reconciliation::Error(format!(
                            "found hedged live position on {symbol} but could not adopt it: {e}"
                        )),
                    }
                }
                _ => Reconciliation::Error(format!(
                    "live position on {symbol} is not hedged within one lot step (a={size_a} b={size_b})"
                )),
            }
        }

        (_, _) => {
            let listing = hedged
                .iter()
                .map(|(s, (a, b))| format!("{s}: a={a} b={b}"))
                .collect::<Vec<_>>()
                .join(", ");
            error!(live = %listing, "multiple or non-hedged live positions found with no tracked position");
            Reconciliation::Error(format!(
                "multiple or non-hedged live positions with nothing tracked: {listing}"
            ))
        }
    }
}

async fn reconcile_holding(
    position: &Position,
    hedged: &BTreeMap<&String, (Decimal, Decimal)>,
    universe: &[String],
    venues: &VenuePair,
    cfg: &RotationConfig,
) -> Reconciliation {
    match hedged.get(&position.symbol) {
        None => {
            info!(symbol = %position.symbol, "tracked position no longer open on either venue, clearing");
            Reconciliation::ClearedExternally
        }
        Some(&(size_a, size_b)) => {
            let lot_step = symbol_lot_step(&position.symbol, venues)
                .await
                .unwrap_or(Decimal::new(1, 6));
            if !sizes_are_hedged(size_a, size_b, lot_step) {
                error!(
                    symbol = %position.symbol,
                    size_a = %size_a,
                    size_b = %size_b,
                    "tracked position size diverges from live venue state beyond one lot step"
                );
                return Reconciliation::Error(format!(
                    "tracked position on {} mismatches live sizes (a={size_a} b={size_b}) beyond one lot step",
                    position.symbol
                ));
            }

            let mut refreshed = position.clone();
            refresh_position_from_live(&mut refreshed, universe, venues, cfg).await;
            Reconciliation::Holding(Box::new(refreshed))
        }
    }
}

/// Adopt a hedged position found live on the venues but not tracked in the
/// persisted state: synthesize a Position with best-known entry prices
/// (current mid) and `opened_at = now`, flagged `recovered`.
async fn adopt(
    symbol: &str,
    size_a: Decimal,
    size_b: Decimal,
    universe: &[String],
    venues: &VenuePair,
    cfg: &RotationConfig,
) -> Result<Position, crate::error::EngineError> {
    let (long_venue, short_venue, size_base) = if size_a.is_sign_positive() {
        (VenueId::A, VenueId::B, size_a)
    } else {
        (VenueId::B, VenueId::A, size_b)
    };

    let long_adapter = venues.get(long_venue);
    let short_adapter = venues.get(short_venue);

    let (long_bba, short_bba, long_bal, short_bal, long_lev) = tokio::join!(
        long_adapter.best_bid_ask(symbol),
        short_adapter.best_bid_ask(symbol),
        venues.a.account_balance(),
        venues.b.account_balance(),
        long_adapter.get_leverage(symbol),
    );

    let long_bba = long_bba?;
    let short_bba = short_bba?;
    let long_bal = long_bal?;
    let short_bal = short_bal?;
    let leverage = long_lev.unwrap_or(cfg.leverage_settings.leverage);

    let now = Utc::now();
    let scan = scanner::scan(
        universe,
        venues.a.clone(),
        venues.b.clone(),
        &cfg.funding_rate_strategy,
    )
    .await;
    let (expected_rate, expected_apr) = scan
        .ranked
        .iter()
        .find(|o| o.symbol == symbol)
        .map(|o| {
            (
                o.net_apr / Decimal::from(365) / o.funding_freq_per_day / Decimal::ONE_HUNDRED,
                o.net_apr,
            )
        })
        .unwrap_or((Decimal::ZERO, Decimal::ZERO));

    let notional = size_base * (long_bba.mid() + short_bba.mid()) / Decimal::TWO;

    warn!(symbol, "adopting recovered hedged position not tracked in persisted state");

    Ok(Position {
        symbol: symbol.to_string(),
        long_venue,
        short_venue,
        leverage,
        opened_at: now,
        target_close_at: now
            + chrono::Duration::hours(cfg.position_management.max_position_age_hours as i64),
        size_base,
        long_entry_price: long_bba.mid(),
        short_entry_price: short_bba.mid(),
        configured_notional: notional,
        actual_notional: notional,
        was_capital_limited: false,
        limiting_venue: None,
        balances_before: (long_bal, short_bal),
        expected_funding_rate_per_period: expected_rate,
        expected_net_apr: expected_apr,
        cumulative_funding_received: Decimal::ZERO,
        entry_fees_paid: Decimal::ZERO,
        last_refreshed_pnl: Decimal::ZERO,
        stop_loss_triggered: false,
        stop_loss_reason: None,
        recovered: true,
        last_unrealized_pnl_snapshot: Decimal::ZERO,
    })
}

async fn refresh_position_from_live(
    position: &mut Position,
    universe: &[String],
    venues: &VenuePair,
    cfg: &RotationConfig,
) {
    let short_adapter = venues.get(position.short_venue);
    if let Ok(funding) = short_adapter
        .funding_income_since(&position.symbol, position.opened_at)
        .await
    {
        position.cumulative_funding_received = funding;
    }

    let scan = scanner::scan(
        universe,
        venues.a.clone(),
        venues.b.clone(),
        &cfg.funding_rate_strategy,
    )
    .await;
    if let Some(opp) = scan.ranked.iter().find(|o| o.symbol == position.symbol) {
        position.expected_net_apr = opp.net_apr;
    }
}

async fn fetch_live_set(
    universe: &[String],
    venues: &VenuePair,
) -> Result<BTreeMap<String, LiveLeg>, crate::error::EngineError> {
    let items: Vec<String> = universe.to_vec();
    let a = venues.a.clone();
    let b = venues.b.clone();

    let results = run_staggered(items, Duration::from_millis(200), move |symbol: String| {
        let a = a.clone();
        let b = b.clone();
        async move {
            let (size_a, size_b) = tokio::join!(a.open_position_size(&symbol), b.open_position_size(&symbol));
            (symbol, size_a, size_b)
        }
    })
    .await;

    let mut set = BTreeMap::new();
    for (symbol, size_a, size_b) in results {
        let size_a = size_a?;
        let size_b = size_b?;
        set.insert(symbol, LiveLeg { size_a, size_b });
    }
    Ok(set)
}

async fn symbol_lot_step(symbol: &str, venues: &VenuePair) -> Option<Decimal> {
    let meta = venues.a.symbol_metadata(symbol).await.ok()?;
    Some(meta.lot_step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::error::EngineError;
    use crate::types::{AccountBalance, BestBidAsk, FundingSample, SymbolMetadata};
    use crate::venue::{OrderAck, Side, VenueAdapter};

    struct MockAdapter {
        id: VenueId,
        position_sizes: Mutex<HashMap<String, Decimal>>,
    }

    impl MockAdapter {
        fn new(id: VenueId, sizes: &[(&str, Decimal)]) -> Self {
            Self {
                id,
                position_sizes: Mutex::new(
                    sizes.iter().map(|(s, q)| (s.to_string(), *q)).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for MockAdapter {
        fn id(&self) -> VenueId {
            self.id
        }

        async fn best_bid_ask(&self, _symbol: &str) -> Result<BestBidAsk, EngineError> {
            Ok(BestBidAsk {
                bid: dec!(100),
                ask: dec!(100.1),
            })
        }

        async fn current_funding_rate(&self, _symbol: &str) -> Result<FundingSample, EngineError> {
            Ok(FundingSample {
                rate: dec!(0.0001),
                period_hours: 8.0,
                timestamp: Utc::now(),
            })
        }

        async fn funding_rate_history(
            &self,
            _symbol: &str,
            _n: u32,
        ) -> Result<Vec<FundingSample>, EngineError> {
            Ok(vec![])
        }

        async fn quote_volume_24h(&self, _symbol: &str) -> Result<Decimal, EngineError> {
            Ok(dec!(5000000))
        }

        async fn symbol_metadata(&self, _symbol: &str) -> Result<SymbolMetadata, EngineError> {
            Ok(SymbolMetadata {
                price_tick: dec!(0.01),
                lot_step: dec!(0.01),
                min_notional: dec!(5),
                funding_interval_hours: Some(8.0),
            })
        }

        async fn account_balance(&self) -> Result<AccountBalance, EngineError> {
            Ok(AccountBalance {
                total: dec!(1000),
                available: dec!(1000),
            })
        }

        async fn open_position_size(&self, symbol: &str) -> Result<Decimal, EngineError> {
            Ok(*self
                .position_sizes
                .lock()
                .unwrap()
                .get(symbol)
                .unwrap_or(&Decimal::ZERO))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), EngineError> {
            Ok(())
        }

        async fn get_leverage(&self, _symbol: &str) -> Result<u32, EngineError> {
            Ok(3)
        }

        async fn place_aggressive_limit(
            &self,
            _symbol: &str,
            _side: Side,
            size_base: Decimal,
            reference_price: Decimal,
            _cross_ticks: u32,
        ) -> Result<OrderAck, EngineError> {
            Ok(OrderAck {
                size_base,
                avg_price: reference_price,
            })
        }

        async fn place_market(
            &self,
            _symbol: &str,
            _side: Side,
            size_base: Decimal,
        ) -> Result<OrderAck, EngineError> {
            Ok(OrderAck {
                size_base,
                avg_price: dec!(100),
            })
        }

        async fn place_market_quote(
            &self,
            _symbol: &str,
            _side: Side,
            quote_qty: Decimal,
        ) -> Result<OrderAck, EngineError> {
            Ok(OrderAck {
                size_base: quote_qty / dec!(100),
                avg_price: dec!(100),
            })
        }

        async fn close_position(&self, symbol: &str) -> Result<OrderAck, EngineError> {
            self.position_sizes
                .lock()
                .unwrap()
                .insert(symbol.to_string(), Decimal::ZERO);
            Ok(OrderAck {
                size_base: Decimal::ZERO,
                avg_price: dec!(100),
            })
        }

        async fn funding_income_since(
            &self,
            _symbol: &str,
            _since: chrono::DateTime<Utc>,
        ) -> Result<Decimal, EngineError> {
            Ok(dec!(1.5))
        }
    }

    fn universe() -> Vec<String> {
        vec!["SOL".to_string()]
    }

    fn sample_position() -> Position {
        Position {
            symbol: "SOL".into(),
            long_venue: VenueId::A,
            short_venue: VenueId::B,
            leverage: 3,
            opened_at: Utc::now(),
            target_close_at: Utc::now(),
            size_base: dec!(5),
            long_entry_price: dec!(100),
            short_entry_price: dec!(100),
            configured_notional: dec!(500),
            actual_notional: dec!(500),
            was_capital_limited: false,
            limiting_venue: None,
            balances_before: (
                AccountBalance {
                    total: dec!(1000),
                    available: dec!(1000),
                },
                AccountBalance {
                    total: dec!(1000),
                    available: dec!(1000),
                },
            ),
            expected_funding_rate_per_period: dec!(0.0001),
            expected_net_apr: dec!(15),
            cumulative_funding_received: dec!(0),
            entry_fees_paid: dec!(1),
            last_refreshed_pnl: dec!(0),
            stop_loss_triggered: false,
            stop_loss_reason: None,
            recovered: false,
            last_unrealized_pnl_snapshot: dec!(0),
        }
    }

    #[tokio::test]
    async fn idle_with_no_live_positions_stays_idle() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[])),
        };
        let cfg = RotationConfig::default();

        let result = reconcile(BotState::Idle, None, &universe(), &venues, &cfg).await;
        assert!(matches!(result, Reconciliation::Idle));
    }

    #[tokio::test]
    async fn idle_with_hedged_live_position_adopts_it() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[("SOL", dec!(5))])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[("SOL", dec!(-5))])),
        };
        let cfg = RotationConfig::default();

        let result = reconcile(BotState::Idle, None, &universe(), &venues, &cfg).await;
        match result {
            Reconciliation::Holding(position) => {
                assert_eq!(position.symbol, "SOL");
                assert!(position.recovered);
                assert_eq!(position.long_venue, VenueId::A);
            }
            _ => panic!("expected adoption into HOLDING"),
        }
    }

    #[tokio::test]
    async fn holding_with_position_closed_externally_clears() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[])),
        };
        let cfg = RotationConfig::default();
        let position = sample_position();

        let result = reconcile(BotState::Holding, Some(&position), &universe(), &venues, &cfg).await;
        assert!(matches!(result, Reconciliation::ClearedExternally));
    }

    #[tokio::test]
    async fn holding_with_matching_live_position_refreshes_and_keeps_holding() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[("SOL", dec!(5))])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[("SOL", dec!(-5))])),
        };
        let cfg = RotationConfig::default();
        let position = sample_position();

        let result = reconcile(BotState::Holding, Some(&position), &universe(), &venues, &cfg).await;
        match result {
            Reconciliation::Holding(refreshed) => {
                assert_eq!(refreshed.symbol, "SOL");
                assert_eq!(refreshed.cumulative_funding_received, dec!(1.5));
            }
            _ => panic!("expected refreshed HOLDING"),
        }
    }

    #[tokio::test]
    async fn holding_with_mismatched_live_sizes_errors() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[("SOL", dec!(5))])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[("SOL", dec!(-1))])),
        };
        let cfg = RotationConfig::default();
        let position = sample_position();

        let result = reconcile(BotState::Holding, Some(&position), &universe(), &venues, &cfg).await;
        assert!(matches!(result, Reconciliation::Error(_)));
    }

    #[tokio::test]
    async fn opening_state_on_restart_is_an_error_requiring_operator() {
        let venues = VenuePair {
            a: Arc::new(MockAdapter::new(VenueId::A, &[])),
            b: Arc::new(MockAdapter::new(VenueId::B, &[])),
        };
        let cfg = RotationConfig::default();

        let result = reconcile(BotState::Opening, None, &universe(), &venues, &cfg).await;
        assert!(matches!(result, Reconciliation::Error(_)));
    }
}
