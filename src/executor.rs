// =============================================================================
// Position Executor — dual-leg open/close with independent verification
// =============================================================================
//
// Open and close both follow the same shape the original emergency_exit.py
// uses for unwinding a hedge: dispatch both legs concurrently, wait a short
// settle interval, then re-read each leg's position size independently
// rather than trusting the order-ack response. Two `OpenStrategy`
// implementations exist — cross-venue (primary) and single-venue
// spot+perp (alternate) — sharing this settle-then-verify shape and
// differing only in which adapter each leg calls back through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::sizing::SizingOutput;
use crate::types::{AccountBalance, Opportunity, Position, VenueId};
use crate::venue::{OrderAck, Side, VenueAdapter};

/// Settle time between order dispatch and re-read verification.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
const CROSS_TICKS: u32 = 100;

pub struct VenuePair {
    pub a: Arc<dyn VenueAdapter>,
    pub b: Arc<dyn VenueAdapter>,
}

impl VenuePair {
    pub fn get(&self, id: VenueId) -> Arc<dyn VenueAdapter> {
        match id {
            VenueId::A => self.a.clone(),
            VenueId::B => self.b.clone(),
        }
    }
}

/// Outcome of a verified dual-leg open.
pub struct OpenedLegs {
    pub long_entry_price: Decimal,
    pub short_entry_price: Decimal,
    pub size_base: Decimal,
    pub balances_before: (AccountBalance, AccountBalance),
}

/// Open both legs of a delta-neutral position, verify, or surface a partial
/// fill without auto-unwinding.
#[async_trait]
pub trait OpenStrategy: Send + Sync {
    async fn open(
        &self,
        symbol: &str,
        opportunity: &Opportunity,
        sizing: &SizingOutput,
        venues: &VenuePair,
    ) -> Result<OpenedLegs, EngineError>;

    async fn close(&self, position: &Position, venues: &VenuePair) -> Result<(), EngineError>;
}

/// Primary variant: venue A and venue B are two independent perpetual-futures
/// adapters, one long one short on the same symbol.
pub struct CrossVenueOpen;

#[async_trait]
impl OpenStrategy for CrossVenueOpen {
    #[instrument(skip(self, opportunity, sizing, venues))]
    async fn open(
        &self,
        symbol: &str,
        opportunity: &Opportunity,
        sizing: &SizingOutput,
        venues: &VenuePair,
    ) -> Result<OpenedLegs, EngineError> {
        let long_adapter = venues.get(opportunity.long_venue);
        let short_adapter = venues.get(opportunity.short_venue);

        let balances_before = (
            venues.a.account_balance().await?,
            venues.b.account_balance().await?,
        );

        let long_bba = long_adapter.best_bid_ask(symbol).await?;
        let short_bba = short_adapter.best_bid_ask(symbol).await?;

        let (long_ack, short_ack) = tokio::join!(
            long_adapter.place_aggressive_limit(
                symbol,
                Side::Buy,
                sizing.size_base,
                long_bba.ask,
                CROSS_TICKS,
            ),
            short_adapter.place_aggressive_limit(
                symbol,
                Side::Sell,
                sizing.size_base,
                short_bba.bid,
                CROSS_TICKS,
            ),
        );

        verify_open(symbol, long_adapter, short_adapter, long_ack, short_ack, sizing.size_base)
            .await
            .map(|(long_entry_price, short_entry_price, size_base)| OpenedLegs {
                long_entry_price,
                short_entry_price,
                size_base,
                balances_before,
            })
    }

    #[instrument(skip(self, position, venues), fields(symbol = %position.symbol))]
    async fn close(&self, position: &Position, venues: &VenuePair) -> Result<(), EngineError> {
        let long_adapter = venues.get(position.long_venue);
        let short_adapter = venues.get(position.short_venue);
        close_cross_venue(&position.symbol, long_adapter, short_adapter).await
    }
}

/// Alternate variant: long spot + short perp on a single venue. Retained as a
/// second `OpenStrategy` implementation of the same contract, selected by
/// configuration, mirroring the two distinct "open position" code paths in
/// the original source.
pub struct SingleVenueSpotPerpOpen {
    /// Which venue hosts both the spot and perp legs.
    pub venue: VenueId,
}

#[async_trait]
impl OpenStrategy for SingleVenueSpotPerpOpen {
    #[instrument(skip(self, opportunity, sizing, venues))]
    async fn open(
        &self,
        symbol: &str,
        opportunity: &Opportunity,
        sizing: &SizingOutput,
        venues: &VenuePair,
    ) -> Result<OpenedLegs, EngineError> {
        let adapter = venues.get(self.venue);
        let _ = opportunity;

        let balances_before = (
            venues.a.account_balance().await?,
            venues.b.account_balance().await?,
        );

        let bba = adapter.best_bid_ask(symbol).await?;

        let (spot_ack, perp_ack) = tokio::join!(
            adapter.place_market_quote(symbol, Side::Buy, sizing.spot_buy_qty * bba.ask),
            adapter.place_aggressive_limit(
                symbol,
                Side::Sell,
                sizing.short_sell_qty,
                bba.bid,
                CROSS_TICKS,
            ),
        );

        verify_open(symbol, adapter.clone(), adapter, spot_ack, perp_ack, sizing.short_sell_qty)
            .await
            .map(|(long_entry_price, short_entry_price, size_base)| OpenedLegs {
                long_entry_price,
                short_entry_price,
                size_base,
                balances_before,
            })
    }

    #[instrument(skip(self, position, venues), fields(symbol = %position.symbol))]
    async fn close(&self, position: &Position, venues: &VenuePair) -> Result<(), EngineError> {
        let adapter = venues.get(self.venue);
        close_cross_venue(&position.symbol, adapter.clone(), adapter).await
    }
}

async fn verify_open(
    symbol: &str,
    long_adapter: Arc<dyn VenueAdapter>,
    short_adapter: Arc<dyn VenueAdapter>,
    long_ack: Result<OrderAck, EngineError>,
    short_ack: Result<OrderAck, EngineError>,
    expected_size: Decimal,
) -> Result<(Decimal, Decimal, Decimal), EngineError> {
    match (long_ack, short_ack) {
        (Err(e), Ok(_)) => {
            error!(symbol, error = %e, "long leg failed to open, short leg succeeded — halting, no auto-unwind");
            Err(EngineError::PartialFillOnOpen {
                leg_ok: "short",
                leg_failed: "long",
            })
        }
        (Ok(_), Err(e)) => {
            error!(symbol, error = %e, "short leg failed to open, long leg succeeded — halting, no auto-unwind");
            Err(EngineError::PartialFillOnOpen {
                leg_ok: "long",
                leg_failed: "short",
            })
        }
        (Err(long_e), Err(short_e)) => {
            warn!(symbol, %long_e, %short_e, "both legs failed to open");
            Err(long_e)
        }
        (Ok(_), Ok(_)) => {
            tokio::time::sleep(SETTLE_DELAY).await;

            let (long_size, short_size) = tokio::join!(
                long_adapter.open_position_size(symbol),
                short_adapter.open_position_size(symbol),
            );
            let long_size = long_size?;
            let short_size = short_size?;

            let tolerance = expected_size * Decimal::new(1, 2); // 1% of expected size, bounded below by a lot step elsewhere
            let imbalance = (long_size.abs() - short_size.abs()).abs();

            if long_size.is_sign_positive()
                && long_size > Decimal::ZERO
                && short_size.is_sign_negative()
                && imbalance <= tolerance.max(Decimal::ZERO)
            {
                let long_bba = long_adapter.best_bid_ask(symbol).await?;
                let short_bba = short_adapter.best_bid_ask(symbol).await?;
                info!(symbol, long_size = %long_size, short_size = %short_size, "both legs verified open");
                Ok((long_bba.mid(), short_bba.mid(), long_size.min(short_size.abs())))
            } else {
                error!(
                    symbol,
                    %long_size,
                    %short_size,
                    "post-settle verification failed — sizes do not hedge as expected"
                );
                Err(EngineError::ReconciliationAmbiguous {
                    reason: format!(
                        "post-open verification mismatch: long={long_size} short={short_size}"
                    ),
                })
            }
        }
    }
}

#[instrument(skip(long_adapter, short_adapter))]
async fn close_cross_venue(
    symbol: &str,
    long_adapter: Arc<dyn VenueAdapter>,
    short_adapter: Arc<dyn VenueAdapter>,
) -> Result<(), EngineError> {
    let (long_close, short_close) = tokio::join!(
        long_adapter.close_position(symbol),
        short_adapter.close_position(symbol),
    );

    let long_ok = long_close.is_ok();
    let short_ok = short_close.is_ok();

    if !long_ok || !short_ok {
        if let Err(e) = &long_close {
            warn!(symbol, error = %e, "long leg close request failed");
        }
        if let Err(e) = &short_close {
            warn!(symbol, error = %e, "short leg close request failed");
        }
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    let (long_size, short_size) = tokio::join!(
        long_adapter.open_position_size(symbol),
        short_adapter.open_position_size(symbol),
    );
    let long_size = long_size.unwrap_or(Decimal::MAX);
    let short_size = short_size.unwrap_or(Decimal::MAX);

    let long_flat = long_size.abs() < Decimal::new(1, 6);
    let short_flat = short_size.abs() < Decimal::new(1, 6);

    match (long_flat, short_flat) {
        (true, true) => {
            info!(symbol, "both legs verified closed");
            Ok(())
        }
        (true, false) => {
            error!(symbol, short_size = %short_size, "only long leg closed");
            Err(EngineError::PartialClose {
                leg_ok: "long",
                leg_stuck: "short",
            })
        }
        (false, true) => {
            error!(symbol, long_size = %long_size, "only short leg closed");
            Err(EngineError::PartialClose {
                leg_ok: "short",
                leg_stuck: "long",
            })
        }
        (false, false) => {
            error!(symbol, long_size = %long_size, short_size = %short_size, "neither leg closed");
            Err(EngineError::PartialClose {
                leg_ok: "none",
                leg_stuck: "both",
            })
        }
    }
}

pub fn build_open_strategy(
    kind: crate::config::OpenStrategyKind,
) -> Box<dyn OpenStrategy> {
    match kind {
        crate::config::OpenStrategyKind::CrossVenue => Box::new(CrossVenueOpen),
        crate::config::OpenStrategyKind::SingleVenueSpotPerp => {
            Box::new(SingleVenueSpotPerpOpen { venue: VenueId::A })
        }
    }
}
