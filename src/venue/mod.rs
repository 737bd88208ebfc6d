// =============================================================================
// Venue Adapter — the single abstraction every component trades through
// =============================================================================
//
// Everything above this module (scanner, sizing, executor, monitor,
// reconciler) depends only on `Arc<dyn VenueAdapter>`, never on a concrete
// venue type. The cross-venue and single-venue-spot-perp open strategies
// (executor.rs) generalize over either venue pairing without caring which
// concrete adapter sits where.

mod rate_limit;
mod rest_client;

pub use rate_limit::{RateLimitSnapshot, VenueRateLimiter};
pub use rest_client::RestVenueAdapter;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::types::{AccountBalance, BestBidAsk, FundingSample, SymbolMetadata, VenueId};

/// Buy or sell side for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Result of dispatching an order: the venue's reported fill size and price,
/// used by the executor for post-dispatch verification.
#[derive(Debug, Clone, Copy)]
pub struct OrderAck {
    pub size_base: Decimal,
    pub avg_price: Decimal,
}

/// Typed façade over a single perpetual-futures venue.
///
/// Two concrete implementations exist — one per venue — both backed by
/// [`RestVenueAdapter`], each wrapping a signed-HTTP client that signs
/// requests the same way Binance's REST API does: HMAC-SHA256 over a
/// `timestamp + recvWindow` query string, with the API key sent as a header.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn id(&self) -> VenueId;

    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk, EngineError>;

    async fn current_funding_rate(&self, symbol: &str) -> Result<FundingSample, EngineError>;

    async fn funding_rate_history(
        &self,
        symbol: &str,
        n: u32,
    ) -> Result<Vec<FundingSample>, EngineError>;

    /// Funding interval in hours. Prefers advertised metadata; falls back to
    /// modal difference of historical funding timestamps; falls back further
    /// to an 8h default only when fewer than 2 samples are available.
    async fn funding_interval_hours(&self, symbol: &str) -> Result<f64, EngineError> {
        if let Ok(meta) = self.symbol_metadata(symbol).await {
            if let Some(hours) = meta.funding_interval_hours {
                return Ok(hours);
            }
        }

        let history = self.funding_rate_history(symbol, 8).await?;
        if history.len() < 2 {
            return Ok(8.0);
        }

        let mut diffs: Vec<i64> = history
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_minutes().abs())
            .collect();
        diffs.sort_unstable();

        let mut best_minutes = diffs[0];
        let mut best_count = 1usize;
        let mut i = 0;
        while i < diffs.len() {
            let mut j = i + 1;
            while j < diffs.len() && diffs[j] == diffs[i] {
                j += 1;
            }
            if j - i > best_count {
                best_count = j - i;
                best_minutes = diffs[i];
            }
            i = j;
        }

        Ok((best_minutes as f64 / 60.0).max(1.0))
    }

    async fn quote_volume_24h(&self, symbol: &str) -> Result<Decimal, EngineError>;

    async fn symbol_metadata(&self, symbol: &str) -> Result<SymbolMetadata, EngineError>;

    async fn account_balance(&self) -> Result<AccountBalance, EngineError>;

    /// Signed open position size: positive = long, negative = short, zero = flat.
    async fn open_position_size(&self, symbol: &str) -> Result<Decimal, EngineError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError>;

    async fn get_leverage(&self, symbol: &str) -> Result<u32, EngineError>;

    /// Submit a marketable limit priced `reference_price ± cross_ticks × price_tick`
    /// (plus for buys, minus for sells) for a fast fill with bounded slippage.
    async fn place_aggressive_limit(
        &self,
        symbol: &str,
        side: Side,
        size_base: Decimal,
        reference_price: Decimal,
        cross_ticks: u32,
    ) -> Result<OrderAck, EngineError>;

    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        size_base: Decimal,
    ) -> Result<OrderAck, EngineError>;

    async fn place_market_quote(
        &self,
        symbol: &str,
        side: Side,
        quote_qty: Decimal,
    ) -> Result<OrderAck, EngineError>;

    /// Flatten any open position on `symbol` with an aggressive limit.
    async fn close_position(&self, symbol: &str) -> Result<OrderAck, EngineError>;

    /// Sum of funding income received on `symbol` since `since`.
    async fn funding_income_since(
        &self,
        symbol: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Decimal, EngineError>;
}
