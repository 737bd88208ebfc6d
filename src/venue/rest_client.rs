// =============================================================================
// REST Venue Adapter — HMAC-SHA256 signed requests, one instance per venue
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every signed
// request carries an API-key header and a recvWindow tolerant of minor clock
// drift between this process and the venue's servers.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::decimal_math;
use crate::error::EngineError;
use crate::types::{AccountBalance, BestBidAsk, FundingSample, SymbolMetadata, VenueId};
use crate::venue::rate_limit::{RateLimitSnapshot, VenueRateLimiter};
use crate::venue::{OrderAck, Side, VenueAdapter};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW_MS: u64 = 5000;

/// Signed-HTTP façade for one perpetual-futures venue. Every request runs
/// through this venue's [`VenueRateLimiter`], so a burst of scanner calls
/// never exceeds the venue's concurrency budget and a 429 gets retried with
/// backoff rather than surfaced straight to the caller.
#[derive(Clone)]
pub struct RestVenueAdapter {
    id: VenueId,
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: Arc<VenueRateLimiter>,
}

impl RestVenueAdapter {
    pub fn new(
        id: VenueId,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self::with_rate_limiter(
            id,
            api_key,
            secret,
            base_url,
            Arc::new(VenueRateLimiter::new(
                5,
                Duration::from_millis(250),
                Duration::from_secs(10),
                4,
            )),
        )
    }

    pub fn with_rate_limiter(
        id: VenueId,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        rate_limiter: Arc<VenueRateLimiter>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(venue = %id, "RestVenueAdapter initialised");

        Self {
            id,
            api_key,
            secret,
            base_url: base_url.into(),
            client,
            rate_limiter,
        }
    }

    /// Current permit/retry posture, surfaced through the status API.
    pub fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.rate_limiter.snapshot()
    }

    fn venue_name(&self) -> &'static str {
        match self.id {
            VenueId::A => "venue_a",
            VenueId::B => "venue_b",
        }
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Append timestamp + recvWindow + signature to a query string.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn transport_err(&self, source: anyhow::Error) -> EngineError {
        EngineError::Transport {
            venue: self.venue_name(),
            source,
        }
    }

    /// Signed GET, re-signed from scratch on every retry since the timestamp
    /// in the signature would otherwise go stale past `RECV_WINDOW_MS`.
    async fn get_signed(&self, path: &str, params: &str) -> Result<serde_json::Value, EngineError> {
        self.rate_limiter
            .run(|| async {
                let qs = self.signed_query(params);
                let url = format!("{}{}?{}", self.base_url, path, qs);
                self.send(self.client.get(&url)).await
            })
            .await
    }

    async fn post_signed(&self, path: &str, params: &str) -> Result<serde_json::Value, EngineError> {
        self.rate_limiter
            .run(|| async {
                let qs = self.signed_query(params);
                let url = format!("{}{}?{}", self.base_url, path, qs);
                self.send(self.client.post(&url)).await
            })
            .await
    }

    async fn get_public(&self, path: &str, params: &str) -> Result<serde_json::Value, EngineError> {
        self.rate_limiter
            .run(|| async {
                let url = if params.is_empty() {
                    format!("{}{}", self.base_url, path)
                } else {
                    format!("{}{}?{}", self.base_url, path, params)
                };
                self.send(self.client.get(&url)).await
            })
            .await
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<serde_json::Value, EngineError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| self.transport_err(anyhow::anyhow!(e)))?;

        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited {
                venue: self.venue_name(),
                retry_after_ms: 1000,
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EngineError::Auth {
                venue: self.venue_name(),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.transport_err(anyhow::anyhow!(e)))?;

        if !status.is_success() {
            let code = body["code"].as_str().unwrap_or("unknown").to_string();
            let msg = body["msg"].as_str().unwrap_or("").to_string();
            let msg_lower = msg.to_ascii_lowercase();

            if msg_lower.contains("insufficient") && msg_lower.contains("balance") {
                return Err(EngineError::InsufficientBalance {
                    venue: self.venue_name(),
                    needed: "unknown".to_string(),
                    available: msg.clone(),
                });
            }
            if msg_lower.contains("min notional") || msg_lower.contains("below minimum") || msg_lower.contains("lot size") {
                return Err(EngineError::MinimumSize {
                    venue: self.venue_name(),
                    size: "unknown".to_string(),
                    minimum: msg.clone(),
                });
            }

            return Err(EngineError::VenueReject {
                venue: self.venue_name(),
                code,
                msg,
            });
        }

        Ok(body)
    }

    fn parse_decimal(val: &serde_json::Value) -> Result<Decimal, EngineError> {
        let raw = if let Some(s) = val.as_str() {
            s.to_string()
        } else if let Some(n) = val.as_f64() {
            n.to_string()
        } else {
            return Err(EngineError::Transport {
                venue: "unknown",
                source: anyhow::anyhow!("expected string or number, got {val}"),
            });
        };
        raw.parse::<Decimal>()
            .map_err(|e| EngineError::Transport {
                venue: "unknown",
                source: anyhow::anyhow!("failed to parse '{raw}' as Decimal: {e}"),
            })
    }
}

impl std::fmt::Debug for RestVenueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestVenueAdapter")
            .field("venue", &self.id)
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl VenueAdapter for RestVenueAdapter {
    fn id(&self) -> VenueId {
        self.id
    }

    #[instrument(skip(self), name = "venue::best_bid_ask")]
    async fn best_bid_ask(&self, symbol: &str) -> Result<BestBidAsk, EngineError> {
        let body = self
            .get_public("/market/bookTicker", &format!("symbol={symbol}"))
            .await?;
        Ok(BestBidAsk {
            bid: Self::parse_decimal(&body["bidPrice"])?,
            ask: Self::parse_decimal(&body["askPrice"])?,
        })
    }

    #[instrument(skip(self), name = "venue::current_funding_rate")]
    async fn current_funding_rate(&self, symbol: &str) -> Result<FundingSample, EngineError> {
        let body = self
            .get_public("/market/premiumIndex", &format!("symbol={symbol}"))
            .await?;
        let rate = Self::parse_decimal(&body["lastFundingRate"])?;
        let ts_ms = body["time"].as_i64().unwrap_or(0);
        let timestamp = chrono::DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(chrono::Utc::now);
        Ok(FundingSample {
            rate,
            period_hours: 8.0,
            timestamp,
        })
    }

    #[instrument(skip(self), name = "venue::funding_rate_history")]
    async fn funding_rate_history(
        &self,
        symbol: &str,
        n: u32,
    ) -> Result<Vec<FundingSample>, EngineError> {
        let body = self
            .get_public(
                "/market/fundingRate",
                &format!("symbol={symbol}&limit={n}"),
            )
            .await?;

        let raw = body.as_array().ok_or_else(|| EngineError::Transport {
            venue: self.venue_name(),
            source: anyhow::anyhow!("fundingRate response is not an array"),
        })?;

        let mut samples = Vec::with_capacity(raw.len());
        for entry in raw {
            let rate = Self::parse_decimal(&entry["fundingRate"])?;
            let ts_ms = entry["fundingTime"].as_i64().unwrap_or(0);
            let timestamp =
                chrono::DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(chrono::Utc::now);
            samples.push(FundingSample {
                rate,
                period_hours: 8.0,
                timestamp,
            });
        }
        Ok(samples)
    }

    #[instrument(skip(self), name = "venue::quote_volume_24h")]
    async fn quote_volume_24h(&self, symbol: &str) -> Result<Decimal, EngineError> {
        let body = self
            .get_public("/market/ticker24hr", &format!("symbol={symbol}"))
            .await?;
        Self::parse_decimal(&body["quoteVolume"])
    }

    #[instrument(skip(self), name = "venue::symbol_metadata")]
    async fn symbol_metadata(&self, symbol: &str) -> Result<SymbolMetadata, EngineError> {
        let body = self
            .get_public("/market/exchangeInfo", &format!("symbol={symbol}"))
            .await?;

        let price_tick = Self::parse_decimal(&body["priceTick"])?;
        let lot_step = Self::parse_decimal(&body["lotStep"])?;
        let min_notional = Self::parse_decimal(&body["minNotional"])?;
        let funding_interval_hours = body["fundingIntervalHours"].as_f64();

        Ok(SymbolMetadata {
            price_tick,
            lot_step,
            min_notional,
            funding_interval_hours,
        })
    }

    #[instrument(skip(self), name = "venue::account_balance")]
    async fn account_balance(&self) -> Result<AccountBalance, EngineError> {
        let body = self.get_signed("/account/balance", "").await?;
        Ok(AccountBalance {
            total: Self::parse_decimal(&body["totalEquity"])?,
            available: Self::parse_decimal(&body["availableBalance"])?,
        })
    }

    #[instrument(skip(self), name = "venue::open_position_size")]
    async fn open_position_size(&self, symbol: &str) -> Result<Decimal, EngineError> {
        let body = self
            .get_signed("/account/position", &format!("symbol={symbol}"))
            .await?;
        if body.is_null() {
            return Ok(Decimal::ZERO);
        }
        Self::parse_decimal(&body["positionAmt"])
    }

    #[instrument(skip(self), name = "venue::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        self.post_signed(
            "/account/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "venue::get_leverage")]
    async fn get_leverage(&self, symbol: &str) -> Result<u32, EngineError> {
        let body = self
            .get_signed("/account/leverage", &format!("symbol={symbol}"))
            .await?;
        Ok(body["leverage"].as_u64().unwrap_or(1) as u32)
    }

    #[instrument(skip(self), name = "venue::place_aggressive_limit")]
    async fn place_aggressive_limit(
        &self,
        symbol: &str,
        side: Side,
        size_base: Decimal,
        reference_price: Decimal,
        cross_ticks: u32,
    ) -> Result<OrderAck, EngineError> {
        let meta = self.symbol_metadata(symbol).await?;
        let tick_offset = meta.price_tick * Decimal::from(cross_ticks);
        let limit_price = match side {
            Side::Buy => reference_price + tick_offset,
            Side::Sell => reference_price - tick_offset,
        };

        let precision = decimal_math::step_precision(meta.price_tick);
        let qty_precision = decimal_math::step_precision(meta.lot_step);
        let price_str = decimal_math::truncate(limit_price, precision);
        let qty_str = decimal_math::truncate(size_base, qty_precision);

        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };

        let params = format!(
            "symbol={symbol}&side={side_str}&type=LIMIT&timeInForce=IOC&quantity={qty_str}&price={price_str}"
        );

        let body = self.post_signed("/order", &params).await?;
        Ok(OrderAck {
            size_base: Self::parse_decimal(&body["executedQty"])?,
            avg_price: Self::parse_decimal(&body["avgPrice"])?,
        })
    }

    #[instrument(skip(self), name = "venue::place_market")]
    async fn place_market(
        &self,
        symbol: &str,
        side: Side,
        size_base: Decimal,
    ) -> Result<OrderAck, EngineError> {
        let meta = self.symbol_metadata(symbol).await?;
        let qty_precision = decimal_math::step_precision(meta.lot_step);
        let qty_str = decimal_math::truncate(size_base, qty_precision);

        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let params = format!("symbol={symbol}&side={side_str}&type=MARKET&quantity={qty_str}");

        let body = self.post_signed("/order", &params).await?;
        Ok(OrderAck {
            size_base: Self::parse_decimal(&body["executedQty"])?,
            avg_price: Self::parse_decimal(&body["avgPrice"])?,
        })
    }

    #[instrument(skip(self), name = "venue::place_market_quote")]
    async fn place_market_quote(
        &self,
        symbol: &str,
        side: Side,
        quote_qty: Decimal,
    ) -> Result<OrderAck, EngineError> {
        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let params = format!("symbol={symbol}&side={side_str}&type=MARKET&quoteQty={quote_qty}");

        let body = self.post_signed("/order", &params).await?;
        Ok(OrderAck {
            size_base: Self::parse_decimal(&body["executedQty"])?,
            avg_price: Self::parse_decimal(&body["avgPrice"])?,
        })
    }

    #[instrument(skip(self), name = "venue::close_position")]
    async fn close_position(&self, symbol: &str) -> Result<OrderAck, EngineError> {
        let current = self.open_position_size(symbol).await?;
        if current.is_zero() {
            warn!(symbol, "close_position called with no open position");
            return Ok(OrderAck {
                size_base: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            });
        }

        let side = if current.is_sign_positive() {
            Side::Sell
        } else {
            Side::Buy
        };
        let bba = self.best_bid_ask(symbol).await?;
        let reference_price = match side {
            Side::Sell => bba.bid,
            Side::Buy => bba.ask,
        };

        self.place_aggressive_limit(symbol, side, current.abs(), reference_price, 100)
            .await
    }

    #[instrument(skip(self), name = "venue::funding_income_since")]
    async fn funding_income_since(
        &self,
        symbol: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Decimal, EngineError> {
        let body = self
            .get_signed(
                "/account/income",
                &format!("symbol={symbol}&incomeType=FUNDING_FEE&startTime={}", since.timestamp_millis()),
            )
            .await?;

        let raw = body.as_array().ok_or_else(|| EngineError::Transport {
            venue: self.venue_name(),
            source: anyhow::anyhow!("income response is not an array"),
        })?;

        let mut total = Decimal::ZERO;
        for entry in raw {
            total += Self::parse_decimal(&entry["income"])?;
        }
        Ok(total)
    }
}
