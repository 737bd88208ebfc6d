// =============================================================================
// Opportunity Scanner — ranks symbols by delta-neutral funding-rate APR
// =============================================================================
//
// Stateless given its inputs, mirroring the original strategy_logic.py's
// pure analyze_funding_opportunities / find_delta_neutral_pairs design —
// every decision here is a function of the data fetched this cycle, nothing
// cached across calls.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::config::FundingRateStrategyConfig;
use crate::types::{ExclusionReason, Opportunity, ScanResult, VenueId};
use crate::venue::{run_staggered, VenueAdapter};

/// Per-symbol raw data pulled from both venues before ranking.
struct SymbolSnapshot {
    symbol: String,
    apr_a: Decimal,
    apr_b: Decimal,
    current_rate_a: Decimal,
    current_rate_b: Decimal,
    combined_volume: Decimal,
    cross_spread_pct: Decimal,
    interval_a_hours: f64,
    interval_b_hours: f64,
}

/// Scan `symbols` across `venue_a`/`venue_b` and rank eligible opportunities.
#[instrument(skip(venue_a, venue_b, cfg, symbols))]
pub async fn scan(
    symbols: &[String],
    venue_a: Arc<dyn VenueAdapter>,
    venue_b: Arc<dyn VenueAdapter>,
    cfg: &FundingRateStrategyConfig,
) -> ScanResult {
    let items: Vec<String> = symbols.to_vec();

    let per_symbol: Vec<(String, Result<SymbolSnapshot, ExclusionReason>)> = run_staggered(
        items,
        Duration::from_millis(750),
        {
            let venue_a = venue_a.clone();
            let venue_b = venue_b.clone();
            let cfg = cfg.clone();
            move |symbol: String| {
                let venue_a = venue_a.clone();
                let venue_b = venue_b.clone();
                let cfg = cfg.clone();
                async move {
                    let result = fetch_snapshot(&symbol, venue_a, venue_b, &cfg).await;
                    (symbol, result)
                }
            }
        },
    )
    .await;

    let mut ranked = Vec::new();
    let mut excluded = Vec::new();

    for (symbol, result) in per_symbol {
        match result {
            Err(reason) => excluded.push((symbol, reason)),
            Ok(snap) => match evaluate(snap, cfg) {
                Ok(opp) => ranked.push(opp),
                Err(reason) => excluded.push((symbol, reason)),
            },
        }
    }

    ranked.sort_by(|a, b| {
        b.net_apr
            .cmp(&a.net_apr)
            .then_with(|| b.combined_24h_volume_usd.cmp(&a.combined_24h_volume_usd))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    debug!(
        ranked = ranked.len(),
        excluded = excluded.len(),
        "scan complete"
    );

    ScanResult { ranked, excluded }
}

async fn fetch_snapshot(
    symbol: &str,
    venue_a: Arc<dyn VenueAdapter>,
    venue_b: Arc<dyn VenueAdapter>,
    cfg: &FundingRateStrategyConfig,
) -> Result<SymbolSnapshot, ExclusionReason> {
    let (rate_a, rate_b, vol_a, vol_b, bba_a, bba_b, interval_a, interval_b) = tokio::join!(
        venue_a.current_funding_rate(symbol),
        venue_b.current_funding_rate(symbol),
        venue_a.quote_volume_24h(symbol),
        venue_b.quote_volume_24h(symbol),
        venue_a.best_bid_ask(symbol),
        venue_b.best_bid_ask(symbol),
        venue_a.funding_interval_hours(symbol),
        venue_b.funding_interval_hours(symbol),
    );

    let rate_a = rate_a.map_err(|e| data_unavailable(&e))?;
    let rate_b = rate_b.map_err(|e| data_unavailable(&e))?;
    let vol_a = vol_a.map_err(|e| data_unavailable(&e))?;
    let vol_b = vol_b.map_err(|e| data_unavailable(&e))?;
    let bba_a = bba_a.map_err(|e| data_unavailable(&e))?;
    let bba_b = bba_b.map_err(|e| data_unavailable(&e))?;
    let interval_a = interval_a.map_err(|e| data_unavailable(&e))?;
    let interval_b = interval_b.map_err(|e| data_unavailable(&e))?;

    let mut apr_a = rate_a.apr_pct();
    let mut apr_b = rate_b.apr_pct();

    if cfg.use_funding_ma {
        if let (Ok(hist_a), Ok(hist_b)) = (
            venue_a
                .funding_rate_history(symbol, cfg.funding_ma_periods)
                .await,
            venue_b
                .funding_rate_history(symbol, cfg.funding_ma_periods)
                .await,
        ) {
            if !hist_a.is_empty() {
                apr_a = average_apr(&hist_a, interval_a);
            }
            if !hist_b.is_empty() {
                apr_b = average_apr(&hist_b, interval_b);
            }
        }
    }

    let combined_volume = vol_a + vol_b;
    let mid_a = bba_a.mid();
    let mid_b = bba_b.mid();
    let avg_mid = (mid_a + mid_b) / Decimal::TWO;
    let cross_spread_pct = if avg_mid.is_zero() {
        Decimal::ZERO
    } else {
        ((mid_a - mid_b).abs() / avg_mid) * Decimal::ONE_HUNDRED
    };

    Ok(SymbolSnapshot {
        symbol: symbol.to_string(),
        apr_a,
        apr_b,
        current_rate_a: rate_a.rate,
        current_rate_b: rate_b.rate,
        combined_volume,
        cross_spread_pct,
        interval_a_hours: interval_a,
        interval_b_hours: interval_b,
    })
}

fn average_apr(history: &[crate::types::FundingSample], period_hours: f64) -> Decimal {
    let sum: Decimal = history.iter().map(|s| s.rate).sum();
    let mean_rate = sum / Decimal::from(history.len());
    let periods_per_day = Decimal::from_f64_retain(24.0 / period_hours).unwrap_or_default();
    mean_rate * periods_per_day * Decimal::from(365) * Decimal::ONE_HUNDRED
}

/// Classify a per-leg fetch failure for exclusion purposes. Errors that are
/// plausibly this-cycle-only (transport hiccup, venue 404, rate limit) just
/// drop the symbol; anything else (auth, venue reject) is logged loudly
/// since it likely means every symbol on that venue is about to fail too.
fn data_unavailable(e: &crate::error::EngineError) -> ExclusionReason {
    if e.is_rate_limited() {
        return ExclusionReason::Timeout;
    }
    if !e.is_data_unavailable() {
        warn!(error = %e, "symbol fetch failed with a non-transient error, excluding for this cycle");
    }
    ExclusionReason::DataUnavailable
}

fn evaluate(
    snap: SymbolSnapshot,
    cfg: &FundingRateStrategyConfig,
) -> Result<Opportunity, ExclusionReason> {
    if snap.combined_volume < cfg.min_volume_usd {
        return Err(ExclusionReason::VolumeTooLow);
    }
    if snap.cross_spread_pct > cfg.max_spread_pct {
        return Err(ExclusionReason::SpreadTooWide);
    }

    // Long A / short B nets (apr_b - apr_a); long B / short A nets the reverse.
    let net_long_a = snap.apr_b - snap.apr_a;
    let net_long_b = snap.apr_a - snap.apr_b;

    let (long_venue, short_venue, net_apr, current_rate_in_direction, short_interval_hours) =
        if net_long_a >= net_long_b {
            (
                VenueId::A,
                VenueId::B,
                net_long_a,
                snap.current_rate_b,
                snap.interval_b_hours,
            )
        } else {
            (
                VenueId::B,
                VenueId::A,
                net_long_b,
                snap.current_rate_a,
                snap.interval_a_hours,
            )
        };

    // The short leg's current funding rate must be strictly positive: we
    // collect funding by being short where funding is paid by longs.
    if current_rate_in_direction <= Decimal::ZERO {
        return Err(ExclusionReason::NegativeRate);
    }

    if net_apr < cfg.min_funding_apr {
        return Err(ExclusionReason::BelowAprThreshold);
    }

    Ok(Opportunity {
        symbol: snap.symbol,
        long_venue,
        short_venue,
        long_apr: snap.apr_a,
        short_apr: snap.apr_b,
        net_apr,
        combined_24h_volume_usd: snap.combined_volume,
        cross_spread_pct: snap.cross_spread_pct,
        funding_freq_per_day: Decimal::from_f64_retain(24.0 / short_interval_hours)
            .unwrap_or(Decimal::from(3)),
        using_ma_flag: cfg.use_funding_ma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg() -> FundingRateStrategyConfig {
        FundingRateStrategyConfig {
            min_funding_apr: dec!(10),
            use_funding_ma: false,
            funding_ma_periods: 3,
            min_volume_usd: dec!(1000000),
            max_spread_pct: dec!(0.05),
        }
    }

    fn snap(apr_a: Decimal, apr_b: Decimal, rate_a: Decimal, rate_b: Decimal) -> SymbolSnapshot {
        SymbolSnapshot {
            symbol: "SOL".into(),
            apr_a,
            apr_b,
            current_rate_a: rate_a,
            current_rate_b: rate_b,
            combined_volume: dec!(5000000),
            cross_spread_pct: dec!(0.01),
            interval_a_hours: 8.0,
            interval_b_hours: 8.0,
        }
    }

    #[test]
    fn picks_higher_net_apr_direction() {
        let s = snap(dec!(5), dec!(20), dec!(0.0001), dec!(0.0004));
        let opp = evaluate(s, &cfg()).unwrap();
        assert_eq!(opp.long_venue, VenueId::A);
        assert_eq!(opp.short_venue, VenueId::B);
        assert_eq!(opp.net_apr, dec!(15));
    }

    #[test]
    fn negative_current_rate_in_direction_excludes() {
        let s = snap(dec!(5), dec!(20), dec!(0.0001), dec!(-0.0004));
        assert_eq!(evaluate(s, &cfg()), Err(ExclusionReason::NegativeRate));
    }

    #[test]
    fn below_apr_threshold_excludes() {
        let s = snap(dec!(5), dec!(8), dec!(0.0001), dec!(0.0002));
        assert_eq!(
            evaluate(s, &cfg()),
            Err(ExclusionReason::BelowAprThreshold)
        );
    }

    #[test]
    fn volume_too_low_excludes_before_direction_check() {
        let mut s = snap(dec!(5), dec!(20), dec!(0.0001), dec!(0.0004));
        s.combined_volume = dec!(100);
        assert_eq!(evaluate(s, &cfg()), Err(ExclusionReason::VolumeTooLow));
    }

    #[test]
    fn spread_too_wide_excludes() {
        let mut s = snap(dec!(5), dec!(20), dec!(0.0001), dec!(0.0004));
        s.cross_spread_pct = dec!(1.0);
        assert_eq!(evaluate(s, &cfg()), Err(ExclusionReason::SpreadTooWide));
    }
}
