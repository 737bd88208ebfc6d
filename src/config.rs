// =============================================================================
// Rotation Configuration — hot-editable engine settings with atomic save
// =============================================================================
//
// Every tunable named in the config table lives here so the engine can be
// retuned by editing the JSON file on disk, without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default = "...")]` so that adding a new
// field never breaks loading an older config file.

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::PnlAccountingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_capital_fraction() -> Decimal {
    dec!(0.95)
}

fn default_min_funding_apr() -> Decimal {
    dec!(10)
}

fn default_use_funding_ma() -> bool {
    true
}

fn default_funding_ma_periods() -> u32 {
    3
}

fn default_min_volume_usd() -> Decimal {
    dec!(1000000)
}

fn default_max_spread_pct() -> Decimal {
    dec!(0.05)
}

fn default_fee_coverage_multiplier() -> Decimal {
    dec!(3)
}

fn default_max_position_age_hours() -> f64 {
    72.0
}

fn default_hold_duration_hours() -> f64 {
    8.0
}

fn default_loop_interval_seconds() -> u64 {
    60
}

fn default_wait_between_cycles_minutes() -> u64 {
    5
}

fn default_check_interval_seconds() -> u64 {
    30
}

fn default_leverage() -> u32 {
    3
}

fn default_symbols_to_monitor() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "XRP".to_string(),
        "DOGE".to_string(),
    ]
}

// =============================================================================
// CapitalManagement
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalManagementConfig {
    /// Fraction of available capital to deploy on the limiting venue.
    #[serde(default = "default_capital_fraction")]
    pub capital_fraction: Decimal,
}

impl Default for CapitalManagementConfig {
    fn default() -> Self {
        Self {
            capital_fraction: default_capital_fraction(),
        }
    }
}

// =============================================================================
// FundingRateStrategy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateStrategyConfig {
    /// Minimum net annualized funding rate, as a percentage, to consider a
    /// symbol an opportunity.
    #[serde(default = "default_min_funding_apr")]
    pub min_funding_apr: Decimal,

    /// Whether to rank on a moving average of recent funding samples rather
    /// than the single latest sample.
    #[serde(default = "default_use_funding_ma")]
    pub use_funding_ma: bool,

    /// Number of trailing funding periods averaged when `use_funding_ma`.
    #[serde(default = "default_funding_ma_periods")]
    pub funding_ma_periods: u32,

    /// Minimum combined 24h quote volume across both venues, in USD.
    #[serde(default = "default_min_volume_usd")]
    pub min_volume_usd: Decimal,

    /// Maximum tolerated cross-venue mid-price spread, as a percentage.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: Decimal,
}

impl Default for FundingRateStrategyConfig {
    fn default() -> Self {
        Self {
            min_funding_apr: default_min_funding_apr(),
            use_funding_ma: default_use_funding_ma(),
            funding_ma_periods: default_funding_ma_periods(),
            min_volume_usd: default_min_volume_usd(),
            max_spread_pct: default_max_spread_pct(),
        }
    }
}

// =============================================================================
// PositionManagement
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionManagementConfig {
    /// Expected round-trip fees must be covered this many times over by
    /// accrued funding before the fee-coverage exit rule fires.
    #[serde(default = "default_fee_coverage_multiplier")]
    pub fee_coverage_multiplier: Decimal,

    /// Hard ceiling on hold time regardless of fee coverage.
    #[serde(default = "default_max_position_age_hours")]
    pub max_position_age_hours: f64,

    /// Target hold duration used to plan the next funding payment capture.
    #[serde(default = "default_hold_duration_hours")]
    pub hold_duration_hours: f64,

    /// Main loop cadence while IDLE/ANALYZING/WAITING.
    #[serde(default = "default_loop_interval_seconds")]
    pub loop_interval_seconds: u64,

    /// Cooldown after a closed cycle before the scanner runs again.
    #[serde(default = "default_wait_between_cycles_minutes")]
    pub wait_between_cycles_minutes: u64,

    /// HOLDING tick cadence.
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for PositionManagementConfig {
    fn default() -> Self {
        Self {
            fee_coverage_multiplier: default_fee_coverage_multiplier(),
            max_position_age_hours: default_max_position_age_hours(),
            hold_duration_hours: default_hold_duration_hours(),
            loop_interval_seconds: default_loop_interval_seconds(),
            wait_between_cycles_minutes: default_wait_between_cycles_minutes(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

// =============================================================================
// LeverageSettings
// =============================================================================

/// Leverage outside this range cannot be satisfied safely by the stop-loss
/// formula in `monitor.rs` and is clamped rather than rejected outright.
pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeverageSettingsConfig {
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl Default for LeverageSettingsConfig {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
        }
    }
}

impl LeverageSettingsConfig {
    /// Clamp an out-of-range leverage into `[MIN_LEVERAGE, MAX_LEVERAGE]`,
    /// logging a warning when a clamp actually occurs.
    fn clamp_and_warn(&mut self) {
        let clamped = self.leverage.clamp(MIN_LEVERAGE, MAX_LEVERAGE);
        if clamped != self.leverage {
            warn!(
                configured = self.leverage,
                clamped, "configured leverage out of range, clamping"
            );
            self.leverage = clamped;
        }
    }
}

// =============================================================================
// Universe
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default = "default_symbols_to_monitor")]
    pub symbols_to_monitor: Vec<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            symbols_to_monitor: default_symbols_to_monitor(),
        }
    }
}

// =============================================================================
// Execution — which OpenStrategy/CloseStrategy pairing drives C5
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OpenStrategyKind {
    /// Long one venue's perp, short the other venue's perp on the same symbol.
    #[default]
    CrossVenue,
    /// Long spot + short perp on a single venue (alternate open variant).
    SingleVenueSpotPerp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub open_strategy: OpenStrategyKind,
    #[serde(default)]
    pub pnl_accounting_mode: PnlAccountingMode,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            open_strategy: OpenStrategyKind::default(),
            pnl_accounting_mode: PnlAccountingMode::default(),
        }
    }
}

// =============================================================================
// RotationConfig
// =============================================================================

/// Top-level rotation engine configuration.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RotationConfig {
    #[serde(default)]
    pub capital_management: CapitalManagementConfig,

    #[serde(default)]
    pub funding_rate_strategy: FundingRateStrategyConfig,

    #[serde(default)]
    pub position_management: PositionManagementConfig,

    #[serde(default)]
    pub leverage_settings: LeverageSettingsConfig,

    #[serde(default)]
    pub universe: UniverseConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl RotationConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rotation config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse rotation config from {}", path.display()))?;

        config.leverage_settings.clamp_and_warn();

        info!(
            path = %path.display(),
            symbols = ?config.universe.symbols_to_monitor,
            leverage = config.leverage_settings.leverage,
            "rotation config loaded"
        );

        Ok(config)
    }

    /// Load from `path`, falling back to defaults (and logging a warning) if
    /// the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "rotation config not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize rotation config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "rotation config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RotationConfig::default();
        assert_eq!(cfg.capital_management.capital_fraction, dec!(0.95));
        assert_eq!(cfg.funding_rate_strategy.min_funding_apr, dec!(10));
        assert!(cfg.funding_rate_strategy.use_funding_ma);
        assert_eq!(cfg.funding_rate_strategy.funding_ma_periods, 3);
        assert_eq!(cfg.leverage_settings.leverage, 3);
        assert_eq!(cfg.universe.symbols_to_monitor.len(), 5);
        assert_eq!(cfg.execution.open_strategy, OpenStrategyKind::CrossVenue);
        assert_eq!(
            cfg.execution.pnl_accounting_mode,
            PnlAccountingMode::BalanceDelta
        );
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RotationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.leverage_settings.leverage, 3);
        assert_eq!(cfg.position_management.hold_duration_hours, 8.0);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "leverage_settings": { "leverage": 5 } }"#;
        let cfg: RotationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.leverage_settings.leverage, 5);
        assert_eq!(cfg.capital_management.capital_fraction, dec!(0.95));
        assert_eq!(cfg.universe.symbols_to_monitor.len(), 5);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RotationConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RotationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            cfg.universe.symbols_to_monitor,
            cfg2.universe.symbols_to_monitor
        );
        assert_eq!(
            cfg.leverage_settings.leverage,
            cfg2.leverage_settings.leverage
        );
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let cfg = RotationConfig::load_or_default("/nonexistent/path/rotation.json").unwrap();
        assert_eq!(cfg.leverage_settings.leverage, default_leverage());
    }

    #[test]
    fn out_of_range_leverage_is_clamped_on_load() {
        let path = std::env::temp_dir().join(format!(
            "rotation-bot-test-leverage-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "leverage_settings": { "leverage": 999 } }"#).unwrap();
        let cfg = RotationConfig::load(&path).unwrap();
        assert_eq!(cfg.leverage_settings.leverage, MAX_LEVERAGE);
        std::fs::remove_file(&path).ok();
    }
}
