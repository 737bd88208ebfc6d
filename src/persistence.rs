// =============================================================================
// State Machine Persistence — atomic, corruption-safe durable JSON state (C7)
// =============================================================================
//
// The controller is the single writer. Every transition rewrites the whole
// document through `path.tmp` + rename (§3.2 invariant 8), the same pattern
// `config.rs::RotationConfig::save` uses. An empty or malformed file on load
// is treated as "start fresh" — never a fatal error (§7 "state-file
// corruption").

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::types::{BotState, CapitalStatus, CompletedCycle, CumulativeStats, Position};

/// Completed cycles are retained as a capped FIFO of this many entries.
pub const MAX_COMPLETED_CYCLES: usize = 100;

/// Windows-like filesystems can report the rename target as transiently busy;
/// retry a handful of times with a short backoff before giving up.
const RENAME_MAX_ATTEMPTS: u32 = 3;
const RENAME_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The full durable document: `{version, state, current_cycle,
/// current_position, capital_status, completed_cycles, cumulative_stats,
/// config_snapshot, last_updated}` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub state: BotState,

    /// Monotonic counter of cycles attempted this process lifetime (and
    /// across restarts once loaded), independent of `cumulative_stats`.
    #[serde(default)]
    pub current_cycle: u64,

    #[serde(default)]
    pub current_position: Option<Position>,

    #[serde(default = "default_capital_status")]
    pub capital_status: CapitalStatus,

    #[serde(default)]
    pub completed_cycles: Vec<CompletedCycle>,

    #[serde(default)]
    pub cumulative_stats: CumulativeStats,

    /// A snapshot of the config that produced this state, retained purely
    /// for operator diagnostics — never read back to drive behavior.
    #[serde(default)]
    pub config_snapshot: Option<serde_json::Value>,

    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_capital_status() -> CapitalStatus {
    CapitalStatus::empty(Utc::now())
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: default_version(),
            state: BotState::default(),
            current_cycle: 0,
            current_position: None,
            capital_status: default_capital_status(),
            completed_cycles: Vec::new(),
            cumulative_stats: CumulativeStats::default(),
            config_snapshot: None,
            last_updated: Utc::now(),
        }
    }
}

impl PersistedState {
    /// Append a completed cycle, trimming the FIFO down to
    /// [`MAX_COMPLETED_CYCLES`] from the front (oldest first).
    pub fn push_completed_cycle(&mut self, cycle: CompletedCycle) {
        self.cumulative_stats.record_cycle(&cycle);
        self.completed_cycles.push(cycle);
        while self.completed_cycles.len() > MAX_COMPLETED_CYCLES {
            self.completed_cycles.remove(0);
        }
    }

    /// Load from `path`. Missing, empty, or malformed JSON all fall back to
    /// a fresh document with a warning — never a hard failure (§7).
    pub fn load_or_fresh(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no state file found, starting fresh");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read state file, starting fresh");
                return Self::default();
            }
        };

        if content.trim().is_empty() {
            warn!(path = %path.display(), "state file is empty, starting fresh");
            return Self::default();
        }

        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                let corruption = crate::error::EngineError::StateCorrupted(e.to_string());
                error!(path = %path.display(), error = %corruption, "state file corrupted, starting fresh");
                Self::default()
            }
        }
    }

    /// Persist atomically: write to `path.tmp`, then rename over `path`
    /// (§3.2 invariant 8, §4.7). Retries the rename a few times on
    /// transient "busy" errors, matching the behavior Windows-like
    /// filesystems can exhibit under concurrent readers.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize persisted state to JSON")?;

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state file to {}", tmp_path.display()))?;

        let mut last_err = None;
        for attempt in 1..=RENAME_MAX_ATTEMPTS {
            match std::fs::rename(&tmp_path, path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < RENAME_MAX_ATTEMPTS {
                        warn!(attempt, path = %path.display(), "state file rename busy, retrying");
                        std::thread::sleep(RENAME_RETRY_DELAY);
                    }
                }
            }
        }

        Err(last_err.unwrap()).with_context(|| {
            format!(
                "failed to rename tmp state file to {} after {} attempts",
                path.display(),
                RENAME_MAX_ATTEMPTS
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rotation-bot-test-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn load_or_fresh_when_file_missing() {
        let path = tmp_path("missing");
        let _ = std::fs::remove_file(&path);
        let state = PersistedState::load_or_fresh(&path);
        assert_eq!(state.state, BotState::Idle);
        assert!(state.current_position.is_none());
    }

    #[test]
    fn load_or_fresh_when_file_empty() {
        let path = tmp_path("empty");
        std::fs::write(&path, "").unwrap();
        let state = PersistedState::load_or_fresh(&path);
        assert_eq!(state.state, BotState::Idle);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_or_fresh_when_file_corrupted() {
        let path = tmp_path("corrupt");
        std::fs::write(&path, "{not valid json").unwrap();
        let state = PersistedState::load_or_fresh(&path);
        assert_eq!(state.state, BotState::Idle);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn save_then_load_roundtrips_deep_equal() {
        let path = tmp_path("roundtrip");
        let mut state = PersistedState::default();
        state.state = BotState::Waiting;
        state.current_cycle = 7;
        state.capital_status.refresh(
            crate::types::AccountBalance {
                total: dec!(1000),
                available: dec!(900),
            },
            crate::types::AccountBalance {
                total: dec!(1000),
                available: dec!(900),
            },
            2,
            Utc::now(),
        );

        state.save(&path).unwrap();
        let loaded = PersistedState::load_or_fresh(&path);

        assert_eq!(loaded.state, state.state);
        assert_eq!(loaded.current_cycle, state.current_cycle);
        assert_eq!(
            loaded.capital_status.initial_total_capital,
            state.capital_status.initial_total_capital
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn completed_cycles_trimmed_to_fifo_cap() {
        let mut state = PersistedState::default();
        let base = CompletedCycle {
            symbol: "SOL".into(),
            long_venue: crate::types::VenueId::A,
            short_venue: crate::types::VenueId::B,
            leverage: 1,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            duration_hours: 8.0,
            size_base: dec!(1),
            long_entry_price: dec!(100),
            short_entry_price: dec!(100),
            exit_prices: (dec!(100), dec!(100)),
            actual_notional: dec!(100),
            exit_balances: (
                crate::types::AccountBalance {
                    total: dec!(500),
                    available: dec!(500),
                },
                crate::types::AccountBalance {
                    total: dec!(500),
                    available: dec!(500),
                },
            ),
            realized_pnl_breakdown: Default::default(),
            cumulative_funding_received: dec!(1),
            entry_fees_paid: dec!(0.1),
            exit_reason: "FEE_COVERAGE_MET".into(),
            stop_loss_reason: None,
        };

        for _ in 0..(MAX_COMPLETED_CYCLES + 10) {
            state.push_completed_cycle(base.clone());
        }

        assert_eq!(state.completed_cycles.len(), MAX_COMPLETED_CYCLES);
        assert_eq!(state.cumulative_stats.total_cycles, (MAX_COMPLETED_CYCLES + 10) as u64);
    }
}
