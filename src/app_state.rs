// =============================================================================
// Shared Application State — status-surface snapshot (C11)
// =============================================================================
//
// The single source of truth the status API reads from. The controller is
// the only writer; it overwrites these fields once per loop tick. Readers
// take a `parking_lot::RwLock` read guard rather than cloning the whole
// state tree, the same split the dashboard snapshot builder used before
// this engine's domain change.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{BotState, CapitalStatus, CumulativeStats, Position};
use crate::venue::RateLimitSnapshot;

/// Central application state shared across the controller loop and the
/// status API via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every state
    /// write so polling clients can detect a change cheaply.
    pub state_version: AtomicU64,

    pub bot_state: RwLock<BotState>,
    pub current_position: RwLock<Option<Position>>,
    pub capital_status: RwLock<CapitalStatus>,
    pub cumulative_stats: RwLock<CumulativeStats>,
    pub rate_limit_a: RwLock<Option<RateLimitSnapshot>>,
    pub rate_limit_b: RwLock<Option<RateLimitSnapshot>>,
    pub last_error: RwLock<Option<String>>,
}

impl AppState {
    pub fn new(initial_capital: CapitalStatus) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            bot_state: RwLock::new(BotState::Idle),
            current_position: RwLock::new(None),
            capital_status: RwLock::new(initial_capital),
            cumulative_stats: RwLock::new(CumulativeStats::default()),
            rate_limit_a: RwLock::new(None),
            rate_limit_b: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the bot state and bump the version in one call, matching the
    /// write-then-notify shape every other mutator here uses.
    pub fn set_bot_state(&self, new_state: BotState) {
        *self.bot_state.write() = new_state;
        self.increment_version();
    }

    pub fn set_position(&self, position: Option<Position>) {
        *self.current_position.write() = position;
        self.increment_version();
    }

    pub fn set_capital_status(&self, status: CapitalStatus) {
        *self.capital_status.write() = status;
        self.increment_version();
    }

    pub fn set_cumulative_stats(&self, stats: CumulativeStats) {
        *self.cumulative_stats.write() = stats;
        self.increment_version();
    }

    pub fn set_rate_limits(&self, a: RateLimitSnapshot, b: RateLimitSnapshot) {
        *self.rate_limit_a.write() = Some(a);
        *self.rate_limit_b.write() = Some(b);
        self.increment_version();
    }

    pub fn set_last_error(&self, message: Option<String>) {
        *self.last_error.write() = message;
        self.increment_version();
    }

    /// Build a read-only snapshot for the `/state` endpoint.
    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: chrono::Utc::now().timestamp_millis(),
            bot_state: *self.bot_state.read(),
            current_position: self.current_position.read().clone(),
            capital_status: *self.capital_status.read(),
            cumulative_stats: self.cumulative_stats.read().clone(),
            rate_limit_a: *self.rate_limit_a.read(),
            rate_limit_b: *self.rate_limit_b.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// The JSON shape returned by `GET /state`.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub bot_state: BotState,
    pub current_position: Option<Position>,
    pub capital_status: CapitalStatus,
    pub cumulative_stats: CumulativeStats,
    pub rate_limit_a: Option<RateLimitSnapshot>,
    pub rate_limit_b: Option<RateLimitSnapshot>,
    pub last_error: Option<String>,
}
