// =============================================================================
// Engine error taxonomy — shared across venue adapters, sizing, and execution
// =============================================================================
//
// Every component that can fail in a way the controller needs to branch on
// (rather than just propagate) returns `Result<T, EngineError>`. Components
// that only ever add context for a human reader use `anyhow::Result` and
// `.context(...)` directly; `EngineError` sits underneath those chains at the
// point where the distinction actually matters (§7: partial fill vs.
// both-failed, rate-limited vs. hard reject, etc.).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error calling {venue}: {source}")]
    Transport {
        venue: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("authentication rejected by {venue}")]
    Auth { venue: &'static str },

    #[error("rate limited by {venue} (retry after {retry_after_ms}ms)")]
    RateLimited {
        venue: &'static str,
        retry_after_ms: u64,
    },

    #[error("{venue} returned not found for {what}")]
    NotFound { venue: &'static str, what: String },

    #[error("insufficient balance on {venue}: need {needed}, have {available}")]
    InsufficientBalance {
        venue: &'static str,
        needed: String,
        available: String,
    },

    #[error("order size below {venue} minimum: {size} < {minimum}")]
    MinimumSize {
        venue: &'static str,
        size: String,
        minimum: String,
    },

    #[error("{venue} rejected order: [{code}] {msg}")]
    VenueReject {
        venue: &'static str,
        code: String,
        msg: String,
    },

    #[error("capital too small for any venue: deployable {deployable} < floor {floor}")]
    InsufficientCapital { deployable: String, floor: String },

    #[error("size below minimum on one or both venues: long_min={long_min} short_min={short_min}")]
    BelowMinimum { long_min: String, short_min: String },

    #[error("partial fill on open: {leg_ok} leg succeeded, {leg_failed} leg failed")]
    PartialFillOnOpen {
        leg_ok: &'static str,
        leg_failed: &'static str,
    },

    #[error("partial close: {leg_ok} leg closed, {leg_stuck} leg did not")]
    PartialClose {
        leg_ok: &'static str,
        leg_stuck: &'static str,
    },

    #[error("reconciliation ambiguity: {reason}")]
    ReconciliationAmbiguous { reason: String },

    #[error("state file corrupted: {0}")]
    StateCorrupted(String),
}

impl EngineError {
    /// True when this error is the "symbol data unavailable this cycle only"
    /// class (§7) — the scanner should exclude the symbol and move on rather
    /// than escalate.
    pub fn is_data_unavailable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport { .. }
                | EngineError::NotFound { .. }
                | EngineError::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, EngineError::RateLimited { .. })
    }
}
