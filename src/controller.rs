// =============================================================================
// Rotation Controller — the main state-machine loop (C7)
// =============================================================================
//
// Owns the singleton BotState/Position lifecycle: IDLE -> ANALYZING ->
// OPENING -> HOLDING -> CLOSING -> WAITING -> IDLE, with ERROR a sink state
// reachable from any step that hits something an operator must look at
// (partial fill, stuck leg on close, unreconcilable venue state) and
// SHUTDOWN reached only by the process exiting. Every transition is
// persisted before the next step runs, so a crash mid-cycle resumes exactly
// where reconcile() puts it back on restart.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::config::RotationConfig;
use crate::error::EngineError;
use crate::executor::{build_open_strategy, OpenStrategy, VenuePair};
use crate::monitor::{self, ExitReason};
use crate::persistence::PersistedState;
use crate::portfolio;
use crate::reconcile::{self, Reconciliation};
use crate::scanner;
use crate::sizing::{self, SizingInputs, SizingOutput};
use crate::types::{BotState, CompletedCycle, Opportunity, Position, VenueId};

/// Longest single sleep chunk while idling, so a shutdown signal is never
/// more than this many seconds from being observed.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before the single close retry when both legs fail to close (§7).
const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Controller {
    venues: VenuePair,
    app_state: Arc<AppState>,
    cfg: RotationConfig,
    config_path: PathBuf,
    state_path: PathBuf,
    persisted: PersistedState,
    open_strategy: Box<dyn OpenStrategy>,
    pending_opportunity: Option<Opportunity>,
    pending_sizing: Option<SizingOutput>,
    pending_exit: Option<(ExitReason, String)>,
}

impl Controller {
    pub fn new(
        venues: VenuePair,
        app_state: Arc<AppState>,
        cfg: RotationConfig,
        config_path: PathBuf,
        state_path: PathBuf,
    ) -> Self {
        let mut persisted = PersistedState::load_or_fresh(&state_path);
        persisted.config_snapshot = serde_json::to_value(&cfg).ok();

        app_state.set_bot_state(persisted.state);
        app_state.set_position(persisted.current_position.clone());
        app_state.set_capital_status(persisted.capital_status);
        app_state.set_cumulative_stats(persisted.cumulative_stats.clone());

        let open_strategy = build_open_strategy(cfg.execution.open_strategy);

        Self {
            venues,
            app_state,
            cfg,
            config_path,
            state_path,
            persisted,
            open_strategy,
            pending_opportunity: None,
            pending_sizing: None,
            pending_exit: None,
        }
    }

    /// Re-read the rotation config from disk so in-flight edits are picked
    /// up before the next open attempt (§6). Falls back to the currently
    /// held config on any load error rather than aborting the cycle.
    fn reload_config(&mut self) {
        match RotationConfig::load(&self.config_path) {
            Ok(fresh) => {
                self.open_strategy = build_open_strategy(fresh.execution.open_strategy);
                self.cfg = fresh;
                self.persisted.config_snapshot = serde_json::to_value(&self.cfg).ok();
            }
            Err(e) => {
                warn!(error = %e, path = %self.config_path.display(), "failed to reload rotation config before open attempt, keeping previous config");
            }
        }
    }

    /// Run until `shutdown` reports `true`. Every step persists before
    /// returning, so the loop can be interrupted at any point without
    /// losing the last committed state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(state = %self.persisted.state, "reconciling against live venue state before resuming");
        self.reconcile_on_start().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = match self.persisted.state {
                BotState::Idle => self.step_idle(&mut shutdown).await,
                BotState::Analyzing => self.step_analyzing().await,
                BotState::Opening => self.step_opening().await,
                BotState::Holding => self.step_holding(&mut shutdown).await,
                BotState::Closing => self.step_closing().await,
                BotState::Waiting => self.step_waiting(&mut shutdown).await,
                BotState::Error => {
                    // Halted: only an operator clearing the state file moves
                    // this forward. Poll shutdown; otherwise do nothing.
                    interruptible_sleep(Duration::from_secs(30), &mut shutdown).await;
                    BotState::Error
                }
                BotState::Shutdown => break,
            };

            if next == BotState::Shutdown {
                break;
            }
            self.transition(next);
        }

        info!(state = %self.persisted.state, "controller loop exiting");
    }

    async fn reconcile_on_start(&mut self) {
        let universe = self.cfg.universe.symbols_to_monitor.clone();
        let outcome = reconcile::reconcile(
            self.persisted.state,
            self.persisted.current_position.as_ref(),
            &universe,
            &self.venues,
            &self.cfg,
        )
        .await;

        match outcome {
            Reconciliation::Idle => {
                self.persisted.current_position = None;
                self.transition(BotState::Idle);
            }
            Reconciliation::Holding(position) => {
                info!(symbol = %position.symbol, recovered = position.recovered, "resuming HOLDING from live venue state");
                self.persisted.current_position = Some(*position);
                self.app_state.set_position(self.persisted.current_position.clone());
                self.transition(BotState::Holding);
            }
            Reconciliation::ClearedExternally => {
                warn!("tracked position was closed externally while this process was down");
                self.persisted.current_position = None;
                self.app_state.set_position(None);
                self.transition(BotState::Idle);
            }
            Reconciliation::Error(reason) => {
                error!(reason = %reason, "could not reconcile live venue state automatically");
                self.app_state.set_last_error(Some(reason));
                self.transition(BotState::Error);
            }
        }
    }

    async fn step_idle(&mut self, shutdown: &mut watch::Receiver<bool>) -> BotState {
        let shutdown_fired = interruptible_sleep(
            Duration::from_secs(self.cfg.position_management.loop_interval_seconds),
            shutdown,
        )
        .await;
        if shutdown_fired {
            return BotState::Shutdown;
        }
        BotState::Analyzing
    }

    async fn step_analyzing(&mut self) -> BotState {
        self.reload_config();
        let universe = self.cfg.universe.symbols_to_monitor.clone();
        let scan = scanner::scan(
            &universe,
            self.venues.a.clone(),
            self.venues.b.clone(),
            &self.cfg.funding_rate_strategy,
        )
        .await;

        for (symbol, reason) in &scan.excluded {
            debug!(symbol, reason = %reason, "excluded from this cycle's scan");
        }

        let Some(best) = scan.ranked.into_iter().next() else {
            debug!("no eligible opportunity this cycle");
            return BotState::Idle;
        };

        match self.prepare_sizing(&best).await {
            Ok(sizing) => {
                info!(symbol = %best.symbol, net_apr = %best.net_apr, size = %sizing.size_base, "opportunity selected, proceeding to open");
                self.pending_opportunity = Some(best);
                self.pending_sizing = Some(sizing);
                BotState::Opening
            }
            Err(e) => {
                warn!(symbol = %best.symbol, error = %e, "sizing failed for this cycle's best opportunity");
                BotState::Idle
            }
        }
    }

    /// Refresh capital status from live balances and compute the
    /// precision-aligned size for `opp`'s long/short legs.
    async fn prepare_sizing(&mut self, opp: &Opportunity) -> Result<SizingOutput, EngineError> {
        let long_adapter = self.venues.get(opp.long_venue);
        let short_adapter = self.venues.get(opp.short_venue);

        let (long_bal, short_bal, long_meta, short_meta, long_bba, short_bba) = tokio::join!(
            long_adapter.account_balance(),
            short_adapter.account_balance(),
            long_adapter.symbol_metadata(&opp.symbol),
            short_adapter.symbol_metadata(&opp.symbol),
            long_adapter.best_bid_ask(&opp.symbol),
            short_adapter.best_bid_ask(&opp.symbol),
        );
        let long_bal = long_bal?;
        let short_bal = short_bal?;
        let long_meta = long_meta?;
        let short_meta = short_meta?;
        let long_bba = long_bba?;
        let short_bba = short_bba?;

        let (a_bal, b_bal) = match opp.long_venue {
            VenueId::A => (long_bal, short_bal),
            VenueId::B => (short_bal, long_bal),
        };
        let leverage = self.cfg.leverage_settings.leverage;
        self.persisted
            .capital_status
            .refresh(a_bal, b_bal, leverage, Utc::now());
        self.app_state.set_capital_status(self.persisted.capital_status);

        let desired_notional = long_bal.available.min(short_bal.available)
            * Decimal::from(leverage)
            * self.cfg.capital_management.capital_fraction;

        sizing::size_position(SizingInputs {
            desired_notional_usd: desired_notional,
            leverage,
            long_venue: opp.long_venue,
            short_venue: opp.short_venue,
            long_available: long_bal.available,
            short_available: short_bal.available,
            long_lot_step: long_meta.lot_step,
            short_lot_step: short_meta.lot_step,
            long_min_notional: long_meta.min_notional,
            short_min_notional: short_meta.min_notional,
            long_mid: long_bba.mid(),
            short_mid: short_bba.mid(),
            existing_long_holding: Decimal::ZERO,
        })
    }

    async fn step_opening(&mut self) -> BotState {
        let opp = self
            .pending_opportunity
            .take()
            .expect("OPENING entered without a prepared opportunity");
        let sizing = self
            .pending_sizing
            .take()
            .expect("OPENING entered without a prepared sizing");

        match self
            .open_strategy
            .open(&opp.symbol, &opp, &sizing, &self.venues)
            .await
        {
            Ok(legs) => {
                let now = Utc::now();
                let position = Position {
                    symbol: opp.symbol.clone(),
                    long_venue: opp.long_venue,
                    short_venue: opp.short_venue,
                    leverage: self.cfg.leverage_settings.leverage,
                    opened_at: now,
                    target_close_at: now
                        + chrono::Duration::hours(
                            self.cfg.position_management.hold_duration_hours as i64,
                        ),
                    size_base: legs.size_base,
                    long_entry_price: legs.long_entry_price,
                    short_entry_price: legs.short_entry_price,
                    configured_notional: sizing.notional_actual,
                    actual_notional: sizing.notional_actual,
                    was_capital_limited: sizing.was_capital_limited,
                    limiting_venue: Some(sizing.limiting_venue),
                    balances_before: legs.balances_before,
                    expected_funding_rate_per_period: opp.net_apr
                        / Decimal::from(365)
                        / opp.funding_freq_per_day
                        / Decimal::ONE_HUNDRED,
                    expected_net_apr: opp.net_apr,
                    cumulative_funding_received: Decimal::ZERO,
                    entry_fees_paid: Decimal::ZERO,
                    last_refreshed_pnl: Decimal::ZERO,
                    stop_loss_triggered: false,
                    stop_loss_reason: None,
                    recovered: false,
                    last_unrealized_pnl_snapshot: Decimal::ZERO,
                };
                info!(symbol = %position.symbol, size = %position.size_base, "position opened and verified");
                self.persisted.current_position = Some(position.clone());
                self.app_state.set_position(Some(position));
                BotState::Holding
            }
            Err(e @ EngineError::PartialFillOnOpen { .. }) => {
                error!(symbol = %opp.symbol, error = %e, "partial fill on open — halting for operator review, no auto-unwind");
                self.app_state.set_last_error(Some(e.to_string()));
                BotState::Error
            }
            Err(e) => {
                warn!(symbol = %opp.symbol, error = %e, "failed to open position, returning to idle");
                BotState::Idle
            }
        }
    }

    async fn step_holding(&mut self, shutdown: &mut watch::Receiver<bool>) -> BotState {
        let shutdown_fired = interruptible_sleep(
            Duration::from_secs(self.cfg.position_management.check_interval_seconds),
            shutdown,
        )
        .await;
        if shutdown_fired {
            return BotState::Shutdown;
        }

        let Some(position) = self.persisted.current_position.clone() else {
            error!("entered HOLDING with no tracked position, returning to idle");
            return BotState::Idle;
        };

        let universe = self.cfg.universe.symbols_to_monitor.clone();
        let (snapshot, exit) = monitor::tick(
            &position,
            &self.venues,
            &mut self.persisted.capital_status,
            self.cfg.position_management.fee_coverage_multiplier,
            self.cfg.position_management.max_position_age_hours,
            &universe,
            &self.cfg.funding_rate_strategy,
        )
        .await;
        self.app_state.set_capital_status(self.persisted.capital_status);

        if let Some(tracked) = self.persisted.current_position.as_mut() {
            tracked.cumulative_funding_received = snapshot.cumulative_funding_received;
            tracked.last_refreshed_pnl = snapshot.total_upnl;
        }
        self.app_state.set_position(self.persisted.current_position.clone());

        match exit {
            Some((reason, detail)) => {
                info!(symbol = %position.symbol, reason = %reason, detail, "exit rule fired");
                self.pending_exit = Some((reason, detail));
                BotState::Closing
            }
            None => BotState::Holding,
        }
    }

    async fn step_closing(&mut self) -> BotState {
        let Some(position) = self.persisted.current_position.clone() else {
            error!("entered CLOSING with no tracked position, returning to idle");
            return BotState::Idle;
        };
        let (reason, detail) = self.pending_exit.take().unwrap_or((
            ExitReason::Health,
            "closing without a recorded exit reason".to_string(),
        ));

        let long_adapter = self.venues.get(position.long_venue);
        let short_adapter = self.venues.get(position.short_venue);
        let exit_prices = match tokio::try_join!(
            long_adapter.best_bid_ask(&position.symbol),
            short_adapter.best_bid_ask(&position.symbol),
        ) {
            Ok((long_bba, short_bba)) => (long_bba.mid(), short_bba.mid()),
            Err(_) => (position.long_entry_price, position.short_entry_price),
        };

        let close_result = match self.open_strategy.close(&position, &self.venues).await {
            Err(EngineError::PartialClose {
                leg_stuck: "both", ..
            }) => {
                warn!(
                    symbol = %position.symbol,
                    "both legs failed to close, retrying once after a short delay"
                );
                tokio::time::sleep(CLOSE_RETRY_DELAY).await;
                self.open_strategy.close(&position, &self.venues).await
            }
            other => other,
        };

        match close_result {
            Ok(()) => {
                let exit_balances =
                    match tokio::try_join!(self.venues.a.account_balance(), self.venues.b.account_balance()) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(error = %e, "failed to read post-close balances, halting for operator review");
                            self.app_state.set_last_error(Some(format!(
                                "post-close balance read failed after verified close: {e}"
                            )));
                            self.persisted.current_position = Some(position);
                            return BotState::Error;
                        }
                    };

                let breakdown = portfolio::realized_pnl_breakdown(
                    self.cfg.execution.pnl_accounting_mode,
                    &position,
                    position.balances_before,
                    exit_balances,
                    position.cumulative_funding_received,
                    position.entry_fees_paid,
                );

                let now = Utc::now();
                let cycle = CompletedCycle {
                    symbol: position.symbol.clone(),
                    long_venue: position.long_venue,
                    short_venue: position.short_venue,
                    leverage: position.leverage,
                    opened_at: position.opened_at,
                    closed_at: now,
                    duration_hours: position.hold_duration(now).num_seconds() as f64 / 3600.0,
                    size_base: position.size_base,
                    long_entry_price: position.long_entry_price,
                    short_entry_price: position.short_entry_price,
                    exit_prices,
                    actual_notional: position.actual_notional,
                    exit_balances,
                    realized_pnl_breakdown: breakdown,
                    cumulative_funding_received: position.cumulative_funding_received,
                    entry_fees_paid: position.entry_fees_paid,
                    exit_reason: reason.to_string(),
                    stop_loss_reason: if reason == ExitReason::StopLoss {
                        Some(detail)
                    } else {
                        None
                    },
                };

                info!(symbol = %cycle.symbol, net_pnl = %breakdown.net_pnl, reason = %cycle.exit_reason, "cycle closed");
                self.persisted.push_completed_cycle(cycle);
                self.persisted.current_position = None;
                self.persisted.current_cycle += 1;
                self.app_state.set_position(None);
                self.app_state.set_cumulative_stats(self.persisted.cumulative_stats.clone());
                BotState::Waiting
            }
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "close failed — halting for operator intervention");
                self.app_state.set_last_error(Some(format!("close failed: {e}")));
                self.persisted.current_position = Some(position);
                BotState::Error
            }
        }
    }

    async fn step_waiting(&mut self, shutdown: &mut watch::Receiver<bool>) -> BotState {
        let shutdown_fired = interruptible_sleep(
            Duration::from_secs(self.cfg.position_management.wait_between_cycles_minutes * 60),
            shutdown,
        )
        .await;
        if shutdown_fired {
            return BotState::Shutdown;
        }
        BotState::Idle
    }

    fn transition(&mut self, new_state: BotState) {
        if new_state != self.persisted.state {
            info!(from = %self.persisted.state, to = %new_state, "state transition");
        }
        self.persisted.state = new_state;
        self.app_state.set_bot_state(new_state);
        if let Err(e) = self.persisted.save(&self.state_path) {
            error!(error = %e, "failed to persist controller state");
        }
    }
}

/// Sleep `total`, woken early if `shutdown` flips to `true`, in chunks no
/// longer than [`SHUTDOWN_POLL_INTERVAL`]. Returns `true` if shutdown fired.
async fn interruptible_sleep(total: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let mut remaining = total;
    loop {
        if *shutdown.borrow() {
            return true;
        }
        if remaining.is_zero() {
            return false;
        }
        let chunk = remaining.min(SHUTDOWN_POLL_INTERVAL);
        tokio::select! {
            _ = tokio::time::sleep(chunk) => {}
            _ = shutdown.changed() => {}
        }
        remaining = remaining.saturating_sub(chunk);
    }
}
