//! Decision Pipeline - 決策管線
//!
//! One cycle reads the hot state, collects active mandates (with the aging
//! bump), arbitrates one action per symbol, runs the risk gate and the entry
//! reservation, and hands admitted orders to the execution venue. Venue
//! reports come back through [`PipelineHandle::report_execution`] and drive
//! the position state machine.
//!
//! Arbitration, gating and dispatch run as separate tasks joined by bounded
//! channels; a full channel holds the upstream stage back. The main loop waits
//! for a cycle to clear the gate before it settles reports or starts the next
//! cycle, so positions are mutated by one stage at a time. A stage that
//! stops while the main loop is running is fatal and trips the halt.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;
use tokio::time::{Duration, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::command::PipelineCommand;
use super::config::PipelineConfig;
use super::halt::{Halt, HaltReason, HaltState};
use super::state::{
    CycleSummary, DecisionOutcome, DecisionRecord, PipelineStats, RiskSnapshot,
};
use crate::domain::{
    Action, ActionKind, ActionOrigin, HotStateSnapshot, Mandate, MandateId, MandateStatus,
    Position, PositionEvent, PositionState, StateTransition, Symbol,
};
use crate::error::{ArbiterError, Result, RiskRejection};
use crate::exchange::{Dispatch, ExecutionOutcome, ExecutionReport, ExecutionVenue, VenueOrder};
use crate::persistence::{reconcile, PositionStore, ReconcileReport};
use crate::platform::{
    arbitrate_all, HotStateReader, MandateRegistry, PositionBook, ReservationManager,
    ReservationToken, RiskConfig, RiskGate, RiskVerdict,
};
use crate::services::MonitorView;

/// Order currently working at the venue for one symbol
#[derive(Debug)]
struct InFlight {
    dispatch_id: Uuid,
    order: VenueOrder,
    /// Held for entries until the venue settles them
    token: Option<ReservationToken>,
    cancel_requested: bool,
    dispatched_at: DateTime<Utc>,
}

/// State shared by the pipeline stages, its handles and monitors
pub(crate) struct PipelineShared {
    pub(crate) book: PositionBook,
    pub(crate) registry: MandateRegistry,
    pub(crate) reservations: ReservationManager,
    pub(crate) halt: Halt,
    pub(crate) stats: PipelineStats,
    pub(crate) last_decisions: DashMap<Symbol, DecisionRecord>,
    pub(crate) risk_snapshot: RwLock<Option<RiskSnapshot>>,
    in_flight: DashMap<Symbol, InFlight>,
    audit_tx: broadcast::Sender<DecisionRecord>,
    store: Arc<dyn PositionStore>,
}

impl PipelineShared {
    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Write `symbol`'s current position to the store. Failures are counted
    /// and logged; the in-memory book stays authoritative.
    async fn persist(&self, symbol: &Symbol) {
        let Some(position) = self.book.get(symbol) else {
            return;
        };
        if let Err(e) = self.store.save(&position).await {
            self.stats.record_persist_failure();
            error!(%symbol, error = %e, "failed to persist position");
        }
    }

    fn record(&self, record: &DecisionRecord) {
        let symbol = &record.symbol;
        let action = record.action.kind.as_str();
        match &record.outcome {
            DecisionOutcome::Dispatched { dispatch_id } => {
                info!(%symbol, action, %dispatch_id, "action dispatched")
            }
            DecisionOutcome::ForcedExit { distance, .. } => {
                warn!(%symbol, %distance, "liquidation distance critical, forcing exit")
            }
            DecisionOutcome::Rejected { rejection } => {
                info!(%symbol, action, code = rejection.code(), reason = %rejection, "action rejected by risk gate")
            }
            DecisionOutcome::Halted => warn!(%symbol, "entry suppressed, pipeline halted"),
            DecisionOutcome::Failed { reason } => warn!(%symbol, action, %reason, "action failed"),
            DecisionOutcome::Conflict { holder } => {
                debug!(%symbol, ?holder, "entry slot held, skipping")
            }
            DecisionOutcome::Deferred { reason } => debug!(%symbol, action, %reason, "deferred"),
            DecisionOutcome::NoAction => debug!(%symbol, action, "no action"),
        }

        self.last_decisions.insert(symbol.clone(), record.clone());
        // No subscribers is fine
        let _ = self.audit_tx.send(record.clone());
    }

    async fn escalate(&self, err: &ArbiterError) {
        let reason = match err {
            ArbiterError::InvariantViolation { symbol, detail } => HaltReason::InvariantViolation {
                symbol: symbol.to_string(),
                detail: detail.clone(),
            },
            other => HaltReason::Fatal {
                detail: other.to_string(),
            },
        };
        self.halt.trip(reason).await;
    }
}

/// Work for one cycle, produced by the collector
struct CycleBatch {
    cycle: u64,
    version: u64,
    snapshot: Arc<HotStateSnapshot>,
    positions: BTreeMap<Symbol, Position>,
    mandates: Vec<Mandate>,
    expired: usize,
    done: oneshot::Sender<Result<CycleSummary>>,
}

struct ArbitratedBatch {
    batch: CycleBatch,
    actions: BTreeMap<Symbol, Action>,
}

/// The decision pipeline. Build with [`Pipeline::new`], optionally
/// [`recover`](Pipeline::recover), take a [`handle`](Pipeline::handle), then
/// spawn [`run`](Pipeline::run).
pub struct Pipeline {
    config: PipelineConfig,
    risk: RiskGate,
    hot_state: HotStateReader,
    venue: Arc<dyn ExecutionVenue>,
    shared: Arc<PipelineShared>,
    command_tx: mpsc::Sender<PipelineCommand>,
    command_rx: mpsc::Receiver<PipelineCommand>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        risk: Arc<RiskConfig>,
        hot_state: HotStateReader,
        venue: Arc<dyn ExecutionVenue>,
        store: Arc<dyn PositionStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (audit_tx, _) = broadcast::channel(config.audit_capacity.max(1));

        let shared = Arc::new(PipelineShared {
            book: PositionBook::new(),
            registry: MandateRegistry::new(),
            reservations: ReservationManager::new(),
            halt: Halt::new(),
            stats: PipelineStats::default(),
            last_decisions: DashMap::new(),
            risk_snapshot: RwLock::new(None),
            in_flight: DashMap::new(),
            audit_tx,
            store,
        });

        Self {
            config,
            risk: RiskGate::new(risk),
            hot_state,
            venue,
            shared,
            command_tx,
            command_rx,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            command_tx: self.command_tx.clone(),
            shared: Arc::clone(&self.shared),
            hot_state: self.hot_state.clone(),
        }
    }

    pub fn monitor(&self) -> MonitorView {
        MonitorView::new(Arc::clone(&self.shared), self.hot_state.clone())
    }

    pub fn book(&self) -> &PositionBook {
        &self.shared.book
    }

    /// Rebuild the position book from the store, corrected against the venue
    pub async fn recover(&self) -> Result<ReconcileReport> {
        reconcile(
            self.shared.store.as_ref(),
            self.venue.as_ref(),
            &self.shared.book,
        )
        .await
    }

    /// Main loop. Returns when shut down or when every handle is dropped.
    ///
    /// An invariant violation or a dead stage trips the halt and stops the
    /// loop with that error. A pipeline shut down while halted returns
    /// `Halted`.
    pub async fn run(self) -> Result<()> {
        let Pipeline {
            config,
            risk,
            hot_state,
            venue,
            shared,
            command_tx,
            mut command_rx,
        } = self;

        let capacity = config.channel_capacity.max(1);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let (gate_tx, gate_rx) = mpsc::channel(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);

        let gate = GateStage {
            config: config.clone(),
            risk,
            shared: Arc::clone(&shared),
            dispatch_tx,
        };
        let mut stages = JoinSet::new();
        stages.spawn(async move {
            arbitration_stage(batch_rx, gate_tx).await;
            "arbitration stage"
        });
        stages.spawn(async move {
            gate.run(gate_rx).await;
            "gate stage"
        });
        let weak_commands = command_tx.downgrade();
        let dispatch_shared = Arc::clone(&shared);
        stages.spawn(async move {
            dispatch_stage(dispatch_shared, venue, weak_commands, dispatch_rx).await;
            "dispatch stage"
        });
        // Only handles keep the command channel open from here on
        drop(command_tx);

        let mut tick = (config.cycle_interval_ms > 0).then(|| {
            let mut tick = tokio::time::interval(Duration::from_millis(config.cycle_interval_ms));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick
        });

        let mut driver = Driver {
            config,
            hot_state,
            shared: Arc::clone(&shared),
            batch_tx,
            cycle: 0,
        };

        info!(
            cycle_interval_ms = driver.config.cycle_interval_ms,
            holder_id = %driver.config.holder_id,
            "pipeline starting main loop"
        );

        let outcome: Result<()> = loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(PipelineCommand::TriggerCycle { reply }) => {
                        match driver.run_cycle().await {
                            Err(e) if e.is_fatal() => {
                                shared.escalate(&e).await;
                                let _ = reply.send(Err(ArbiterError::Halted(e.to_string())));
                                break Err(e);
                            }
                            result => {
                                let _ = reply.send(result);
                            }
                        }
                    }
                    Some(PipelineCommand::Report { report, reply }) => {
                        match driver.settle(report).await {
                            Err(e) if e.is_fatal() => {
                                shared.escalate(&e).await;
                                if let Some(reply) = reply {
                                    let _ = reply.send(Err(ArbiterError::Halted(e.to_string())));
                                }
                                break Err(e);
                            }
                            result => {
                                if let Err(e) = &result {
                                    warn!(error = %e, "execution report not applied");
                                }
                                if let Some(reply) = reply {
                                    let _ = reply.send(result);
                                }
                            }
                        }
                    }
                    Some(PipelineCommand::Shutdown) => {
                        info!("pipeline: shutdown requested");
                        break Ok(());
                    }
                    None => {
                        info!("pipeline: all handles dropped");
                        break Ok(());
                    }
                },

                // Stages only finish once the driver is dropped
                Some(joined) = stages.join_next() => {
                    let err = match joined {
                        Ok(stage) => ArbiterError::StageStopped(format!("{} exited", stage)),
                        Err(e) => ArbiterError::StageStopped(format!("stage task failed: {}", e)),
                    };
                    error!(error = %err, "pipeline stage died, halting");
                    shared.escalate(&err).await;
                    break Err(err);
                }

                _ = next_tick(&mut tick) => {
                    match driver.run_cycle().await {
                        Err(e) if e.is_fatal() => {
                            shared.escalate(&e).await;
                            break Err(e);
                        }
                        Err(e) => warn!(cycle = driver.cycle, error = %e, "cycle failed"),
                        Ok(_) => {}
                    }
                }
            }
        };

        drop(driver);
        while let Some(joined) = stages.join_next().await {
            match joined {
                Ok(stage) => debug!(stage, "stage joined"),
                Err(e) => error!(error = %e, "pipeline stage task failed"),
            }
        }
        info!("pipeline: main loop exited");

        outcome?;
        let halt = shared.halt.state().await;
        match halt.reason {
            Some(reason) => Err(ArbiterError::Halted(reason.to_string())),
            None => Ok(()),
        }
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Loop-side state: collects cycles and settles venue reports
struct Driver {
    config: PipelineConfig,
    hot_state: HotStateReader,
    shared: Arc<PipelineShared>,
    batch_tx: mpsc::Sender<CycleBatch>,
    cycle: u64,
}

impl Driver {
    async fn run_cycle(&mut self) -> Result<CycleSummary> {
        self.cycle += 1;
        let cycle = self.cycle;
        let now = Utc::now();

        for receipt in self
            .shared
            .reservations
            .stale_reservations(self.config.reservation_timeout_ms, now)
        {
            error!(
                symbol = %receipt.symbol,
                ticket = receipt.ticket,
                acquired_at = %receipt.acquired_at,
                "reservation outlived its order"
            );
            self.shared
                .halt
                .trip(HaltReason::StaleReservation {
                    symbol: receipt.symbol.to_string(),
                    ticket: receipt.ticket,
                })
                .await;
        }

        let (version, snapshot) = match self.hot_state.read_fresh(self.config.max_snapshot_age_ms) {
            Ok(read) => read,
            Err(ArbiterError::StaleSnapshot {
                version, age_ms, ..
            }) => {
                warn!(cycle, version, age_ms, "hot state is stale, skipping cycle");
                let summary = CycleSummary {
                    snapshot_version: Some(version),
                    stale: true,
                    ..CycleSummary::skipped(cycle)
                };
                self.shared.stats.record_cycle(&summary);
                return Ok(summary);
            }
            Err(e) => return Err(e),
        };

        let mut expired = 0;
        if self.config.mandate_ttl_ms > 0 {
            let cutoff = now - chrono::Duration::milliseconds(self.config.mandate_ttl_ms as i64);
            expired = self.shared.registry.expire_older_than(cutoff).len();
        }
        let purged = self.shared.registry.purge_inactive();

        let mandates: Vec<Mandate> = self
            .shared
            .registry
            .symbols_with_active()
            .iter()
            .flat_map(|symbol| self.shared.registry.active_by_symbol(symbol))
            .collect();
        let mandates = self.config.aging.apply(mandates, now);

        let positions = self.shared.book.snapshot_all();
        for (symbol, observed) in &snapshot.positions {
            let held = positions.get(symbol);
            if held.map(|p| (p.state(), p.quantity())) != Some((observed.state(), observed.quantity())) {
                debug!(
                    %symbol,
                    observed = %observed.state(),
                    held = ?held.map(|p| p.state()),
                    "observed position differs from book"
                );
            }
        }

        debug!(
            cycle,
            version,
            mandates = mandates.len(),
            expired,
            purged,
            "collected cycle input"
        );

        let (done_tx, done_rx) = oneshot::channel();
        self.batch_tx
            .send(CycleBatch {
                cycle,
                version,
                snapshot,
                positions,
                mandates,
                expired,
                done: done_tx,
            })
            .await
            .map_err(|_| ArbiterError::StageStopped("arbitration stage".to_string()))?;

        let summary = done_rx
            .await
            .map_err(|_| ArbiterError::StageStopped("gate stage".to_string()))??;
        self.shared.stats.record_cycle(&summary);
        Ok(summary)
    }

    /// Apply venue feedback to the position it belongs to
    async fn settle(&self, report: ExecutionReport) -> Result<Option<StateTransition>> {
        self.shared.stats.record_report();
        let symbol = report.symbol.clone();

        let working = self
            .shared
            .in_flight
            .get(&symbol)
            .map(|f| f.dispatch_id == report.dispatch_id)
            .unwrap_or(false);
        if !working {
            return Err(ArbiterError::Execution(format!(
                "no working order {} for {}",
                report.dispatch_id, symbol
            )));
        }

        let state = self.shared.book.state_of(&symbol);
        let event = match &report.outcome {
            ExecutionOutcome::Filled { quantity, price } => PositionEvent::Filled {
                quantity: *quantity,
                price: *price,
            },
            ExecutionOutcome::Rejected { reason } | ExecutionOutcome::Cancelled { reason }
                if state == PositionState::Entering =>
            {
                PositionEvent::Failed {
                    reason: reason.clone(),
                }
            }
            ExecutionOutcome::Rejected { reason } | ExecutionOutcome::Cancelled { reason } => {
                // Reduce/close stays pending and is sent again next cycle
                self.shared.in_flight.remove(&symbol);
                warn!(%symbol, %state, outcome = report.outcome.as_str(), %reason, "order not worked, will retry");
                return Ok(None);
            }
        };

        let transition = self.shared.book.apply(&symbol, &event)?;
        if !transition.to.has_pending_order() {
            if let Some((_, working)) = self.shared.in_flight.remove(&symbol) {
                if let Some(token) = working.token {
                    self.shared.reservations.release(token);
                }
                debug!(
                    %symbol,
                    order = working.order.as_str(),
                    elapsed_ms = (Utc::now() - working.dispatched_at).num_milliseconds(),
                    "order settled"
                );
            }
        }
        self.shared.persist(&symbol).await;

        info!(
            %symbol,
            from = %transition.from,
            to = %transition.to,
            event = %transition.event,
            "position transition"
        );
        Ok(Some(transition))
    }
}

async fn arbitration_stage(mut rx: mpsc::Receiver<CycleBatch>, tx: mpsc::Sender<ArbitratedBatch>) {
    while let Some(batch) = rx.recv().await {
        let actions = arbitrate_all(&batch.positions, &batch.mandates);
        if tx.send(ArbitratedBatch { batch, actions }).await.is_err() {
            break;
        }
    }
    debug!("arbitration stage stopped");
}

async fn dispatch_stage(
    shared: Arc<PipelineShared>,
    venue: Arc<dyn ExecutionVenue>,
    command_tx: mpsc::WeakSender<PipelineCommand>,
    mut rx: mpsc::Receiver<Dispatch>,
) {
    while let Some(dispatch) = rx.recv().await {
        let Err(e) = venue.execute(dispatch.clone()).await else {
            continue;
        };
        warn!(
            symbol = %dispatch.symbol,
            order = dispatch.order.as_str(),
            venue = venue.name(),
            error = %e,
            "venue refused dispatch"
        );

        if let VenueOrder::CancelEntry { target } = dispatch.order {
            if let Some(mut working) = shared.in_flight.get_mut(&dispatch.symbol) {
                if working.dispatch_id == target {
                    working.cancel_requested = false;
                }
            }
            continue;
        }

        // Settled through the main loop like any venue reject. Sent from its
        // own task so a full command channel cannot stall this stage.
        let report = ExecutionReport::rejected(&dispatch, e.to_string());
        if let Some(tx) = command_tx.upgrade() {
            tokio::spawn(async move {
                let _ = tx
                    .send(PipelineCommand::Report {
                        report,
                        reply: None,
                    })
                    .await;
            });
        }
    }
    debug!("dispatch stage stopped");
}

/// Risk gate, reservation and state-machine admission
struct GateStage {
    config: PipelineConfig,
    risk: RiskGate,
    shared: Arc<PipelineShared>,
    dispatch_tx: mpsc::Sender<Dispatch>,
}

impl GateStage {
    async fn run(self, mut rx: mpsc::Receiver<ArbitratedBatch>) {
        while let Some(ArbitratedBatch { batch, actions }) = rx.recv().await {
            let CycleBatch {
                cycle,
                version,
                snapshot,
                mut positions,
                expired,
                done,
                ..
            } = batch;

            let result = self
                .gate_cycle(cycle, version, &snapshot, &mut positions, actions)
                .await
                .map(|decisions| CycleSummary {
                    cycle,
                    snapshot_version: Some(version),
                    stale: false,
                    expired_mandates: expired,
                    decisions,
                });
            let _ = done.send(result);
        }
        debug!("gate stage stopped");
    }

    async fn gate_cycle(
        &self,
        cycle: u64,
        version: u64,
        snapshot: &HotStateSnapshot,
        positions: &mut BTreeMap<Symbol, Position>,
        actions: BTreeMap<Symbol, Action>,
    ) -> Result<Vec<DecisionRecord>> {
        let forced: BTreeMap<Symbol, Decimal> = self
            .risk
            .scan_liquidation(&snapshot.account, positions, &snapshot.prices)
            .into_iter()
            .collect();

        let symbols: BTreeSet<Symbol> = actions.keys().chain(forced.keys()).cloned().collect();
        let mut decisions = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let state = positions
                .get(&symbol)
                .map(|p| p.state())
                .unwrap_or(PositionState::Flat);
            let arbitrated = actions
                .get(&symbol)
                .cloned()
                .unwrap_or_else(|| Action::no_action(symbol.clone()));

            let verdict = match forced.get(&symbol) {
                Some(distance) if arbitrated.kind != ActionKind::Exit => RiskVerdict::ForceExit {
                    symbol: symbol.clone(),
                    distance: *distance,
                },
                _ => self.risk.validate(
                    &arbitrated,
                    &snapshot.account,
                    positions,
                    &snapshot.prices,
                ),
            };

            let (action, outcome) = match verdict {
                RiskVerdict::Accept => {
                    let outcome = self.admit(&arbitrated, positions).await?;
                    (arbitrated, outcome)
                }
                RiskVerdict::Reject(rejection) => {
                    let outcome = self.reject(&arbitrated, rejection);
                    (arbitrated, outcome)
                }
                RiskVerdict::ForceExit { distance, .. } => {
                    let action = Action::forced_exit(symbol.clone());
                    let outcome = self.force_exit(&action, distance, positions).await?;
                    (action, outcome)
                }
            };

            let record = DecisionRecord {
                cycle,
                snapshot_version: version,
                symbol,
                position_state: state,
                action,
                outcome,
                decided_at: Utc::now(),
            };
            self.shared.record(&record);
            decisions.push(record);
        }

        self.resend_pending(positions).await?;
        self.refresh_risk(cycle, snapshot, positions).await;
        Ok(decisions)
    }

    async fn admit(
        &self,
        action: &Action,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<DecisionOutcome> {
        match action.kind {
            ActionKind::Entry => self.admit_entry(action, positions).await,
            ActionKind::Reduce => self.admit_reduce(action, positions).await,
            ActionKind::Exit => self.admit_exit(action, positions).await,
            ActionKind::Hold | ActionKind::NoAction => Ok(DecisionOutcome::NoAction),
        }
    }

    async fn admit_entry(
        &self,
        action: &Action,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<DecisionOutcome> {
        if self.shared.halt.is_halted() {
            return Ok(DecisionOutcome::Halted);
        }
        let symbol = &action.symbol;
        let Some(direction) = action.direction else {
            return Ok(DecisionOutcome::Failed {
                reason: "entry without direction".to_string(),
            });
        };

        let token = match self
            .shared
            .reservations
            .try_reserve(symbol, &self.config.holder_id)
        {
            Ok(token) => token,
            Err(conflict) => {
                return Ok(DecisionOutcome::Conflict {
                    holder: conflict.holder.map(|h| h.holder_id),
                })
            }
        };

        let admitted = match self.consume(action) {
            Ok(()) => {
                let event = PositionEvent::EntryAdmitted {
                    direction,
                    quantity: action.quantity,
                };
                self.transition(symbol, &event, positions).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = admitted {
            self.shared.reservations.release(token);
            return failed(e);
        }

        let order = VenueOrder::Enter {
            direction,
            quantity: action.quantity,
        };
        let dispatch_id = self.dispatch(action.clone(), order, Some(token)).await?;
        Ok(DecisionOutcome::Dispatched { dispatch_id })
    }

    async fn admit_reduce(
        &self,
        action: &Action,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<DecisionOutcome> {
        let symbol = &action.symbol;
        let held = match positions.get(symbol) {
            Some(p) if p.state() == PositionState::Open => p.quantity(),
            _ => {
                return Ok(DecisionOutcome::Deferred {
                    reason: "position not open".to_string(),
                })
            }
        };
        let quantity = action.quantity.min(held);

        if let Err(e) = self.consume(action) {
            return failed(e);
        }
        if let Err(e) = self
            .transition(symbol, &PositionEvent::ReduceAdmitted { quantity }, positions)
            .await
        {
            return failed(e);
        }

        let dispatch_id = self
            .dispatch(action.clone(), VenueOrder::Reduce { quantity }, None)
            .await?;
        Ok(DecisionOutcome::Dispatched { dispatch_id })
    }

    async fn admit_exit(
        &self,
        action: &Action,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<DecisionOutcome> {
        let state = positions
            .get(&action.symbol)
            .map(|p| p.state())
            .unwrap_or(PositionState::Flat);

        match state {
            // The mandate stays active: it closes the position if the entry fills first
            PositionState::Entering => match self.request_cancel(action).await? {
                Some(dispatch_id) => Ok(DecisionOutcome::Dispatched { dispatch_id }),
                None => Ok(DecisionOutcome::Deferred {
                    reason: "entry cancel already requested".to_string(),
                }),
            },
            PositionState::Open => {
                if let Err(e) = self.consume(action) {
                    return failed(e);
                }
                match self.close(action, positions).await {
                    Ok(dispatch_id) => Ok(DecisionOutcome::Dispatched { dispatch_id }),
                    Err(e) => failed(e),
                }
            }
            other => Ok(DecisionOutcome::Deferred {
                reason: format!("exit not applicable in {}", other),
            }),
        }
    }

    async fn force_exit(
        &self,
        action: &Action,
        distance: Decimal,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<DecisionOutcome> {
        let state = positions
            .get(&action.symbol)
            .map(|p| p.state())
            .unwrap_or(PositionState::Flat);

        let dispatch_id = match state {
            PositionState::Open => match self.close(action, positions).await {
                Ok(id) => Some(id),
                Err(e) => return failed(e),
            },
            PositionState::Entering => match self.request_cancel(action).await? {
                Some(id) => Some(id),
                None => {
                    return Ok(DecisionOutcome::Deferred {
                        reason: "entry cancel already requested".to_string(),
                    })
                }
            },
            PositionState::Reducing | PositionState::Closing => {
                return Ok(DecisionOutcome::Deferred {
                    reason: format!("{} order already working", state),
                })
            }
            PositionState::Flat => None,
        };
        Ok(DecisionOutcome::ForcedExit {
            distance,
            dispatch_id,
        })
    }

    /// OPEN → CLOSING and send the close for the whole position
    async fn close(
        &self,
        action: &Action,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<Uuid> {
        let symbol = &action.symbol;
        self.transition(symbol, &PositionEvent::ExitAdmitted, positions)
            .await?;
        let quantity = positions
            .get(symbol)
            .map(|p| p.quantity())
            .unwrap_or(Decimal::ZERO);
        self.dispatch(action.clone(), VenueOrder::Close { quantity }, None)
            .await
    }

    /// Ask the venue to cancel the working entry. None when a cancel is
    /// already pending or there is no entry to cancel.
    async fn request_cancel(&self, action: &Action) -> Result<Option<Uuid>> {
        let target = match self.shared.in_flight.get_mut(&action.symbol) {
            Some(mut working)
                if !working.cancel_requested
                    && matches!(working.order, VenueOrder::Enter { .. }) =>
            {
                working.cancel_requested = true;
                working.dispatch_id
            }
            _ => return Ok(None),
        };

        let dispatch = Dispatch::new(action.clone(), VenueOrder::CancelEntry { target }, None);
        let dispatch_id = dispatch.dispatch_id;
        self.dispatch_tx
            .send(dispatch)
            .await
            .map_err(|_| ArbiterError::StageStopped("dispatch stage".to_string()))?;
        Ok(Some(dispatch_id))
    }

    fn reject(&self, action: &Action, rejection: RiskRejection) -> DecisionOutcome {
        if let Some(id) = action.originating_mandate_id {
            if let Err(e) = self.shared.registry.update_state(id, MandateStatus::Rejected) {
                debug!(mandate_id = %id, error = %e, "could not mark mandate rejected");
            }
        }
        DecisionOutcome::Rejected { rejection }
    }

    fn consume(&self, action: &Action) -> Result<()> {
        match action.originating_mandate_id {
            Some(id) => consume_mandate(&self.shared.registry, id),
            None => Ok(()),
        }
    }

    /// Apply `event` to the book, mirror the result into `positions` and persist
    async fn transition(
        &self,
        symbol: &Symbol,
        event: &PositionEvent,
        positions: &mut BTreeMap<Symbol, Position>,
    ) -> Result<StateTransition> {
        let transition = self.shared.book.apply(symbol, event)?;
        if let Some(position) = self.shared.book.get(symbol) {
            positions.insert(symbol.clone(), position);
        }
        self.shared.persist(symbol).await;
        debug!(%symbol, from = %transition.from, to = %transition.to, event = %transition.event, "admitted");
        Ok(transition)
    }

    /// Register the working order, then hand it to the dispatch stage
    async fn dispatch(
        &self,
        action: Action,
        order: VenueOrder,
        token: Option<ReservationToken>,
    ) -> Result<Uuid> {
        let symbol = action.symbol.clone();
        let receipt = token.as_ref().map(|t| t.receipt());
        let dispatch = Dispatch::new(action, order.clone(), receipt);
        let dispatch_id = dispatch.dispatch_id;

        self.shared.in_flight.insert(
            symbol.clone(),
            InFlight {
                dispatch_id,
                order,
                token,
                cancel_requested: false,
                dispatched_at: dispatch.created_at,
            },
        );

        if self.dispatch_tx.send(dispatch).await.is_err() {
            if let Some((_, working)) = self.shared.in_flight.remove(&symbol) {
                if let Some(token) = working.token {
                    self.shared.reservations.release(token);
                }
            }
            return Err(ArbiterError::StageStopped("dispatch stage".to_string()));
        }
        Ok(dispatch_id)
    }

    /// Send again reduce/close orders whose previous attempt was not worked
    async fn resend_pending(&self, positions: &BTreeMap<Symbol, Position>) -> Result<()> {
        for position in positions.values() {
            let symbol = position.symbol();
            if self.shared.in_flight.contains_key(symbol) {
                continue;
            }
            let (kind, order) = match position.state() {
                PositionState::Reducing => (
                    ActionKind::Reduce,
                    VenueOrder::Reduce {
                        quantity: position.pending_quantity(),
                    },
                ),
                PositionState::Closing => (
                    ActionKind::Exit,
                    VenueOrder::Close {
                        quantity: position.quantity(),
                    },
                ),
                _ => continue,
            };

            info!(%symbol, order = order.as_str(), "re-sending pending order");
            let action = Action {
                kind,
                symbol: symbol.clone(),
                originating_mandate_id: None,
                direction: position.direction(),
                quantity: position.pending_quantity(),
                origin: ActionOrigin::Arbitrated,
            };
            self.dispatch(action, order, None).await?;
        }
        Ok(())
    }

    async fn refresh_risk(
        &self,
        cycle: u64,
        snapshot: &HotStateSnapshot,
        positions: &BTreeMap<Symbol, Position>,
    ) {
        let metrics = self
            .risk
            .metrics(&snapshot.account, positions, &snapshot.prices);
        for symbol in &metrics.below_min_safe {
            warn!(
                %symbol,
                distance = ?metrics.liquidation_distance.get(symbol),
                min_safe = %self.risk.config().d_min_safe,
                "liquidation distance below safe level"
            );
        }

        let deleverage = self
            .risk
            .suggest_deleverage(&snapshot.account, positions, &snapshot.prices);
        if !deleverage.is_empty() {
            warn!(
                leverage = ?metrics.leverage,
                target = %self.risk.config().l_target,
                suggestions = deleverage.len(),
                "leverage above target, deleverage suggested"
            );
        }

        *self.shared.risk_snapshot.write().await = Some(RiskSnapshot {
            cycle,
            metrics,
            deleverage,
        });
    }
}

fn consume_mandate(registry: &MandateRegistry, id: MandateId) -> Result<()> {
    registry.update_state(id, MandateStatus::Consumed).map(|_| ())
}

/// Non-fatal errors become a `Failed` outcome; fatal ones stop the cycle
fn failed(err: ArbiterError) -> Result<DecisionOutcome> {
    if err.is_fatal() {
        return Err(err);
    }
    Ok(DecisionOutcome::Failed {
        reason: err.to_string(),
    })
}

/// Cloneable control surface for a running [`Pipeline`]
#[derive(Clone)]
pub struct PipelineHandle {
    command_tx: mpsc::Sender<PipelineCommand>,
    shared: Arc<PipelineShared>,
    hot_state: HotStateReader,
}

impl PipelineHandle {
    /// Validate and register a strategy mandate
    pub fn submit_mandate(&self, mandate: Mandate) -> Result<MandateId> {
        let id = mandate.id;
        let symbol = mandate.symbol.clone();
        let kind = mandate.kind;
        self.shared.registry.register(mandate)?;
        debug!(%symbol, %kind, mandate_id = %id, "mandate registered");
        Ok(id)
    }

    /// Cancel every active mandate from `source_id`
    pub fn cancel_source(&self, source_id: &str) -> Vec<MandateId> {
        let cancelled = self.shared.registry.remove_source(source_id);
        if !cancelled.is_empty() {
            info!(source_id, count = cancelled.len(), "mandates cancelled by source");
        }
        cancelled
    }

    pub fn mandate(&self, id: &MandateId) -> Option<Mandate> {
        self.shared.registry.get(id)
    }

    /// Feed a venue report back and wait until it is applied
    pub async fn report_execution(
        &self,
        report: ExecutionReport,
    ) -> Result<Option<StateTransition>> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(PipelineCommand::Report {
                report,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ArbiterError::ChannelClosed("pipeline command"))?;
        rx.await
            .map_err(|_| ArbiterError::ChannelClosed("pipeline reply"))?
    }

    /// Run one cycle now and wait for its summary
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(PipelineCommand::TriggerCycle { reply })
            .await
            .map_err(|_| ArbiterError::ChannelClosed("pipeline command"))?;
        rx.await
            .map_err(|_| ArbiterError::ChannelClosed("pipeline reply"))?
    }

    /// Decision audit stream
    pub fn subscribe(&self) -> broadcast::Receiver<DecisionRecord> {
        self.shared.audit_tx.subscribe()
    }

    pub fn monitor(&self) -> MonitorView {
        MonitorView::new(Arc::clone(&self.shared), self.hot_state.clone())
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halt.is_halted()
    }

    pub async fn halt(&self, reason: impl Into<String>) {
        self.shared
            .halt
            .trip(HaltReason::Manual {
                reason: reason.into(),
            })
            .await;
    }

    pub async fn halt_state(&self) -> HaltState {
        self.shared.halt.state().await
    }

    /// Operator reset after the halt cause has been dealt with
    pub async fn clear_halt(&self) {
        self.shared.halt.clear().await;
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(PipelineCommand::Shutdown)
            .await
            .map_err(|_| ArbiterError::ChannelClosed("pipeline command"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AccountState, Direction, HotStateSnapshot, MandateKind, MarketQuote};
    use crate::exchange::PaperVenue;
    use crate::persistence::MemoryStore;
    use crate::platform::{HotStateStore, HotStateWriter};
    use rust_decimal_macros::dec;

    struct Fixture {
        handle: PipelineHandle,
        venue: Arc<PaperVenue>,
        dispatches: mpsc::Receiver<Dispatch>,
        _writer: HotStateWriter,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn snapshot(equity: Decimal, prices: &[(&str, Decimal)]) -> HotStateSnapshot {
        prices.iter().fold(
            HotStateSnapshot::new(AccountState::new(equity)),
            |snap, (symbol, mark)| snap.with_quote(*symbol, MarketQuote::new(*mark)),
        )
    }

    fn start(genesis: HotStateSnapshot) -> Fixture {
        let (writer, reader) = HotStateStore::new(genesis);
        let (venue, dispatches) = PaperVenue::new(16);
        let venue = Arc::new(venue);
        let pipeline = Pipeline::new(
            PipelineConfig::manual(),
            Arc::new(RiskConfig::default()),
            reader,
            venue.clone(),
            Arc::new(MemoryStore::new()),
        );
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());
        Fixture {
            handle,
            venue,
            dispatches,
            _writer: writer,
            task,
        }
    }

    #[tokio::test]
    async fn test_entry_dispatch_and_fill() {
        let mut fx = start(snapshot(dec!(10000), &[("BTC", dec!(100))]));
        let id = fx
            .handle
            .submit_mandate(Mandate::entry("BTC", "trend", Direction::Long, dec!(2)))
            .unwrap();

        let summary = fx.handle.run_cycle().await.unwrap();
        assert_eq!(summary.dispatched(), 1);
        assert_eq!(
            fx.handle.mandate(&id).unwrap().status,
            MandateStatus::Consumed
        );

        let dispatch = fx.dispatches.recv().await.unwrap();
        let report = fx.venue.fill(&dispatch, dec!(100));
        let transition = fx.handle.report_execution(report).await.unwrap().unwrap();
        assert_eq!(transition.to, PositionState::Open);
        assert_eq!(fx.handle.monitor().reservations_held(), 0);

        fx.handle.shutdown().await.unwrap();
        assert!(fx.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_report_is_refused() {
        let fx = start(snapshot(dec!(10000), &[("BTC", dec!(100))]));
        let report = ExecutionReport::new(
            Uuid::new_v4(),
            Symbol::from("BTC"),
            ExecutionOutcome::Filled {
                quantity: dec!(1),
                price: dec!(100),
            },
        );
        assert!(matches!(
            fx.handle.report_execution(report).await,
            Err(ArbiterError::Execution(_))
        ));
        fx.handle.shutdown().await.unwrap();
        assert!(fx.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_halt_suppresses_entries_and_fails_run() {
        let fx = start(snapshot(dec!(10000), &[("BTC", dec!(100))]));
        fx.handle.halt("maintenance").await;
        fx.handle
            .submit_mandate(Mandate::entry("BTC", "trend", Direction::Long, dec!(1)))
            .unwrap();
        fx.handle
            .submit_mandate(Mandate::new("ETH", MandateKind::Hold, "mm"))
            .unwrap();

        let summary = fx.handle.run_cycle().await.unwrap();
        assert_eq!(
            summary.decision(&Symbol::from("BTC")).unwrap().outcome,
            DecisionOutcome::Halted
        );
        assert_eq!(fx.venue.executed_count(), 0);

        fx.handle.shutdown().await.unwrap();
        assert!(matches!(
            fx.task.await.unwrap(),
            Err(ArbiterError::Halted(_))
        ));
    }

    #[tokio::test]
    async fn test_invariant_violation_halts_and_stops_run() {
        let (_writer, reader) = HotStateStore::new(snapshot(dec!(10000), &[("BTC", dec!(100))]));
        let (venue, _dispatches) = PaperVenue::new(16);
        let pipeline = Pipeline::new(
            PipelineConfig::manual(),
            Arc::new(RiskConfig::default()),
            reader,
            Arc::new(venue),
            Arc::new(MemoryStore::new()),
        );

        // OPEN position that lost its direction; closing it breaks CLOSING's shape
        let open = Position::open(Symbol::from("BTC"), Direction::Long, dec!(5), dec!(100)).unwrap();
        let mut raw = serde_json::to_value(&open).unwrap();
        raw["direction"] = serde_json::Value::Null;
        let corrupt: Position = serde_json::from_value(raw).unwrap();
        pipeline.book().insert_unchecked(corrupt);

        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());
        handle
            .submit_mandate(Mandate::new("BTC", MandateKind::Exit, "risk"))
            .unwrap();

        assert!(matches!(
            handle.run_cycle().await,
            Err(ArbiterError::Halted(_))
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(ArbiterError::InvariantViolation { .. })
        ));
        assert!(handle.is_halted());
        assert!(matches!(
            handle.halt_state().await.reason,
            Some(HaltReason::InvariantViolation { .. })
        ));
    }

    struct PanickingVenue;

    #[async_trait::async_trait]
    impl ExecutionVenue for PanickingVenue {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _dispatch: Dispatch) -> Result<()> {
            panic!("venue adapter bug");
        }

        async fn open_positions(&self) -> Result<Vec<crate::exchange::VenuePosition>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_dead_stage_halts_pipeline() {
        let (_writer, reader) = HotStateStore::new(snapshot(dec!(10000), &[("BTC", dec!(100))]));
        let pipeline = Pipeline::new(
            PipelineConfig::manual(),
            Arc::new(RiskConfig::default()),
            reader,
            Arc::new(PanickingVenue),
            Arc::new(MemoryStore::new()),
        );
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());

        handle
            .submit_mandate(Mandate::entry("BTC", "trend", Direction::Long, dec!(1)))
            .unwrap();
        let summary = handle.run_cycle().await.unwrap();
        assert_eq!(summary.dispatched(), 1);

        // The dispatch stage dies on the order; run stops without a shutdown
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("pipeline kept running after a stage died")
            .unwrap();
        assert!(matches!(outcome, Err(ArbiterError::StageStopped(_))));
        assert!(handle.is_halted());
        assert!(matches!(
            handle.halt_state().await.reason,
            Some(HaltReason::Fatal { .. })
        ));
        assert!(handle.run_cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_stale_snapshot_skips_cycle() {
        let mut genesis = snapshot(dec!(10000), &[("BTC", dec!(100))]);
        genesis.published_at = Utc::now() - chrono::Duration::seconds(60);
        let fx = start(genesis);
        fx.handle
            .submit_mandate(Mandate::entry("BTC", "trend", Direction::Long, dec!(1)))
            .unwrap();

        let summary = fx.handle.run_cycle().await.unwrap();
        assert!(summary.stale);
        assert!(summary.decisions.is_empty());
        assert_eq!(fx.handle.monitor().stats().stale_cycles, 1);
        fx.handle.shutdown().await.unwrap();
        let _ = fx.task.await;
    }
}
