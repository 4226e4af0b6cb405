//! Engine: the primary pipeline and the follower runners.
//!
//! Handles:
//! - Restoring interpreter, log, risk ledger and live intents after a restart
//! - Reconciling the replication log with the venue
//! - Message intake, completion sweeps, validation and admission
//! - Price updates driving targets, stops and breakeven
//! - Follower delivery, acknowledgement and resync

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{
    AccountProvider, BlackoutProvider, ExecutionVenue, Notification, NotificationSink, RetryPolicy,
};
use crate::config::Settings;
use crate::db::{Repository, PRIMARY};
use crate::error::ReplicationError;
use crate::models::{
    AccountState, CandidateSignal, DailyRiskState, EventId, MessageKey, RawMessage, Tick,
    TradeIntent,
};
use crate::replication::{Follower, FollowerConfig, Reconciler, ReplicationBus};
use crate::signal::{Interpreter, Validator};
use crate::trading::{
    Decision, Executor, ExecutionConfig, IntentBook, LedgerHandle, PositionTracker, RiskGate,
    RiskLedger,
};

/// One line of input to the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Message(RawMessage),
    Tick {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        #[serde(default = "Utc::now")]
        time: DateTime<Utc>,
    },
}

/// External collaborators of the primary.
pub struct EngineDeps {
    pub venue: Arc<dyn ExecutionVenue>,
    pub account: Arc<dyn AccountProvider>,
    pub blackout: Arc<dyn BlackoutProvider>,
    pub repo: Arc<dyn Repository>,
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    completed: AtomicU64,
    stale: AtomicU64,
    discarded: AtomicU64,
    rejected: AtomicU64,
    denied: AtomicU64,
    opened: AtomicU64,
    ticks: AtomicU64,
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub messages: u64,
    pub completed: u64,
    pub stale: u64,
    pub discarded: u64,
    pub rejected: u64,
    pub denied: u64,
    pub intents_opened: u64,
    pub ticks: u64,
    pub live_intents: usize,
    pub retired_intents: usize,
    pub log_head: EventId,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Messages: {}", self.messages)?;
        writeln!(
            f,
            "Candidates: {} completed, {} stale, {} below floor",
            self.completed, self.stale, self.discarded
        )?;
        writeln!(f, "Rejected by validation: {}", self.rejected)?;
        writeln!(f, "Denied by risk gate: {}", self.denied)?;
        writeln!(f, "Intents opened: {}", self.intents_opened)?;
        writeln!(f, "Live intents: {} ({} retired)", self.live_intents, self.retired_intents)?;
        writeln!(f, "Ticks: {}", self.ticks)?;
        write!(f, "Replication head: {}", self.log_head)
    }
}

pub struct Engine {
    interpreter: Interpreter,
    validator: Validator,
    gate: RiskGate,
    ledger: LedgerHandle,
    book: Arc<IntentBook>,
    tracker: PositionTracker,
    executor: Executor,
    bus: Arc<ReplicationBus>,
    venue: Arc<dyn ExecutionVenue>,
    account: Arc<dyn AccountProvider>,
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn NotificationSink>,
    execution: ExecutionConfig,
    fallback_equity: Decimal,
    /// Serializes snapshot, admission and intent registration
    admission: Mutex<()>,
    lag_reported: parking_lot::Mutex<HashMap<String, EventId>>,
    counters: Counters,
}

impl Engine {
    /// Rebuild state from the repository and reconcile it with the venue.
    pub async fn restore(settings: &Settings, deps: EngineDeps, now: DateTime<Utc>) -> Result<Self> {
        let EngineDeps {
            venue,
            account,
            blackout,
            repo,
            notifier,
        } = deps;

        let bus = Arc::new(ReplicationBus::restore(settings.replication.clone(), repo.clone()).await?);

        let daily = repo
            .load_daily_risk(now.date_naive())
            .await
            .context("Failed to load daily risk state")?
            .unwrap_or_else(|| DailyRiskState::for_time(now));
        let (ledger, _task) = RiskLedger::spawn(daily, settings.risk.clone(), repo.clone());

        let interpreter = Interpreter::new(settings.interpreter.clone());
        let restored = interpreter.restore(
            repo.load_collecting_candidates()
                .await
                .context("Failed to load collecting candidates")?,
        );

        let book = Arc::new(IntentBook::new());
        for intent in repo.load_intents(PRIMARY).await.context("Failed to load intents")? {
            book.insert(intent);
        }

        let retry = RetryPolicy::from_config(&settings.execution);
        let executor = Executor::new(
            venue.clone(),
            retry,
            bus.clone(),
            book.clone(),
            repo.clone(),
            notifier.clone(),
            ledger.clone(),
        );

        let reconciler = Reconciler::new(bus.clone(), venue.clone(), repo.clone());
        let report = reconciler.reconcile(&book, now).await?;
        executor.apply_actions(report.external_closes, now).await;

        for follower in &settings.followers {
            bus.register(&follower.id);
        }

        info!(
            candidates = restored,
            live_intents = book.active_count(),
            head = bus.head(),
            venue = venue.name(),
            "Engine restored"
        );

        Ok(Self {
            validator: Validator::new(settings.validator.clone(), venue.clone()),
            gate: RiskGate::new(settings.risk.clone(), blackout),
            tracker: PositionTracker::new(book.clone()),
            interpreter,
            ledger,
            book,
            executor,
            bus,
            venue,
            account,
            repo,
            notifier,
            execution: settings.execution.clone(),
            fallback_equity: settings.risk.fallback_equity,
            admission: Mutex::new(()),
            lag_reported: parking_lot::Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub fn bus(&self) -> &Arc<ReplicationBus> {
        &self.bus
    }

    #[cfg(test)]
    pub fn book(&self) -> &Arc<IntentBook> {
        &self.book
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    /// Record and interpret one inbound message or edit.
    pub async fn on_message(&self, message: RawMessage, now: DateTime<Utc>) -> Result<Option<CandidateSignal>> {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        self.repo.record_message(&message).await?;

        let candidate = self.interpreter.interpret(&message, now);
        if let Some(candidate) = &candidate {
            self.repo.record_candidate(candidate).await?;
        }
        Ok(candidate)
    }

    /// Complete quiet candidates and run them through validation, admission
    /// and execution one after another. Returns the intents that were submitted.
    #[cfg(test)]
    pub async fn process_ready(&self, now: DateTime<Utc>) -> Vec<TradeIntent> {
        let mut submitted = Vec::new();
        for candidate in self.take_ready(now).await {
            if let Some(intent) = self.admit(candidate, now).await {
                submitted.push(intent);
            }
        }
        submitted
    }

    /// Sweep the interpreter and store every candidate that changed state.
    /// Returns the completed ones.
    async fn take_ready(&self, now: DateTime<Utc>) -> Vec<CandidateSignal> {
        let outcome = self.interpreter.sweep(now);
        if outcome.is_empty() {
            return Vec::new();
        }

        self.counters.stale.fetch_add(outcome.stale.len() as u64, Ordering::Relaxed);
        self.counters.discarded.fetch_add(outcome.discarded.len() as u64, Ordering::Relaxed);
        self.counters
            .completed
            .fetch_add(outcome.completed.len() as u64, Ordering::Relaxed);
        for candidate in outcome.stale.iter().chain(&outcome.discarded).chain(&outcome.completed) {
            if let Err(e) = self.repo.record_candidate(candidate).await {
                error!(source = %candidate.source, error = %e, "Failed to store candidate");
            }
        }
        outcome.completed
    }

    /// Validate, admit and execute one completed candidate. A failure is
    /// reported for this candidate alone.
    pub async fn admit(&self, candidate: CandidateSignal, now: DateTime<Utc>) -> Option<TradeIntent> {
        let source = candidate.source;
        match self.admit_and_execute(candidate, now).await {
            Ok(intent) => intent,
            Err(e) => {
                error!(source = %source, error = %e, "Failed to process signal");
                self.notifier
                    .notify(&Notification::SignalRejected {
                        source,
                        reason: format!("processing failed: {e:#}"),
                    })
                    .await;
                None
            }
        }
    }

    async fn admit_and_execute(&self, candidate: CandidateSignal, now: DateTime<Utc>) -> Result<Option<TradeIntent>> {
        let source = candidate.source;
        let validated = self.validator.validate(candidate, now).await;
        self.repo.record_verdict(&validated).await?;
        if let Some(reason) = validated.rejection() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(source = %source, reason = %reason, "Signal rejected");
            self.reject(source, reason.to_string()).await;
            return Ok(None);
        }

        let equity = self.equity().await;
        let shared = {
            let _admission = self.admission.lock().await;
            let daily = self.ledger.snapshot(now).await?;
            let account = AccountState {
                equity,
                open_trades: self.book.active_count(),
            };
            match self.gate.admit(&validated, &account, &daily, now) {
                Decision::Approve {
                    volume,
                    risk_fraction,
                } => {
                    if let Err(reason) = self.validator.claim(&validated, now) {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(source = %source, reason = %reason, "Signal rejected");
                        self.reject(source, reason.to_string()).await;
                        return Ok(None);
                    }
                    let shared = match self.executor.prepare(&validated, volume, risk_fraction, now).await {
                        Ok(shared) => shared,
                        Err(e) => {
                            self.validator.release(&validated);
                            return Err(e);
                        }
                    };
                    self.ledger.record_trade_opened(now).await?;
                    shared
                }
                Decision::Reject(reason) => {
                    self.counters.denied.fetch_add(1, Ordering::Relaxed);
                    self.reject(source, reason.to_string()).await;
                    return Ok(None);
                }
            }
        };

        let intent = self.executor.submit(shared, now).await;
        if intent.legs.iter().any(|l| l.ticket.is_some()) {
            self.counters.opened.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(intent))
    }

    async fn reject(&self, source: MessageKey, reason: String) {
        self.notifier
            .notify(&Notification::SignalRejected { source, reason })
            .await;
    }

    async fn equity(&self) -> Decimal {
        match self.account.equity().await {
            Ok(equity) => equity,
            Err(e) => {
                warn!(error = %e, fallback = %self.fallback_equity, "Equity unavailable, using fallback");
                self.fallback_equity
            }
        }
    }

    /// Feed a price update to the tracker and carry out its decisions.
    pub async fn on_tick(&self, symbol: &str, tick: Tick, now: DateTime<Utc>) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let actions = self.tracker.on_tick(symbol, &tick, now).await;
        if !actions.is_empty() {
            debug!(symbol, actions = actions.len(), "Lifecycle actions");
            self.executor.apply_actions(actions, now).await;
        }
    }

    /// Query the venue for every symbol with live intents.
    pub async fn poll_ticks(&self, now: DateTime<Utc>) {
        for symbol in self.book.symbols() {
            match self.venue.query_tick(&symbol).await {
                Ok(tick) => self.on_tick(&symbol, tick, now).await,
                Err(e) => debug!(symbol = %symbol, error = %e, "No quote"),
            }
        }
    }

    /// Report followers that stopped acknowledging, once per stuck offset.
    pub async fn check_lag(&self, now: DateTime<Utc>) {
        for lag in self.bus.lagging(now) {
            let fresh = {
                let mut reported = self.lag_reported.lock();
                reported.insert(lag.follower.clone(), lag.acked) != Some(lag.acked)
            };
            if !fresh {
                continue;
            }
            warn!(
                follower = %lag.follower,
                acked = lag.acked,
                head = lag.head,
                waiting_secs = lag.waiting_secs,
                "Follower lagging"
            );
            self.notifier
                .notify(&Notification::FollowerLagging {
                    follower: lag.follower,
                    acked: lag.acked,
                    head: lag.head,
                })
                .await;
        }
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            messages: c.messages.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            intents_opened: c.opened.load(Ordering::Relaxed),
            ticks: c.ticks.load(Ordering::Relaxed),
            live_intents: self.book.active_count(),
            retired_intents: self.book.retired_count(),
            log_head: self.bus.head(),
        }
    }

    /// Main run loop.
    ///
    /// Completed candidates are admitted and submitted on their own tasks, so
    /// a slow venue never holds up message intake or price updates. With
    /// `exit_when_idle`, returns once the inbound channel is closed, no
    /// candidate is still collecting and every submission has finished.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut shutdown: watch::Receiver<bool>,
        exit_when_idle: bool,
    ) -> Result<()> {
        info!(
            sweep_ms = self.execution.sweep_interval_ms,
            poll_ms = self.execution.tick_poll_ms,
            "Starting engine run loop"
        );

        let mut sweep = interval(Duration::from_millis(self.execution.sweep_interval_ms.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = interval(Duration::from_millis(self.execution.tick_poll_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inbound_open = true;
        let mut submissions: JoinSet<Option<TradeIntent>> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !inbound_open && exit_when_idle && self.interpreter.collecting() == 0 && submissions.is_empty() {
                info!("Input exhausted and no candidates pending");
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                item = inbound.recv(), if inbound_open => match item {
                    Some(Inbound::Message(message)) => {
                        if let Err(e) = self.on_message(message, Utc::now()).await {
                            error!(error = %e, "Failed to handle message");
                        }
                    }
                    Some(Inbound::Tick { symbol, bid, ask, time }) => {
                        self.on_tick(&symbol, Tick::new(bid, ask, time), Utc::now()).await;
                    }
                    None => {
                        debug!("Inbound channel closed");
                        inbound_open = false;
                    }
                },
                Some(joined) = submissions.join_next(), if !submissions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Submission task failed");
                    }
                }
                _ = sweep.tick() => {
                    let now = Utc::now();
                    for candidate in self.take_ready(now).await {
                        let engine = self.clone();
                        submissions.spawn(async move { engine.admit(candidate, now).await });
                    }
                    self.check_lag(now).await;
                }
                _ = poll.tick() => {
                    self.poll_ticks(Utc::now()).await;
                }
            }
        }

        if !submissions.is_empty() {
            info!(pending = submissions.len(), "Waiting for submissions in flight");
        }
        while let Some(joined) = submissions.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Submission task failed");
            }
        }

        info!("Engine stopped\n{}", self.stats());
        Ok(())
    }
}

/// Delivery loop for one follower terminal.
pub struct FollowerRunner {
    follower: Follower,
    bus: Arc<ReplicationBus>,
}

impl FollowerRunner {
    pub fn new(follower: Follower, bus: Arc<ReplicationBus>) -> Self {
        Self { follower, bus }
    }

    /// Build a follower and resume it from its acknowledged offset.
    pub async fn restore(
        config: &FollowerConfig,
        settings: &Settings,
        venue: Arc<dyn ExecutionVenue>,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn NotificationSink>,
        bus: Arc<ReplicationBus>,
    ) -> Result<Self> {
        let intents = repo
            .load_intents(&config.id)
            .await
            .with_context(|| format!("Failed to load mirror intents of {}", config.id))?;
        let follower = Follower::new(
            config,
            venue,
            RetryPolicy::from_config(&settings.execution),
            repo,
            notifier,
            settings.replication.resync_batch,
        )
        .restore(bus.acked(&config.id), intents);
        Ok(Self::new(follower, bus))
    }

    /// Apply events until shutdown. The acknowledged offset survives for the next run.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Follower {
        let mut subscription = self.bus.subscribe(self.follower.id());
        subscription.rewind(self.follower.last_applied());

        while let Some(batch) = subscription.next_batch(&mut shutdown).await {
            let received = self.follower.receive_batch(batch, Utc::now()).await;
            if let Err(ReplicationError::Gap { expected, received }) = received {
                debug!(follower = %self.follower.id(), expected, received, "Requesting resync");
                if let Err(e) = self.follower.resync(self.bus.as_ref(), Utc::now()).await {
                    warn!(follower = %self.follower.id(), error = %e, "Resync incomplete");
                }
            }
            if let Err(e) = self.bus.ack(self.follower.id(), self.follower.last_applied()).await {
                error!(follower = %self.follower.id(), error = %e, "Failed to store offset");
            }
        }

        info!(follower = %self.follower.id(), "Follower stopped\n{}", self.follower.stats());
        self.follower
    }
}
