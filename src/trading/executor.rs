//! Trade decomposition and execution on the primary venue.
//!
//! Venue calls run with no intent lock held; the lock is re-acquired only to
//! record what the venue reported and to publish the matching events.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::book::{IntentBook, SharedIntent};
use super::ledger::LedgerHandle;
use super::tracker::LifecycleAction;
use crate::api::{place_order, ExecutionVenue, Notification, NotificationSink, OrderRequest, RetryPolicy};
use crate::db::{Repository, PRIMARY};
use crate::error::VenueError;
use crate::models::{
    EventPayload, IntentId, Leg, LegStatus, SymbolSpec, Ticket, TradeIntent, ValidatedSignal,
};
use crate::replication::ReplicationBus;

/// Split `total` across the targets, one leg per target.
///
/// The volume is divided in whole volume steps; the remainder goes to the
/// first leg. When there is not enough volume for every target to get at
/// least the instrument minimum, the later targets are dropped.
pub fn decompose(
    total: Decimal,
    targets: &BTreeMap<u8, Decimal>,
    stop: Decimal,
    spec: &SymbolSpec,
) -> Vec<Leg> {
    let units = spec.units(total);
    if units == 0 || targets.is_empty() {
        return Vec::new();
    }
    let count = (targets.len() as u64).min((units / spec.min_units()).max(1));
    let per_leg = units / count;
    let remainder = units % count;

    targets
        .iter()
        .take(count as usize)
        .enumerate()
        .map(|(position, (index, target))| {
            let leg_units = if position == 0 { per_leg + remainder } else { per_leg };
            Leg::new(*index, *target, Decimal::from(leg_units) * spec.volume_step, stop)
        })
        .collect()
}

pub struct Executor {
    venue: Arc<dyn ExecutionVenue>,
    retry: RetryPolicy,
    bus: Arc<ReplicationBus>,
    book: Arc<IntentBook>,
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn NotificationSink>,
    ledger: LedgerHandle,
}

impl Executor {
    pub fn new(
        venue: Arc<dyn ExecutionVenue>,
        retry: RetryPolicy,
        bus: Arc<ReplicationBus>,
        book: Arc<IntentBook>,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn NotificationSink>,
        ledger: LedgerHandle,
    ) -> Self {
        Self {
            venue,
            retry,
            bus,
            book,
            repo,
            notifier,
            ledger,
        }
    }

    /// Build the intent for an approved signal, record it and register it in the book.
    ///
    /// Nothing is sent to the venue yet. The intent is on record with every
    /// leg pending before any order goes out, so a crash mid-submission
    /// leaves something for the reconciler to match fills against.
    pub async fn prepare(
        &self,
        signal: &ValidatedSignal,
        volume: Decimal,
        risk_fraction: Decimal,
        now: DateTime<Utc>,
    ) -> Result<SharedIntent> {
        let candidate = &signal.signal;
        let spec = signal
            .spec
            .as_ref()
            .ok_or_else(|| anyhow!("No instrument specification for {}", candidate.source))?;
        let (Some(symbol), Some(direction), Some(entry), Some(stop)) = (
            candidate.symbol.clone(),
            candidate.direction,
            candidate.entry,
            candidate.stop,
        ) else {
            return Err(anyhow!("Signal {} is missing trade fields", candidate.source));
        };

        let legs = decompose(volume, &candidate.targets, stop, spec);
        if legs.is_empty() {
            return Err(anyhow!("Volume {} cannot be split into legs", volume));
        }

        let intent = TradeIntent {
            id: IntentId::new(),
            source: Some(candidate.source),
            symbol,
            direction,
            entry,
            stop,
            risk_fraction,
            total_volume: volume,
            value_per_unit_move: spec.value_per_unit_move,
            legs,
            breakeven_applied: false,
            modifications: Vec::new(),
            created_at: now,
        };
        if intent.allocated_volume() != volume {
            return Err(anyhow!(
                "Legs of {} carry {} instead of {}",
                intent.id,
                intent.allocated_volume(),
                volume
            ));
        }
        info!(
            intent = %intent.id,
            symbol = %intent.symbol,
            direction = %intent.direction,
            volume = %volume,
            legs = intent.legs.len(),
            "Trade intent prepared"
        );
        self.repo
            .record_intent(PRIMARY, &intent)
            .await
            .with_context(|| format!("Failed to record intent {} before submission", intent.id))?;
        Ok(self.book.insert(intent))
    }

    /// Submit every pending leg concurrently and record the outcomes.
    ///
    /// Legs succeed or fail independently; an already open leg is never
    /// rolled back because a sibling failed.
    pub async fn submit(&self, shared: SharedIntent, now: DateTime<Utc>) -> TradeIntent {
        let (id, orders) = {
            let intent = shared.lock().await;
            let orders: Vec<(u8, OrderRequest)> = intent
                .legs
                .iter()
                .filter(|leg| leg.status == LegStatus::Pending)
                .map(|leg| {
                    (
                        leg.index,
                        OrderRequest {
                            symbol: intent.symbol.clone(),
                            direction: intent.direction,
                            volume: leg.volume,
                            stop: leg.stop,
                            target: leg.target,
                            entry: intent.entry,
                            comment: intent.id.order_comment(leg.index),
                        },
                    )
                })
                .collect();
            (intent.id, orders)
        };

        let results = join_all(orders.iter().map(|(index, order)| async move {
            let result = place_order(self.venue.as_ref(), &self.retry, order).await;
            (*index, result)
        }))
        .await;

        let mut intent = shared.lock().await;
        let mut failures = Vec::new();
        for (index, result) in results {
            let Some(leg) = intent.leg_mut(index) else {
                continue;
            };
            match result {
                Ok(ticket) => {
                    if let Err(e) = leg.mark_open(ticket) {
                        warn!(intent = %id, leg = index, error = %e, "Fill for a leg that is no longer pending");
                        continue;
                    }
                    info!(intent = %id, leg = index, ticket = %ticket, volume = %leg.volume, "Leg opened");
                }
                Err(e) => {
                    let _ = leg.transition(LegStatus::Cancelled);
                    error!(intent = %id, leg = index, error = %e, "Leg submission failed");
                    failures.push((index, e));
                }
            }
        }

        // published under the intent lock so no close can overtake its open
        let opened: Vec<Leg> = intent.legs.iter().filter(|l| l.is_open()).cloned().collect();
        for leg in &opened {
            let payload = EventPayload::Open {
                symbol: intent.symbol.clone(),
                direction: intent.direction,
                entry: intent.entry,
                volume: leg.volume,
                stop: leg.stop,
                target: leg.target,
            };
            self.publish(id, Some(leg.index), payload, now).await;
        }
        let snapshot = intent.clone();
        drop(intent);

        for (leg, e) in failures {
            self.notifier
                .notify(&Notification::LegFailed {
                    intent: id,
                    leg,
                    reason: failure_reason(&e),
                })
                .await;
        }
        if !opened.is_empty() {
            self.notifier
                .notify(&Notification::TradeOpened {
                    intent: id,
                    symbol: snapshot.symbol.clone(),
                    direction: snapshot.direction,
                    legs: opened.len(),
                    volume: opened.iter().map(|l| l.volume).sum(),
                })
                .await;
        }

        self.persist(&snapshot).await;
        if snapshot.is_finished() {
            warn!(intent = %id, "No leg could be opened, dropping intent");
            self.book.retire(id);
        }
        snapshot
    }

    /// Carry out what the tracker decided: venue calls, events, ledger updates.
    ///
    /// A close the venue refuses reopens the leg and publishes nothing; the
    /// tracker decides again on a later price.
    pub async fn apply_actions(&self, actions: Vec<LifecycleAction>, now: DateTime<Utc>) {
        let mut touched: BTreeMap<IntentId, SharedIntent> = BTreeMap::new();
        let mut refused: HashSet<IntentId> = HashSet::new();

        for action in actions {
            let id = action_intent(&action);
            if let Some(shared) = self.book.get(id) {
                touched.entry(id).or_insert(shared);
            }

            match action {
                LifecycleAction::MoveStop { intent, leg, ticket, from, to } => {
                    self.move_stop(intent, leg, ticket, from, to, now).await;
                }
                LifecycleAction::BreakevenApplied { intent, symbol, stop, legs } => {
                    info!(intent = %intent, symbol = %symbol, stop = %stop, legs, "Breakeven applied");
                    self.notifier
                        .notify(&Notification::BreakevenApplied { intent, symbol, stop, legs })
                        .await;
                }
                LifecycleAction::CloseLeg { intent, leg, ticket, price, reason, pnl } => {
                    if let Some(ticket) = ticket {
                        if let Err(e) = self.close(intent, leg, ticket).await {
                            refused.insert(intent);
                            self.notifier
                                .notify(&Notification::LegFailed {
                                    intent,
                                    leg,
                                    reason: format!("close failed: {}", e),
                                })
                                .await;
                            continue;
                        }
                    }
                    self.publish(intent, Some(leg), EventPayload::Close { price, reason }, now)
                        .await;
                    if let Err(e) = self.ledger.record_leg_closed(pnl, now).await {
                        error!(error = %e, "Failed to record leg result");
                    }
                    self.notifier
                        .notify(&Notification::LegClosed { intent, leg, price, reason })
                        .await;
                }
                LifecycleAction::IntentFinished { intent, net_pnl } => {
                    if refused.contains(&intent) {
                        debug!(intent = %intent, "Intent still has a leg open at the venue");
                        continue;
                    }
                    if let Err(e) = self.ledger.record_intent_finished(net_pnl, now).await {
                        error!(error = %e, "Failed to record intent result");
                    }
                    info!(intent = %intent, net_pnl = %net_pnl, "Intent finished");
                    self.book.retire(intent);
                }
            }
        }

        for shared in touched.into_values() {
            let snapshot = shared.lock().await.clone();
            self.persist(&snapshot).await;
        }
    }

    /// Close at the venue. On refusal the leg is reopened locally.
    async fn close(&self, intent: IntentId, leg: u8, ticket: Ticket) -> Result<(), VenueError> {
        let result = self
            .retry
            .run("close_position", || self.venue.close_position(ticket))
            .await;
        match result {
            Ok(()) | Err(VenueError::PositionNotFound(_)) => Ok(()),
            Err(e) => {
                error!(intent = %intent, leg, ticket = %ticket, error = %e, "Close refused, leg stays open");
                if let Some(shared) = self.book.get(intent) {
                    let mut state = shared.lock().await;
                    if let Some(Err(e)) = state.leg_mut(leg).map(|l| l.reopen()) {
                        warn!(intent = %intent, leg, error = %e, "Could not reopen leg");
                    }
                }
                Err(e)
            }
        }
    }

    async fn move_stop(
        &self,
        intent: IntentId,
        leg: u8,
        ticket: Option<Ticket>,
        from: Decimal,
        to: Decimal,
        now: DateTime<Utc>,
    ) {
        if let Some(ticket) = ticket {
            let result = self
                .retry
                .run("modify_stop", || self.venue.modify_stop(ticket, to))
                .await;
            if let Err(e) = result {
                error!(intent = %intent, leg, ticket = %ticket, error = %e, "Stop modification failed");
                if let Some(shared) = self.book.get(intent) {
                    let mut state = shared.lock().await;
                    if let Some(l) = state.leg_mut(leg) {
                        if l.stop == to {
                            l.set_stop(from);
                        }
                    }
                }
                self.notifier
                    .notify(&Notification::LegFailed {
                        intent,
                        leg,
                        reason: format!("stop modification failed: {}", e),
                    })
                    .await;
                return;
            }
        }
        debug!(intent = %intent, leg, from = %from, to = %to, "Stop moved");
        self.publish(
            intent,
            Some(leg),
            EventPayload::ModifyStop {
                old_stop: from,
                new_stop: to,
            },
            now,
        )
        .await;
    }

    async fn publish(&self, intent: IntentId, leg: Option<u8>, payload: EventPayload, now: DateTime<Utc>) {
        if let Err(e) = self.bus.publish(intent, leg, payload, now).await {
            // the reconciler re-emits it on the next restart
            error!(intent = %intent, leg = ?leg, error = %e, "Failed to publish replication event");
        }
    }

    async fn persist(&self, intent: &TradeIntent) {
        if let Err(e) = self.repo.record_intent(PRIMARY, intent).await {
            warn!(intent = %intent.id, error = %e, "Failed to persist intent");
        }
    }
}

fn action_intent(action: &LifecycleAction) -> IntentId {
    match action {
        LifecycleAction::MoveStop { intent, .. }
        | LifecycleAction::BreakevenApplied { intent, .. }
        | LifecycleAction::CloseLeg { intent, .. }
        | LifecycleAction::IntentFinished { intent, .. } => *intent,
    }
}

fn failure_reason(error: &VenueError) -> String {
    if error.is_transient() {
        format!("retries exhausted: {}", error)
    } else {
        error.to_string()
    }
}
