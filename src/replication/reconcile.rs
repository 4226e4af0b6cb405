//! Restart reconciliation on the primary.
//!
//! A crash can land between a venue call and the event that reports it. On
//! restart the recorded intent state and the venue's open positions are
//! compared with the log, and whatever the log is missing is published once.
//! Fills whose confirmation was lost are found again by their order comment.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::ReplicationBus;
use crate::api::ExecutionVenue;
use crate::db::{Repository, PRIMARY};
use crate::models::{
    CloseReason, Direction, EventKind, EventPayload, IntentId, LegStatus, ReplicationEvent, Ticket,
    TradeIntent,
};
use crate::trading::{IntentBook, LifecycleAction};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Events that were missing from the log and have now been published
    pub republished: Vec<ReplicationEvent>,
    /// Legs found closed at the venue; to be carried out like tracker decisions
    pub external_closes: Vec<LifecycleAction>,
    /// Pending legs matched to a venue position by order comment
    pub adopted_legs: usize,
    /// Pending legs with no fill at the venue, now cancelled
    pub cancelled_legs: usize,
    /// Finished intents dropped from the live book
    pub retired: usize,
}

/// What the log already says about each leg.
#[derive(Default)]
struct LogIndex {
    emitted: HashSet<(IntentId, Option<u8>, EventKind)>,
    last_stop: HashMap<(IntentId, u8), Decimal>,
}

impl LogIndex {
    fn build(events: &[ReplicationEvent]) -> Self {
        let mut index = Self::default();
        for event in events {
            index.record(event);
        }
        index
    }

    fn record(&mut self, event: &ReplicationEvent) {
        self.emitted.insert((event.intent_id, event.leg, event.kind()));
        let Some(leg) = event.leg else {
            return;
        };
        match &event.payload {
            EventPayload::Open { stop, .. } => {
                self.last_stop.insert((event.intent_id, leg), *stop);
            }
            EventPayload::ModifyStop { new_stop, .. } => {
                self.last_stop.insert((event.intent_id, leg), *new_stop);
            }
            _ => {}
        }
    }

    fn has(&self, intent: IntentId, leg: u8, kind: EventKind) -> bool {
        self.emitted.contains(&(intent, Some(leg), kind))
            || (kind == EventKind::Cancel && self.emitted.contains(&(intent, None, kind)))
    }
}

pub struct Reconciler {
    bus: Arc<ReplicationBus>,
    venue: Arc<dyn ExecutionVenue>,
    repo: Arc<dyn Repository>,
}

impl Reconciler {
    pub fn new(bus: Arc<ReplicationBus>, venue: Arc<dyn ExecutionVenue>, repo: Arc<dyn Repository>) -> Self {
        Self { bus, venue, repo }
    }

    /// Bring the log in line with every intent in `book`.
    pub async fn reconcile(&self, book: &IntentBook, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut index = LogIndex::build(&self.bus.events());
        let positions = self
            .venue
            .open_positions()
            .await
            .context("Failed to list open positions")?;
        let at_venue: HashSet<Ticket> = positions.iter().map(|p| p.ticket).collect();
        let by_comment: HashMap<String, Ticket> = positions
            .into_iter()
            .filter(|p| !p.comment.is_empty())
            .map(|p| (p.comment, p.ticket))
            .collect();
        let mut marks: HashMap<String, Option<Decimal>> = HashMap::new();
        let mut report = ReconcileReport::default();

        for symbol in book.symbols() {
            for id in book.ids_for(&symbol) {
                let Some(shared) = book.get(id) else {
                    continue;
                };
                let mut intent = shared.lock().await;
                let was_finished = intent.is_finished();

                self.republish(&mut intent, &mut index, &by_comment, now, &mut report).await?;
                if !was_finished {
                    let mark = match marks.get(&symbol) {
                        Some(mark) => *mark,
                        None => {
                            let mark = self.mark(&symbol, intent.direction).await;
                            marks.insert(symbol.clone(), mark);
                            mark
                        }
                    };
                    self.detect_external_closes(&mut intent, &at_venue, mark, &mut report);
                }

                let snapshot = intent.clone();
                drop(intent);
                self.repo.record_intent(PRIMARY, &snapshot).await?;
                if was_finished {
                    book.retire(id);
                    report.retired += 1;
                }
            }
        }

        info!(
            republished = report.republished.len(),
            external_closes = report.external_closes.len(),
            adopted_legs = report.adopted_legs,
            cancelled_legs = report.cancelled_legs,
            retired = report.retired,
            head = self.bus.head(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn republish(
        &self,
        intent: &mut TradeIntent,
        index: &mut LogIndex,
        by_comment: &HashMap<String, Ticket>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let id = intent.id;
        for leg_index in intent.legs.iter().map(|l| l.index).collect::<Vec<_>>() {
            let Some(leg) = intent.leg_mut(leg_index) else {
                continue;
            };

            if leg.status == LegStatus::Pending && leg.ticket.is_none() {
                // the outcome of the submission never made it to the record
                match by_comment.get(&id.order_comment(leg_index)) {
                    Some(ticket) if leg.mark_open(*ticket).is_ok() => {
                        report.adopted_legs += 1;
                        warn!(intent = %id, leg = leg_index, ticket = %ticket, "Unrecorded fill adopted");
                    }
                    _ => {
                        let _ = leg.transition(LegStatus::Cancelled);
                        report.cancelled_legs += 1;
                        warn!(intent = %id, leg = leg_index, "Pending leg without fill cancelled");
                    }
                }
            }
            let leg = leg.clone();
            let mut missing = Vec::new();

            if leg.ticket.is_some() && !index.has(id, leg_index, EventKind::Open) {
                missing.push(EventPayload::Open {
                    symbol: intent.symbol.clone(),
                    direction: intent.direction,
                    entry: intent.entry,
                    volume: leg.volume,
                    stop: intent.stop,
                    target: leg.target,
                });
            }
            let last_stop = if missing.is_empty() {
                index.last_stop.get(&(id, leg_index)).copied()
            } else {
                Some(intent.stop)
            };
            if let Some(old_stop) = last_stop {
                if old_stop != leg.stop && matches!(leg.status, LegStatus::Open | LegStatus::Closed) {
                    missing.push(EventPayload::ModifyStop {
                        old_stop,
                        new_stop: leg.stop,
                    });
                }
            }
            match leg.status {
                LegStatus::Closed if !index.has(id, leg_index, EventKind::Close) => {
                    let price = leg.close_price.unwrap_or(leg.stop);
                    let reason = if price == leg.target {
                        CloseReason::Target
                    } else {
                        CloseReason::Stop
                    };
                    missing.push(EventPayload::Close { price, reason });
                }
                // followers only know legs whose Open went out
                LegStatus::Cancelled
                    if index.has(id, leg_index, EventKind::Open)
                        && !index.has(id, leg_index, EventKind::Cancel) =>
                {
                    missing.push(EventPayload::Cancel {
                        reason: "cancelled before restart".to_string(),
                    });
                }
                _ => {}
            }

            for payload in missing {
                let event = self.bus.publish(id, Some(leg_index), payload, now).await?;
                info!(event = %event, "Republished missing event");
                index.record(&event);
                report.republished.push(event);
            }
        }
        Ok(())
    }

    /// Legs we hold open that the venue no longer has were closed behind our back.
    fn detect_external_closes(
        &self,
        intent: &mut TradeIntent,
        at_venue: &HashSet<Ticket>,
        mark: Option<Decimal>,
        report: &mut ReconcileReport,
    ) {
        let (id, entry, direction, value) = (
            intent.id,
            intent.entry,
            intent.direction,
            intent.value_per_unit_move,
        );
        let mut closed_any = false;
        for leg in intent.legs.iter_mut().filter(|l| l.is_open()) {
            let Some(ticket) = leg.ticket else {
                continue;
            };
            if at_venue.contains(&ticket) {
                continue;
            }
            let price = match mark {
                Some(mark) if direction.target_reached(mark, leg.target) => leg.target,
                Some(mark) if direction.stop_hit(mark, leg.stop) => leg.stop,
                Some(mark) => mark,
                None => leg.stop,
            };
            if leg.mark_closed(price).is_ok() {
                closed_any = true;
                warn!(intent = %id, leg = leg.index, ticket = %ticket, price = %price, "Position closed outside the engine");
                report.external_closes.push(LifecycleAction::CloseLeg {
                    intent: id,
                    leg: leg.index,
                    ticket: None,
                    price,
                    reason: CloseReason::External,
                    pnl: leg.realized_pnl(entry, direction, value),
                });
            }
        }
        if closed_any && intent.is_finished() {
            report.external_closes.push(LifecycleAction::IntentFinished {
                intent: id,
                net_pnl: intent.realized_pnl(),
            });
        }
    }

    async fn mark(&self, symbol: &str, direction: Direction) -> Option<Decimal> {
        match self.venue.query_tick(symbol).await {
            Ok(tick) => Some(match direction {
                Direction::Long => tick.bid,
                Direction::Short => tick.ask,
            }),
            Err(e) => {
                warn!(symbol, error = %e, "No quote for reconciliation, using stops");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderRequest, PaperVenue};
    use crate::db::MemoryRepository;
    use crate::models::{Leg, SymbolSpec, Tick};
    use crate::replication::ReplicationConfig;
    use rust_decimal_macros::dec;

    fn gold() -> SymbolSpec {
        SymbolSpec {
            symbol: "XAUUSD".to_string(),
            volume_step: dec!(0.01),
            min_volume: dec!(0.01),
            max_volume: dec!(50),
            value_per_unit_move: dec!(1),
            trade_allowed: true,
        }
    }

    struct Fixture {
        venue: Arc<PaperVenue>,
        bus: Arc<ReplicationBus>,
        book: IntentBook,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let venue = Arc::new(PaperVenue::new("primary", vec![gold()]));
        venue.set_tick("XAUUSD", Tick::new(dec!(3233), dec!(3233.2), Utc::now()));
        let bus = Arc::new(ReplicationBus::new(ReplicationConfig::default(), repo.clone()));
        let reconciler = Reconciler::new(bus.clone(), venue.clone(), repo);
        Fixture {
            venue,
            bus,
            book: IntentBook::new(),
            reconciler,
        }
    }

    async fn fill(venue: &PaperVenue, target: Decimal, comment: String) -> Ticket {
        venue
            .submit_order(&OrderRequest {
                symbol: "XAUUSD".to_string(),
                direction: Direction::Long,
                volume: dec!(1.04),
                stop: dec!(3220),
                target,
                entry: dec!(3232),
                comment,
            })
            .await
            .unwrap()
    }

    fn pending_intent() -> TradeIntent {
        TradeIntent {
            id: IntentId::new(),
            source: None,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Long,
            entry: dec!(3232),
            stop: dec!(3220),
            risk_fraction: dec!(0.0025),
            total_volume: dec!(2.08),
            value_per_unit_move: dec!(1),
            legs: vec![
                Leg::new(1, dec!(3235), dec!(1.04), dec!(3220)),
                Leg::new(2, dec!(3239), dec!(1.04), dec!(3220)),
            ],
            breakeven_applied: false,
            modifications: Vec::new(),
            created_at: Utc::now(),
        }
    }

    async fn open_intent(venue: &PaperVenue) -> TradeIntent {
        let mut intent = pending_intent();
        let id = intent.id;
        for leg in intent.legs.iter_mut() {
            let ticket = fill(venue, leg.target, id.order_comment(leg.index)).await;
            leg.mark_open(ticket).unwrap();
        }
        intent
    }

    fn kinds(events: &[ReplicationEvent]) -> Vec<(Option<u8>, EventKind)> {
        events.iter().map(|e| (e.leg, e.kind())).collect()
    }

    #[tokio::test]
    async fn test_missing_opens_emitted_exactly_once() {
        let f = fixture();
        f.book.insert(open_intent(&f.venue).await);

        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert_eq!(
            kinds(&report.republished),
            vec![(Some(1), EventKind::Open), (Some(2), EventKind::Open)]
        );
        assert!(report.external_closes.is_empty());

        let again = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert!(again.republished.is_empty());
        assert_eq!(f.bus.head(), 2);
    }

    #[tokio::test]
    async fn test_breakeven_and_close_recovered_in_order() {
        let f = fixture();
        let mut intent = open_intent(&f.venue).await;
        let id = intent.id;
        // opens went out, then the process died after recording breakeven
        for leg in &intent.legs {
            let payload = EventPayload::Open {
                symbol: "XAUUSD".to_string(),
                direction: Direction::Long,
                entry: dec!(3232),
                volume: leg.volume,
                stop: dec!(3220),
                target: leg.target,
            };
            f.bus.publish(id, Some(leg.index), payload, Utc::now()).await.unwrap();
        }
        intent.legs[1].tighten_stop(dec!(3232), Direction::Long);
        intent.legs[0].mark_closed(dec!(3235)).unwrap();
        intent.breakeven_applied = true;
        let first_ticket = intent.legs[0].ticket.unwrap();
        f.venue.close_position(first_ticket).await.unwrap();
        f.book.insert(intent);

        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert_eq!(
            kinds(&report.republished),
            vec![(Some(1), EventKind::Close), (Some(2), EventKind::ModifyStop)]
        );
        assert_eq!(
            report.republished[0].payload,
            EventPayload::Close {
                price: dec!(3235),
                reason: CloseReason::Target
            }
        );
        assert_eq!(
            report.republished[1].payload,
            EventPayload::ModifyStop {
                old_stop: dec!(3220),
                new_stop: dec!(3232)
            }
        );
        assert!(report.external_closes.is_empty());
    }

    #[tokio::test]
    async fn test_position_gone_at_venue_is_closed_externally() {
        let f = fixture();
        let intent = open_intent(&f.venue).await;
        let id = intent.id;
        let tickets: Vec<Ticket> = intent.legs.iter().filter_map(|l| l.ticket).collect();
        f.book.insert(intent);
        f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();

        f.venue.set_tick("XAUUSD", Tick::new(dec!(3219), dec!(3219.2), Utc::now()));
        for ticket in tickets {
            f.venue.force_close(ticket);
        }
        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();

        assert_eq!(report.external_closes.len(), 3);
        assert!(matches!(
            report.external_closes[0],
            LifecycleAction::CloseLeg {
                reason: CloseReason::External,
                price,
                ..
            } if price == dec!(3220)
        ));
        assert_eq!(
            report.external_closes[2],
            LifecycleAction::IntentFinished {
                intent: id,
                net_pnl: dec!(-24.96)
            }
        );
    }

    #[tokio::test]
    async fn test_unfilled_pending_leg_cancelled() {
        let f = fixture();
        let mut intent = open_intent(&f.venue).await;
        intent.legs.push(Leg::new(3, dec!(3245), dec!(1.04), dec!(3220)));
        f.book.insert(intent);

        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert_eq!(report.cancelled_legs, 1);
        // never announced, so followers have nothing to cancel
        assert_eq!(
            kinds(&report.republished),
            vec![(Some(1), EventKind::Open), (Some(2), EventKind::Open)]
        );
    }

    #[tokio::test]
    async fn test_unrecorded_fill_is_adopted_by_comment() {
        let f = fixture();
        let intent = pending_intent();
        let id = intent.id;
        // leg 1 filled but the process died before recording it
        let ticket = fill(&f.venue, dec!(3235), id.order_comment(1)).await;
        f.book.insert(intent);

        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert_eq!(report.adopted_legs, 1);
        assert_eq!(report.cancelled_legs, 1);
        assert_eq!(kinds(&report.republished), vec![(Some(1), EventKind::Open)]);

        let state = f.book.get(id).unwrap().lock().await.clone();
        assert_eq!(state.leg(1).unwrap().ticket, Some(ticket));
        assert!(state.leg(1).unwrap().is_open());
        assert_eq!(state.leg(2).unwrap().status, LegStatus::Cancelled);
        assert_eq!(f.venue.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_of_announced_leg_is_republished() {
        let f = fixture();
        let mut intent = open_intent(&f.venue).await;
        f.book.insert(intent.clone());
        f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();

        intent.legs[1].transition(LegStatus::Cancelled).unwrap();
        let book = IntentBook::new();
        book.insert(intent);
        let report = f.reconciler.reconcile(&book, Utc::now()).await.unwrap();
        assert_eq!(kinds(&report.republished), vec![(Some(2), EventKind::Cancel)]);
    }

    #[tokio::test]
    async fn test_finished_intent_is_retired() {
        let f = fixture();
        let mut intent = open_intent(&f.venue).await;
        for leg in intent.legs.iter_mut() {
            let ticket = leg.ticket.unwrap();
            f.venue.close_position(ticket).await.unwrap();
            leg.mark_closed(dec!(3220)).unwrap();
        }
        f.book.insert(intent);

        let report = f.reconciler.reconcile(&f.book, Utc::now()).await.unwrap();
        assert_eq!(report.retired, 1);
        assert_eq!(f.book.active_count(), 0);
        // open then stop-out close for each leg
        assert_eq!(report.republished.len(), 4);
    }
}
