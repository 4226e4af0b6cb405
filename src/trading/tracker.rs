//! Position lifecycle: target and stop detection, breakeven, and mirroring
//! of replicated decisions.
//!
//! The tracker only mutates intent state and reports what the venue must be
//! told. Venue calls happen afterwards, with no intent lock held.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::book::IntentBook;
use crate::error::ReplicationError;
use crate::models::{
    CloseReason, Direction, EventPayload, IntentId, Leg, LegStatus, ReplicationEvent, StopChange,
    StopModification, Tick, Ticket, TradeIntent,
};

/// Follow-up work produced by a price update on the primary.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    MoveStop {
        intent: IntentId,
        leg: u8,
        ticket: Option<Ticket>,
        from: Decimal,
        to: Decimal,
    },
    BreakevenApplied {
        intent: IntentId,
        symbol: String,
        stop: Decimal,
        legs: usize,
    },
    CloseLeg {
        intent: IntentId,
        leg: u8,
        ticket: Option<Ticket>,
        price: Decimal,
        reason: CloseReason,
        pnl: Decimal,
    },
    IntentFinished {
        intent: IntentId,
        net_pnl: Decimal,
    },
}

/// Venue work a follower owes after applying a replicated event.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorAction {
    Open {
        intent: IntentId,
        leg: u8,
        symbol: String,
        direction: Direction,
        entry: Decimal,
        volume: Decimal,
        stop: Decimal,
        target: Decimal,
    },
    ModifyStop {
        intent: IntentId,
        leg: u8,
        ticket: Ticket,
        /// Stop before the event, restored if the venue refuses
        old_stop: Decimal,
        new_stop: Decimal,
    },
    Close {
        intent: IntentId,
        leg: u8,
        ticket: Ticket,
    },
}

pub struct PositionTracker {
    book: Arc<IntentBook>,
}

impl PositionTracker {
    pub fn new(book: Arc<IntentBook>) -> Self {
        Self { book }
    }

    pub fn book(&self) -> &Arc<IntentBook> {
        &self.book
    }

    /// Evaluate every live intent on `symbol` against a new quote.
    ///
    /// Longs are marked at the bid and shorts at the ask.
    pub async fn on_tick(&self, symbol: &str, tick: &Tick, now: DateTime<Utc>) -> Vec<LifecycleAction> {
        let mut actions = Vec::new();
        for id in self.book.ids_for(symbol) {
            let Some(shared) = self.book.get(id) else {
                continue;
            };
            let mut intent = shared.lock().await;
            evaluate(&mut intent, tick, now, &mut actions);
        }
        actions
    }

    /// Apply a replicated event verbatim to the local mirror and return the
    /// venue work it implies. Empty when the change is local only.
    ///
    /// Never consults prices: the primary's decision is final.
    pub async fn apply_event(
        &self,
        event: &ReplicationEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<MirrorAction>, ReplicationError> {
        let leg_index = event.leg;
        match &event.payload {
            EventPayload::Open {
                symbol,
                direction,
                entry,
                volume,
                stop,
                target,
            } => {
                let index = leg_index.ok_or(ReplicationError::UnknownLeg {
                    intent: event.intent_id,
                    leg: 0,
                })?;
                let shared = match self.book.get(event.intent_id) {
                    Some(shared) => shared,
                    None => self.book.insert(TradeIntent {
                        id: event.intent_id,
                        source: None,
                        symbol: symbol.clone(),
                        direction: *direction,
                        entry: *entry,
                        stop: *stop,
                        risk_fraction: Decimal::ZERO,
                        total_volume: Decimal::ZERO,
                        value_per_unit_move: Decimal::ONE,
                        legs: Vec::new(),
                        breakeven_applied: false,
                        modifications: Vec::new(),
                        created_at: now,
                    }),
                };
                let mut intent = shared.lock().await;
                if intent.leg(index).is_some() {
                    return Ok(Vec::new());
                }
                intent.total_volume += *volume;
                intent.legs.push(Leg::new(index, *target, *volume, *stop));
                intent.legs.sort_by_key(|l| l.index);
                Ok(vec![MirrorAction::Open {
                    intent: intent.id,
                    leg: index,
                    symbol: symbol.clone(),
                    direction: *direction,
                    entry: *entry,
                    volume: *volume,
                    stop: *stop,
                    target: *target,
                }])
            }

            EventPayload::ModifyStop { new_stop, .. } => {
                let (shared, index) = self.locate(event)?;
                let mut intent = shared.lock().await;
                let entry = intent.entry;
                let leg = intent.leg_mut(index).ok_or(ReplicationError::UnknownLeg {
                    intent: event.intent_id,
                    leg: index,
                })?;
                if leg.status.is_terminal() {
                    return Ok(Vec::new());
                }
                let from = leg.set_stop(*new_stop);
                let ticket = leg.ticket;
                if *new_stop == entry {
                    intent.breakeven_applied = true;
                }
                intent.modifications.push(StopModification {
                    leg: index,
                    from,
                    to: *new_stop,
                    cause: StopChange::Replicated,
                    at: now,
                });
                Ok(ticket
                    .map(|ticket| MirrorAction::ModifyStop {
                        intent: event.intent_id,
                        leg: index,
                        ticket,
                        old_stop: from,
                        new_stop: *new_stop,
                    })
                    .into_iter()
                    .collect())
            }

            EventPayload::Close { price, .. } => {
                let (shared, index) = self.locate(event)?;
                let mut intent = shared.lock().await;
                let leg = intent.leg_mut(index).ok_or(ReplicationError::UnknownLeg {
                    intent: event.intent_id,
                    leg: index,
                })?;
                if leg.status != LegStatus::Open {
                    return Ok(Vec::new());
                }
                let ticket = leg.ticket;
                // only fails for a non-open leg, excluded above
                let _ = leg.mark_closed(*price);
                Ok(ticket
                    .map(|ticket| MirrorAction::Close {
                        intent: event.intent_id,
                        leg: index,
                        ticket,
                    })
                    .into_iter()
                    .collect())
            }

            EventPayload::Cancel { .. } => {
                let Some(shared) = self.book.get(event.intent_id) else {
                    return Ok(Vec::new());
                };
                let mut intent = shared.lock().await;
                let mut to_close = Vec::new();
                for leg in intent.legs.iter_mut() {
                    if leg_index.map_or(false, |i| i != leg.index) || leg.status.is_terminal() {
                        continue;
                    }
                    if let (true, Some(ticket)) = (leg.is_open(), leg.ticket) {
                        to_close.push(MirrorAction::Close {
                            intent: event.intent_id,
                            leg: leg.index,
                            ticket,
                        });
                    }
                    let _ = leg.transition(LegStatus::Cancelled);
                }
                Ok(to_close)
            }
        }
    }

    fn locate(&self, event: &ReplicationEvent) -> Result<(super::book::SharedIntent, u8), ReplicationError> {
        let shared = self
            .book
            .get(event.intent_id)
            .ok_or(ReplicationError::UnknownIntent(event.intent_id))?;
        let index = event.leg.ok_or(ReplicationError::UnknownLeg {
            intent: event.intent_id,
            leg: 0,
        })?;
        Ok((shared, index))
    }
}

/// Target and stop checks for one intent. Mutates state at decision time so
/// a repeated tick cannot produce the same action twice.
fn evaluate(intent: &mut TradeIntent, tick: &Tick, now: DateTime<Utc>, actions: &mut Vec<LifecycleAction>) {
    if intent.is_finished() {
        return;
    }
    let direction = intent.direction;
    let price = match direction {
        Direction::Long => tick.bid,
        Direction::Short => tick.ask,
    };
    let value = intent.value_per_unit_move;
    let entry = intent.entry;
    let id = intent.id;

    while let Some((index, target)) = intent.first_open_leg().map(|l| (l.index, l.target)) {
        if !direction.target_reached(price, target) {
            break;
        }
        if !intent.breakeven_applied {
            intent.breakeven_applied = true;
            apply_breakeven(intent, index, now, actions);
        }
        if let Some(leg) = intent.leg_mut(index) {
            if leg.mark_closed(target).is_ok() {
                let pnl = leg.realized_pnl(entry, direction, value);
                info!(intent = %id, leg = index, price = %target, "Target reached");
                actions.push(LifecycleAction::CloseLeg {
                    intent: id,
                    leg: index,
                    ticket: leg.ticket,
                    price: target,
                    reason: CloseReason::Target,
                    pnl,
                });
            }
        }
    }

    for leg in intent.legs.iter_mut().filter(|l| l.is_open()) {
        if !direction.stop_hit(price, leg.stop) {
            continue;
        }
        let stop = leg.stop;
        if leg.mark_closed(stop).is_ok() {
            let pnl = leg.realized_pnl(entry, direction, value);
            info!(intent = %id, leg = leg.index, price = %stop, "Stop hit");
            actions.push(LifecycleAction::CloseLeg {
                intent: id,
                leg: leg.index,
                ticket: leg.ticket,
                price: stop,
                reason: CloseReason::Stop,
                pnl,
            });
        }
    }

    if intent.is_finished() {
        actions.push(LifecycleAction::IntentFinished {
            intent: id,
            net_pnl: intent.realized_pnl(),
        });
    }
}

/// Move every other open leg's stop to the entry price. One-shot per intent.
fn apply_breakeven(intent: &mut TradeIntent, reached: u8, now: DateTime<Utc>, actions: &mut Vec<LifecycleAction>) {
    let (id, entry, direction) = (intent.id, intent.entry, intent.direction);
    let mut moved = Vec::new();
    for leg in intent.legs.iter_mut() {
        if leg.index == reached || !leg.is_open() {
            continue;
        }
        if let Some(from) = leg.tighten_stop(entry, direction) {
            moved.push((leg.index, leg.ticket, from));
        }
    }

    for (leg, ticket, from) in &moved {
        intent.modifications.push(StopModification {
            leg: *leg,
            from: *from,
            to: entry,
            cause: StopChange::Breakeven,
            at: now,
        });
        actions.push(LifecycleAction::MoveStop {
            intent: id,
            leg: *leg,
            ticket: *ticket,
            from: *from,
            to: entry,
        });
    }
    debug!(intent = %id, legs = moved.len(), "Breakeven evaluated");
    if !moved.is_empty() {
        actions.push(LifecycleAction::BreakevenApplied {
            intent: id,
            symbol: intent.symbol.clone(),
            stop: entry,
            legs: moved.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventId;
    use rust_decimal_macros::dec;

    fn open_intent(direction: Direction) -> TradeIntent {
        let (stop, t1, t2) = match direction {
            Direction::Long => (dec!(3220), dec!(3235), dec!(3239)),
            Direction::Short => (dec!(3244), dec!(3229), dec!(3225)),
        };
        let mut legs = vec![
            Leg::new(1, t1, dec!(1.04), stop),
            Leg::new(2, t2, dec!(1.04), stop),
        ];
        legs[0].mark_open(Ticket(1)).unwrap();
        legs[1].mark_open(Ticket(2)).unwrap();
        TradeIntent {
            id: IntentId::new(),
            source: None,
            symbol: "XAUUSD".to_string(),
            direction,
            entry: dec!(3232),
            stop,
            risk_fraction: dec!(0.0025),
            total_volume: dec!(2.08),
            value_per_unit_move: dec!(1),
            legs,
            breakeven_applied: false,
            modifications: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn tick(bid: Decimal) -> Tick {
        Tick::new(bid, bid + dec!(0.2), Utc::now())
    }

    fn tracker_with(intent: TradeIntent) -> (PositionTracker, IntentId) {
        let book = Arc::new(IntentBook::new());
        let id = intent.id;
        book.insert(intent);
        (PositionTracker::new(book), id)
    }

    #[tokio::test]
    async fn test_first_target_moves_rest_to_breakeven() {
        let (tracker, id) = tracker_with(open_intent(Direction::Long));
        let actions = tracker.on_tick("XAUUSD", &tick(dec!(3235.1)), Utc::now()).await;

        assert_eq!(
            actions[0],
            LifecycleAction::MoveStop {
                intent: id,
                leg: 2,
                ticket: Some(Ticket(2)),
                from: dec!(3220),
                to: dec!(3232)
            }
        );
        assert!(matches!(actions[1], LifecycleAction::BreakevenApplied { legs: 1, .. }));
        assert!(matches!(
            actions[2],
            LifecycleAction::CloseLeg { leg: 1, price, reason: CloseReason::Target, .. } if price == dec!(3235)
        ));
        assert_eq!(actions.len(), 3);

        let intent = tracker.book().get(id).unwrap().lock().await.clone();
        assert!(intent.breakeven_applied);
        assert_eq!(intent.leg(2).unwrap().stop, dec!(3232));
        assert_eq!(intent.modifications.len(), 1);
    }

    #[tokio::test]
    async fn test_breakeven_applied_once() {
        let (tracker, id) = tracker_with(open_intent(Direction::Long));
        tracker.on_tick("XAUUSD", &tick(dec!(3236)), Utc::now()).await;

        // price dips and crosses the first target again
        for bid in [dec!(3233), dec!(3236), dec!(3234), dec!(3235)] {
            let actions = tracker.on_tick("XAUUSD", &tick(bid), Utc::now()).await;
            assert!(actions.is_empty(), "unexpected actions at {}", bid);
        }
        let intent = tracker.book().get(id).unwrap().lock().await.clone();
        assert_eq!(intent.modifications.len(), 1);
    }

    #[tokio::test]
    async fn test_breakeven_stop_closes_remaining_leg_flat() {
        let (tracker, id) = tracker_with(open_intent(Direction::Long));
        tracker.on_tick("XAUUSD", &tick(dec!(3235)), Utc::now()).await;
        let actions = tracker.on_tick("XAUUSD", &tick(dec!(3231)), Utc::now()).await;

        assert!(matches!(
            actions[0],
            LifecycleAction::CloseLeg { leg: 2, price, reason: CloseReason::Stop, pnl, .. }
                if price == dec!(3232) && pnl.is_zero()
        ));
        assert_eq!(
            actions[1],
            LifecycleAction::IntentFinished {
                intent: id,
                net_pnl: dec!(3.12)
            }
        );
    }

    #[tokio::test]
    async fn test_gap_through_all_targets() {
        let (tracker, _) = tracker_with(open_intent(Direction::Long));
        let actions = tracker.on_tick("XAUUSD", &tick(dec!(3240)), Utc::now()).await;
        let closes = actions
            .iter()
            .filter(|a| matches!(a, LifecycleAction::CloseLeg { .. }))
            .count();
        assert_eq!(closes, 2);
        assert!(matches!(actions.last(), Some(LifecycleAction::IntentFinished { .. })));
    }

    #[tokio::test]
    async fn test_short_uses_ask() {
        let (tracker, _) = tracker_with(open_intent(Direction::Short));
        // bid at target but ask above it
        let actions = tracker
            .on_tick("XAUUSD", &Tick::new(dec!(3229), dec!(3229.3), Utc::now()), Utc::now())
            .await;
        assert!(actions.is_empty());
        let actions = tracker
            .on_tick("XAUUSD", &Tick::new(dec!(3228.7), dec!(3229), Utc::now()), Utc::now())
            .await;
        assert!(actions.iter().any(|a| matches!(a, LifecycleAction::CloseLeg { leg: 1, .. })));
    }

    #[tokio::test]
    async fn test_initial_stop_loss() {
        let (tracker, _) = tracker_with(open_intent(Direction::Long));
        let actions = tracker.on_tick("XAUUSD", &tick(dec!(3219)), Utc::now()).await;
        assert_eq!(actions.len(), 3);
        assert_eq!(
            actions[2],
            LifecycleAction::IntentFinished {
                intent: match &actions[0] {
                    LifecycleAction::CloseLeg { intent, .. } => *intent,
                    other => panic!("unexpected {:?}", other),
                },
                net_pnl: dec!(-24.96)
            }
        );
    }

    fn event(id: EventId, intent: IntentId, leg: u8, payload: EventPayload) -> ReplicationEvent {
        ReplicationEvent {
            id,
            intent_id: intent,
            leg: Some(leg),
            payload,
            emitted_at: Utc::now(),
        }
    }

    fn open_payload(target: Decimal) -> EventPayload {
        EventPayload::Open {
            symbol: "XAUUSD".to_string(),
            direction: Direction::Long,
            entry: dec!(3232),
            volume: dec!(1.04),
            stop: dec!(3220),
            target,
        }
    }

    #[tokio::test]
    async fn test_mirror_applies_events_verbatim() {
        let book = Arc::new(IntentBook::new());
        let tracker = PositionTracker::new(book.clone());
        let intent = IntentId::new();
        let now = Utc::now();

        let actions = tracker.apply_event(&event(1, intent, 1, open_payload(dec!(3235))), now).await.unwrap();
        assert!(matches!(actions[..], [MirrorAction::Open { leg: 1, .. }]));
        tracker.apply_event(&event(2, intent, 2, open_payload(dec!(3239))), now).await.unwrap();

        {
            let shared = book.get(intent).unwrap();
            let mut mirror = shared.lock().await;
            mirror.leg_mut(1).unwrap().mark_open(Ticket(11)).unwrap();
            mirror.leg_mut(2).unwrap().mark_open(Ticket(12)).unwrap();
        }

        let modify = EventPayload::ModifyStop {
            old_stop: dec!(3220),
            new_stop: dec!(3232),
        };
        let actions = tracker.apply_event(&event(3, intent, 2, modify), now).await.unwrap();
        assert_eq!(
            actions,
            vec![MirrorAction::ModifyStop {
                intent,
                leg: 2,
                ticket: Ticket(12),
                old_stop: dec!(3220),
                new_stop: dec!(3232)
            }]
        );

        let close = EventPayload::Close {
            price: dec!(3235),
            reason: CloseReason::Target,
        };
        let actions = tracker.apply_event(&event(4, intent, 1, close), now).await.unwrap();
        assert!(matches!(actions[..], [MirrorAction::Close { leg: 1, ticket: Ticket(11), .. }]));

        let mirror = book.get(intent).unwrap().lock().await.clone();
        assert!(mirror.breakeven_applied);
        assert_eq!(mirror.leg(2).unwrap().stop, dec!(3232));
        assert_eq!(mirror.leg(1).unwrap().status, LegStatus::Closed);
        assert_eq!(mirror.modifications[0].cause, StopChange::Replicated);
    }

    #[tokio::test]
    async fn test_mirror_unknown_intent() {
        let tracker = PositionTracker::new(Arc::new(IntentBook::new()));
        let missing = IntentId::new();
        let close = EventPayload::Close {
            price: dec!(3235),
            reason: CloseReason::Target,
        };
        assert_eq!(
            tracker.apply_event(&event(1, missing, 1, close), Utc::now()).await,
            Err(ReplicationError::UnknownIntent(missing))
        );
        let cancel = EventPayload::Cancel {
            reason: "venue refused".to_string(),
        };
        assert_eq!(
            tracker.apply_event(&event(2, missing, 1, cancel), Utc::now()).await,
            Ok(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_intent_cancel_closes_every_open_leg() {
        let (tracker, id) = tracker_with(open_intent(Direction::Long));
        let cancel = ReplicationEvent {
            id: 3,
            intent_id: id,
            leg: None,
            payload: EventPayload::Cancel {
                reason: "signal withdrawn".to_string(),
            },
            emitted_at: Utc::now(),
        };
        let actions = tracker.apply_event(&cancel, Utc::now()).await.unwrap();
        assert_eq!(
            actions,
            vec![
                MirrorAction::Close {
                    intent: id,
                    leg: 1,
                    ticket: Ticket(1)
                },
                MirrorAction::Close {
                    intent: id,
                    leg: 2,
                    ticket: Ticket(2)
                },
            ]
        );
        let intent = tracker.book().get(id).unwrap().lock().await.clone();
        assert_eq!(intent.status(), crate::models::IntentStatus::Cancelled);

        // redelivery finds nothing left to close
        assert!(tracker.apply_event(&cancel, Utc::now()).await.unwrap().is_empty());
    }
}
