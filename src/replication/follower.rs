//! Follower side of replication.
//!
//! Events are applied strictly in id order. Anything at or below the last
//! applied id is a redelivery and is dropped; anything further ahead is held
//! back until the gap before it is filled.
//!
//! When this terminal refuses a replicated stop move or close, the local leg
//! is rolled back to what the venue still holds and the refusal is notified.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use super::bus::EventSource;
use super::FollowerConfig;
use crate::api::{place_order, ExecutionVenue, Notification, NotificationSink, OrderRequest, RetryPolicy};
use crate::db::Repository;
use crate::error::{ReplicationError, VenueError};
use crate::models::{EventId, IntentId, LegStatus, ReplicationEvent, TradeIntent};
use crate::trading::{IntentBook, MirrorAction, PositionTracker};

#[derive(Debug, Clone, Default)]
pub struct FollowerStats {
    pub applied: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub resyncs: u64,
    pub legs_opened: u64,
    pub legs_skipped: u64,
}

impl fmt::Display for FollowerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Events applied: {}", self.applied)?;
        writeln!(f, "Duplicates dropped: {}", self.duplicates)?;
        writeln!(f, "Gaps detected: {}", self.gaps)?;
        writeln!(f, "Resyncs: {}", self.resyncs)?;
        writeln!(f, "Legs opened: {}", self.legs_opened)?;
        write!(f, "Legs skipped: {}", self.legs_skipped)
    }
}

pub struct Follower {
    id: String,
    multiplier: Decimal,
    venue: Arc<dyn ExecutionVenue>,
    tracker: PositionTracker,
    retry: RetryPolicy,
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn NotificationSink>,
    resync_batch: usize,
    last_applied: EventId,
    pending: BTreeMap<EventId, ReplicationEvent>,
    stats: FollowerStats,
}

impl Follower {
    pub fn new(
        config: &FollowerConfig,
        venue: Arc<dyn ExecutionVenue>,
        retry: RetryPolicy,
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn NotificationSink>,
        resync_batch: usize,
    ) -> Self {
        Self {
            id: config.id.clone(),
            multiplier: config.volume_multiplier,
            venue,
            tracker: PositionTracker::new(Arc::new(IntentBook::new())),
            retry,
            repo,
            notifier,
            resync_batch: resync_batch.max(1),
            last_applied: 0,
            pending: BTreeMap::new(),
            stats: FollowerStats::default(),
        }
    }

    /// Resume from a persisted offset and mirror book.
    pub fn restore(mut self, last_applied: EventId, intents: Vec<TradeIntent>) -> Self {
        self.last_applied = last_applied;
        let mut live = 0;
        for intent in intents.into_iter().filter(|i| !i.is_finished()) {
            self.tracker.book().insert(intent);
            live += 1;
        }
        info!(follower = %self.id, last_applied, live, "Follower restored");
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_applied(&self) -> EventId {
        self.last_applied
    }

    pub fn book(&self) -> &Arc<IntentBook> {
        self.tracker.book()
    }

    pub fn stats(&self) -> &FollowerStats {
        &self.stats
    }

    /// Accept a batch, in whatever order it arrived.
    ///
    /// Returns [`ReplicationError::Gap`] while events are held back waiting
    /// for a missing id; the caller should then resync.
    pub async fn receive_batch(
        &mut self,
        events: Vec<ReplicationEvent>,
        now: DateTime<Utc>,
    ) -> Result<(), ReplicationError> {
        for event in events {
            self.buffer(event);
        }
        self.drain(now).await;
        self.check_gap()
    }

    /// Pull everything after the last applied id from `source`.
    ///
    /// Returns the number of events applied.
    pub async fn resync(&mut self, source: &dyn EventSource, now: DateTime<Utc>) -> Result<u64, ReplicationError> {
        self.stats.resyncs += 1;
        let before = self.stats.applied;
        info!(follower = %self.id, from = self.last_applied, "Resynchronizing");
        loop {
            let batch = source.events_after(self.last_applied, self.resync_batch).await?;
            if batch.is_empty() {
                break;
            }
            let progress = self.last_applied;
            for event in batch {
                self.buffer(event);
            }
            self.drain(now).await;
            if self.last_applied == progress {
                break;
            }
        }
        let applied = self.stats.applied - before;
        info!(follower = %self.id, applied, last_applied = self.last_applied, "Resync finished");
        self.check_gap().map(|_| applied)
    }

    fn buffer(&mut self, event: ReplicationEvent) {
        if event.id <= self.last_applied || self.pending.contains_key(&event.id) {
            self.stats.duplicates += 1;
            debug!(follower = %self.id, event = event.id, "Duplicate dropped");
            return;
        }
        self.pending.insert(event.id, event);
    }

    async fn drain(&mut self, now: DateTime<Utc>) {
        while let Some(event) = self.pending.remove(&(self.last_applied + 1)) {
            self.apply(&event, now).await;
            self.last_applied = event.id;
            self.stats.applied += 1;
        }
    }

    fn check_gap(&mut self) -> Result<(), ReplicationError> {
        match self.pending.keys().next() {
            Some(&received) => {
                self.stats.gaps += 1;
                let expected = self.last_applied + 1;
                warn!(follower = %self.id, expected, received, "Gap in replication log");
                Err(ReplicationError::Gap { expected, received })
            }
            None => Ok(()),
        }
    }

    async fn apply(&mut self, event: &ReplicationEvent, now: DateTime<Utc>) {
        debug!(follower = %self.id, event = %event, "Applying");
        let outcome = self.tracker.apply_event(event, now).await;
        match outcome {
            Ok(actions) => {
                for action in actions {
                    self.execute(action).await;
                }
            }
            Err(e) => warn!(follower = %self.id, event = event.id, error = %e, "Event does not match local state"),
        }

        let Some(shared) = self.book().get(event.intent_id) else {
            return;
        };
        let snapshot = shared.lock().await.clone();
        if let Err(e) = self.repo.record_intent(&self.id, &snapshot).await {
            warn!(follower = %self.id, intent = %snapshot.id, error = %e, "Failed to persist mirror intent");
        }
        if snapshot.is_finished() {
            self.book().retire(snapshot.id);
        }
    }

    async fn execute(&mut self, action: MirrorAction) {
        match action {
            MirrorAction::Open {
                intent,
                leg,
                symbol,
                direction,
                entry,
                volume,
                stop,
                target,
            } => {
                let spec = self
                    .retry
                    .run("symbol_spec", || self.venue.symbol_spec(&symbol))
                    .await;
                let spec = match spec {
                    Ok(spec) => spec,
                    Err(e) => return self.skip_leg(intent, leg, e.to_string()).await,
                };
                let scaled = spec
                    .floor_to_step(volume * self.multiplier)
                    .min(spec.floor_to_step(spec.max_volume));
                if scaled < spec.min_volume || scaled <= Decimal::ZERO {
                    let reason = format!("scaled volume {} below minimum {}", scaled, spec.min_volume);
                    return self.skip_leg(intent, leg, reason).await;
                }
                self.set_leg_volume(intent, leg, volume, scaled).await;

                let order = OrderRequest {
                    symbol,
                    direction,
                    volume: scaled,
                    stop,
                    target,
                    entry,
                    comment: intent.order_comment(leg),
                };
                let submitted = place_order(self.venue.as_ref(), &self.retry, &order).await;
                match submitted {
                    Ok(ticket) => {
                        if let Some(shared) = self.book().get(intent) {
                            let mut state = shared.lock().await;
                            if let Some(l) = state.leg_mut(leg) {
                                let _ = l.mark_open(ticket);
                            }
                        }
                        self.stats.legs_opened += 1;
                        info!(follower = %self.id, intent = %intent, leg, ticket = %ticket, volume = %scaled, "Mirror leg opened");
                    }
                    Err(e) => self.skip_leg(intent, leg, e.to_string()).await,
                }
            }
            MirrorAction::ModifyStop {
                intent,
                leg,
                ticket,
                old_stop,
                new_stop,
            } => {
                let result = self
                    .retry
                    .run("modify_stop", || self.venue.modify_stop(ticket, new_stop))
                    .await;
                if let Err(e) = result {
                    error!(follower = %self.id, intent = %intent, leg, error = %e, "Mirror stop modification failed");
                    if let Some(shared) = self.book().get(intent) {
                        let mut state = shared.lock().await;
                        if let Some(l) = state.leg_mut(leg).filter(|l| l.stop == new_stop) {
                            l.set_stop(old_stop);
                        }
                    }
                    self.report_failure(intent, leg, format!("stop modification failed: {}", e))
                        .await;
                }
            }
            MirrorAction::Close { intent, leg, ticket } => {
                let result = self
                    .retry
                    .run("close_position", || self.venue.close_position(ticket))
                    .await;
                match result {
                    Ok(()) | Err(VenueError::PositionNotFound(_)) => {
                        debug!(follower = %self.id, intent = %intent, leg, "Mirror leg closed");
                    }
                    Err(e) => {
                        error!(follower = %self.id, intent = %intent, leg, error = %e, "Mirror close failed, leg stays open");
                        if let Some(shared) = self.book().get(intent) {
                            let mut state = shared.lock().await;
                            if let Some(Err(e)) = state.leg_mut(leg).map(|l| l.reopen()) {
                                warn!(follower = %self.id, intent = %intent, leg, error = %e, "Could not reopen mirror leg");
                            }
                        }
                        self.report_failure(intent, leg, format!("close failed: {}", e)).await;
                    }
                }
            }
        }
    }

    async fn report_failure(&self, intent: IntentId, leg: u8, reason: String) {
        self.notifier
            .notify(&Notification::LegFailed {
                intent,
                leg,
                reason: format!("{}: {}", self.id, reason),
            })
            .await;
    }

    async fn set_leg_volume(&self, intent: IntentId, leg: u8, replicated: Decimal, scaled: Decimal) {
        if let Some(shared) = self.book().get(intent) {
            let mut state = shared.lock().await;
            if let Some(l) = state.leg_mut(leg) {
                l.volume = scaled;
            }
            state.total_volume += scaled - replicated;
        }
    }

    /// Cancel a leg locally when this terminal cannot carry it.
    async fn skip_leg(&mut self, intent: IntentId, leg: u8, reason: String) {
        if let Some(shared) = self.book().get(intent) {
            let mut state = shared.lock().await;
            if let Some(l) = state.leg_mut(leg) {
                if l.status == LegStatus::Pending {
                    let _ = l.transition(LegStatus::Cancelled);
                }
            }
        }
        self.stats.legs_skipped += 1;
        warn!(follower = %self.id, intent = %intent, leg, reason = %reason, "Mirror leg skipped");
        self.notifier
            .notify(&Notification::FollowerLegCancelled {
                follower: self.id.clone(),
                intent,
                leg,
                reason,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperVenue, RecordingNotifier};
    use crate::db::MemoryRepository;
    use crate::models::{CloseReason, Direction, EventPayload, SymbolSpec, Tick};
    use crate::replication::{ReplicationBus, ReplicationConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;

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

    fn follower(multiplier: Decimal) -> (Follower, Arc<PaperVenue>, Arc<RecordingNotifier>) {
        let venue = Arc::new(PaperVenue::new("follower", vec![gold()]));
        venue.set_tick("XAUUSD", Tick::new(dec!(3232.3), dec!(3232.5), Utc::now()));
        let notifier = Arc::new(RecordingNotifier::default());
        let retry = RetryPolicy {
            call_timeout: Duration::from_secs(1),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let config = FollowerConfig {
            id: "f1".to_string(),
            volume_multiplier: multiplier,
        };
        let follower = Follower::new(
            &config,
            venue.clone(),
            retry,
            Arc::new(MemoryRepository::new()),
            notifier.clone(),
            100,
        );
        (follower, venue, notifier)
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

    fn open(target: Decimal) -> EventPayload {
        EventPayload::Open {
            symbol: "XAUUSD".to_string(),
            direction: Direction::Long,
            entry: dec!(3232),
            volume: dec!(1.04),
            stop: dec!(3220),
            target,
        }
    }

    /// The breakeven scenario as the primary publishes it.
    fn scenario(intent: IntentId) -> Vec<ReplicationEvent> {
        vec![
            event(1, intent, 1, open(dec!(3235))),
            event(2, intent, 2, open(dec!(3239))),
            event(
                3,
                intent,
                2,
                EventPayload::ModifyStop {
                    old_stop: dec!(3220),
                    new_stop: dec!(3232),
                },
            ),
            event(
                4,
                intent,
                1,
                EventPayload::Close {
                    price: dec!(3235),
                    reason: CloseReason::Target,
                },
            ),
        ]
    }

    async fn final_state(follower: &Follower, intent: IntentId) -> TradeIntent {
        follower.book().get(intent).unwrap().lock().await.clone()
    }

    #[tokio::test]
    async fn test_in_order_apply_mirrors_breakeven() {
        let (mut f, venue, _) = follower(Decimal::ONE);
        let intent = IntentId::new();
        f.receive_batch(scenario(intent), Utc::now()).await.unwrap();

        let state = final_state(&f, intent).await;
        assert_eq!(state.leg(1).unwrap().status, LegStatus::Closed);
        assert_eq!(state.leg(2).unwrap().status, LegStatus::Open);
        assert_eq!(state.leg(2).unwrap().stop, dec!(3232));
        assert!(state.breakeven_applied);

        let positions = venue.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].stop, dec!(3232));
        assert_eq!(f.last_applied(), 4);
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_reaches_same_state() {
        let (mut ordered, _, _) = follower(Decimal::ONE);
        let (mut shuffled, _, _) = follower(Decimal::ONE);
        let intent = IntentId::new();
        let events = scenario(intent);
        ordered.receive_batch(events.clone(), Utc::now()).await.unwrap();

        let now = Utc::now();
        let gap = shuffled.receive_batch(vec![events[2].clone()], now).await;
        assert_eq!(gap, Err(ReplicationError::Gap { expected: 1, received: 3 }));
        assert!(shuffled.receive_batch(vec![events[3].clone()], now).await.is_err());
        assert!(shuffled.receive_batch(vec![events[0].clone()], now).await.is_err());
        assert_eq!(shuffled.pending.len(), 2);
        shuffled.receive_batch(vec![events[1].clone()], now).await.unwrap();

        let a = final_state(&ordered, intent).await;
        let b = final_state(&shuffled, intent).await;
        let statuses = |i: &TradeIntent| i.legs.iter().map(|l| (l.status, l.stop)).collect::<Vec<_>>();
        assert_eq!(statuses(&a), statuses(&b));
        assert!(shuffled.pending.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let (mut f, venue, _) = follower(Decimal::ONE);
        let intent = IntentId::new();
        let events = scenario(intent);
        f.receive_batch(events[..2].to_vec(), Utc::now()).await.unwrap();
        f.receive_batch(events[..2].to_vec(), Utc::now()).await.unwrap();

        assert_eq!(venue.submit_calls(), 2);
        assert_eq!(f.stats().duplicates, 2);
        assert_eq!(f.stats().applied, 2);
    }

    #[tokio::test]
    async fn test_volume_multiplier_and_minimum() {
        let (mut f, venue, notifier) = follower(dec!(0.5));
        let intent = IntentId::new();
        f.receive_batch(vec![event(1, intent, 1, open(dec!(3235)))], Utc::now()).await.unwrap();
        assert_eq!(venue.positions()[0].volume, dec!(0.52));
        assert_eq!(final_state(&f, intent).await.leg(1).unwrap().volume, dec!(0.52));

        let (mut tiny, venue, notifier_tiny) = follower(dec!(0.005));
        tiny.receive_batch(vec![event(1, intent, 1, open(dec!(3235)))], Utc::now()).await.unwrap();
        assert!(venue.positions().is_empty());
        assert!(matches!(
            notifier_tiny.take()[0],
            Notification::FollowerLegCancelled { leg: 1, .. }
        ));
        assert!(notifier.take().is_empty());
        // the only leg is cancelled, so the mirror intent is done
        assert!(tiny.book().get(intent).is_none());
    }

    #[tokio::test]
    async fn test_resync_fills_gap_from_log() {
        let repo = Arc::new(MemoryRepository::new());
        let bus = ReplicationBus::new(ReplicationConfig::default(), repo);
        let intent = IntentId::new();
        for e in scenario(intent) {
            bus.publish(e.intent_id, e.leg, e.payload, e.emitted_at).await.unwrap();
        }

        let (mut f, venue, _) = follower(Decimal::ONE);
        let events = bus.events();
        assert!(f.receive_batch(vec![events[3].clone()], Utc::now()).await.is_err());

        let applied = f.resync(&bus, Utc::now()).await.unwrap();
        assert_eq!(applied, 4);
        assert_eq!(f.last_applied(), 4);
        assert_eq!(venue.positions()[0].stop, dec!(3232));
    }

    #[tokio::test]
    async fn test_intent_cancel_closes_all_mirror_legs() {
        let (mut f, venue, _) = follower(Decimal::ONE);
        let intent = IntentId::new();
        let mut events = scenario(intent)[..2].to_vec();
        events.push(ReplicationEvent {
            id: 3,
            intent_id: intent,
            leg: None,
            payload: EventPayload::Cancel {
                reason: "signal withdrawn".to_string(),
            },
            emitted_at: Utc::now(),
        });
        f.receive_batch(events, Utc::now()).await.unwrap();

        assert!(venue.positions().is_empty());
        assert!(f.book().get(intent).is_none());
    }

    #[tokio::test]
    async fn test_refused_stop_move_is_rolled_back_and_reported() {
        let (mut f, venue, notifier) = follower(Decimal::ONE);
        let intent = IntentId::new();
        let events = scenario(intent);
        f.receive_batch(events[..2].to_vec(), Utc::now()).await.unwrap();

        venue.inject_fault(VenueError::Rejected("frozen".to_string()));
        f.receive_batch(vec![events[2].clone()], Utc::now()).await.unwrap();

        let state = final_state(&f, intent).await;
        assert_eq!(state.leg(2).unwrap().stop, dec!(3220));
        assert_eq!(venue.positions()[1].stop, dec!(3220));
        assert!(notifier.take().iter().any(|n| matches!(
            n,
            Notification::LegFailed { leg: 2, reason, .. } if reason.starts_with("f1: stop modification failed")
        )));
        assert_eq!(f.last_applied(), 3);
    }

    #[tokio::test]
    async fn test_refused_close_keeps_mirror_leg_open() {
        let (mut f, venue, notifier) = follower(Decimal::ONE);
        let intent = IntentId::new();
        let events = scenario(intent);
        f.receive_batch(events[..3].to_vec(), Utc::now()).await.unwrap();

        venue.inject_fault(VenueError::Rejected("trade context busy".to_string()));
        f.receive_batch(vec![events[3].clone()], Utc::now()).await.unwrap();

        let state = final_state(&f, intent).await;
        assert!(state.leg(1).unwrap().is_open());
        assert_eq!(venue.positions().len(), 2);
        assert!(notifier.take().iter().any(|n| matches!(
            n,
            Notification::LegFailed { leg: 1, reason, .. } if reason.contains("close failed")
        )));
    }
}
