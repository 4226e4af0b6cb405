//! Append-only replication log with per-follower offsets.
//!
//! Event ids start at 1 and are contiguous, so an id is also its position in
//! the log. Every event is persisted before it becomes visible to followers.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::ReplicationConfig;
use crate::db::Repository;
use crate::error::ReplicationError;
use crate::models::{EventId, EventPayload, IntentId, ReplicationEvent};

/// Read access to the log, as used by a follower that fell behind.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn events_after(
        &self,
        after: EventId,
        limit: usize,
    ) -> Result<Vec<ReplicationEvent>, ReplicationError>;
}

/// A follower whose oldest unacknowledged event has waited past the ack timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowerLag {
    pub follower: String,
    pub acked: EventId,
    pub head: EventId,
    pub waiting_secs: i64,
}

pub struct ReplicationBus {
    config: ReplicationConfig,
    log: RwLock<Vec<ReplicationEvent>>,
    /// Serializes id assignment and persistence
    publish_lock: Mutex<()>,
    head_tx: watch::Sender<EventId>,
    offsets: DashMap<String, EventId>,
    repo: Arc<dyn Repository>,
}

impl ReplicationBus {
    pub fn new(config: ReplicationConfig, repo: Arc<dyn Repository>) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            config,
            log: RwLock::new(Vec::new()),
            publish_lock: Mutex::new(()),
            head_tx,
            offsets: DashMap::new(),
            repo,
        }
    }

    /// Rebuild the log and offsets from the repository.
    pub async fn restore(config: ReplicationConfig, repo: Arc<dyn Repository>) -> Result<Self> {
        let events = repo.load_events().await.context("Failed to load replication log")?;
        for (position, event) in events.iter().enumerate() {
            let expected = position as EventId + 1;
            if event.id != expected {
                anyhow::bail!("Replication log is not contiguous: expected {}, found {}", expected, event.id);
            }
        }
        let offsets = repo.load_offsets().await.context("Failed to load follower offsets")?;

        let bus = Self::new(config, repo);
        let head = events.len() as EventId;
        *bus.log.write() = events;
        bus.head_tx.send_replace(head);
        for (follower, acked) in offsets {
            bus.offsets.insert(follower, acked.min(head));
        }
        info!(head, followers = bus.offsets.len(), "Replication log restored");
        Ok(bus)
    }

    /// Append an event. It is persisted first; on failure nothing is appended.
    pub async fn publish(
        &self,
        intent_id: IntentId,
        leg: Option<u8>,
        payload: EventPayload,
        now: DateTime<Utc>,
    ) -> Result<ReplicationEvent> {
        let _guard = self.publish_lock.lock().await;
        let event = ReplicationEvent {
            id: self.head() + 1,
            intent_id,
            leg,
            payload,
            emitted_at: now,
        };
        self.repo.record_event(&event).await?;

        self.log.write().push(event.clone());
        self.head_tx.send_replace(event.id);
        debug!(event = %event, "Published");
        Ok(event)
    }

    pub fn head(&self) -> EventId {
        *self.head_tx.borrow()
    }

    /// Up to `limit` events with ids greater than `after`.
    pub fn read_after(&self, after: EventId, limit: usize) -> Vec<ReplicationEvent> {
        let log = self.log.read();
        let start = (after as usize).min(log.len());
        log[start..].iter().take(limit).cloned().collect()
    }

    /// The whole log.
    pub fn events(&self) -> Vec<ReplicationEvent> {
        self.log.read().clone()
    }

    /// Make a follower known with offset 0 unless it already has one.
    pub fn register(&self, follower: &str) {
        self.offsets.entry(follower.to_string()).or_insert(0);
    }

    /// Record that `follower` has applied everything up to `id`.
    pub async fn ack(&self, follower: &str, id: EventId) -> Result<()> {
        let id = id.min(self.head());
        let advanced = {
            let mut offset = self.offsets.entry(follower.to_string()).or_insert(0);
            if id > *offset {
                *offset = id;
                true
            } else {
                false
            }
        };
        if advanced {
            self.repo.record_offset(follower, id).await?;
            debug!(follower, acked = id, "Offset advanced");
        }
        Ok(())
    }

    pub fn acked(&self, follower: &str) -> EventId {
        self.offsets.get(follower).map(|o| *o).unwrap_or(0)
    }

    pub fn offsets(&self) -> Vec<(String, EventId)> {
        let mut offsets: Vec<_> = self
            .offsets
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        offsets.sort();
        offsets
    }

    /// Followers whose next event has waited longer than the ack timeout.
    pub fn lagging(&self, now: DateTime<Utc>) -> Vec<FollowerLag> {
        let timeout = Duration::seconds(self.config.ack_timeout_secs);
        let head = self.head();
        let log = self.log.read();
        let mut lagging = Vec::new();
        for (follower, acked) in self.offsets() {
            let Some(oldest) = log.get(acked as usize) else {
                continue;
            };
            let waiting = now - oldest.emitted_at;
            if waiting > timeout {
                lagging.push(FollowerLag {
                    follower,
                    acked,
                    head,
                    waiting_secs: waiting.num_seconds(),
                });
            }
        }
        lagging
    }

    /// Start delivering to `follower` from its last acknowledged offset.
    pub fn subscribe(self: &Arc<Self>, follower: &str) -> Subscription {
        self.register(follower);
        let cursor = self.acked(follower);
        info!(follower, from = cursor, head = self.head(), "Follower subscribed");
        Subscription {
            bus: Arc::clone(self),
            follower: follower.to_string(),
            cursor,
            head_rx: self.head_tx.subscribe(),
        }
    }
}

#[async_trait]
impl EventSource for ReplicationBus {
    async fn events_after(
        &self,
        after: EventId,
        limit: usize,
    ) -> Result<Vec<ReplicationEvent>, ReplicationError> {
        Ok(self.read_after(after, limit))
    }
}

/// Long-lived delivery cursor for one follower.
pub struct Subscription {
    bus: Arc<ReplicationBus>,
    follower: String,
    cursor: EventId,
    head_rx: watch::Receiver<EventId>,
}

impl Subscription {
    /// Id of the last event handed out.
    #[cfg(test)]
    pub fn cursor(&self) -> EventId {
        self.cursor
    }

    /// Re-deliver everything after `after`.
    pub fn rewind(&mut self, after: EventId) {
        if after < self.cursor {
            warn!(follower = %self.follower, from = self.cursor, to = after, "Rewinding subscription");
            self.cursor = after;
        }
    }

    /// Next batch of events, waiting for one to be published if necessary.
    ///
    /// Returns `None` once `shutdown` flips to true or the bus goes away.
    pub async fn next_batch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<Vec<ReplicationEvent>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            self.head_rx.borrow_and_update();
            let batch = self.bus.read_after(self.cursor, self.bus.config.resync_batch);
            if let Some(last) = batch.last() {
                self.cursor = last.id;
                return Some(batch);
            }

            tokio::select! {
                changed = self.head_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
