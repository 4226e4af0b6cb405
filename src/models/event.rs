//! Replication events emitted by the primary.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Direction, IntentId};

/// Position in the replication log. Strictly increasing, starting at 1.
pub type EventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    ModifyStop,
    Close,
    Cancel,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::ModifyStop => "modify_stop",
            Self::Close => "close",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Target,
    Stop,
    /// Closed at the venue while the primary was not watching.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Open {
        symbol: String,
        direction: Direction,
        entry: Decimal,
        volume: Decimal,
        stop: Decimal,
        target: Decimal,
    },
    ModifyStop {
        old_stop: Decimal,
        new_stop: Decimal,
    },
    Close {
        price: Decimal,
        reason: CloseReason,
    },
    Cancel {
        reason: String,
    },
}

/// One entry of the append-only replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub id: EventId,
    pub intent_id: IntentId,
    /// `None` for intent-level events
    pub leg: Option<u8>,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl ReplicationEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Open { .. } => EventKind::Open,
            EventPayload::ModifyStop { .. } => EventKind::ModifyStop,
            EventPayload::Close { .. } => EventKind::Close,
            EventPayload::Cancel { .. } => EventKind::Cancel,
        }
    }
}

impl fmt::Display for ReplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leg = self.leg.map(|l| format!("leg {}", l)).unwrap_or_else(|| "intent".to_string());
        match &self.payload {
            EventPayload::Open { symbol, direction, volume, stop, target, .. } => write!(
                f,
                "#{} open {} {} {} {} vol={} sl={} tp={}",
                self.id, self.intent_id, leg, symbol, direction, volume, stop, target
            ),
            EventPayload::ModifyStop { old_stop, new_stop } => write!(
                f,
                "#{} modify_stop {} {} {} -> {}",
                self.id, self.intent_id, leg, old_stop, new_stop
            ),
            EventPayload::Close { price, reason } => write!(
                f,
                "#{} close {} {} @ {} ({:?})",
                self.id, self.intent_id, leg, price, reason
            ),
            EventPayload::Cancel { reason } => {
                write!(f, "#{} cancel {} {}: {}", self.id, self.intent_id, leg, reason)
            }
        }
    }
}
