//! Trade intents and their legs.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Direction, MessageKey, Ticket};
use crate::error::LifecycleError;

/// Identifier of a trade intent, shared by primary and followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(pub Uuid);

impl IntentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Comment attached to the venue order of `leg`. Lets a fill be found
    /// again after its confirmation was lost.
    pub fn order_comment(&self, leg: u8) -> String {
        format!("{}/{}", self, leg)
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single leg. `Closed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl LegStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    pub fn can_transition(&self, to: LegStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Open)
                | (Self::Pending, Self::Cancelled)
                | (Self::Open, Self::Closed)
                | (Self::Open, Self::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One sub-order targeting a single take-profit level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    /// 1-based target index
    pub index: u8,
    pub target: Decimal,
    pub volume: Decimal,
    pub stop: Decimal,
    pub status: LegStatus,
    pub ticket: Option<Ticket>,
    pub close_price: Option<Decimal>,
}

impl Leg {
    pub fn new(index: u8, target: Decimal, volume: Decimal, stop: Decimal) -> Self {
        Self {
            index,
            target,
            volume,
            stop,
            status: LegStatus::Pending,
            ticket: None,
            close_price: None,
        }
    }

    pub fn transition(&mut self, to: LegStatus) -> Result<(), LifecycleError> {
        if !self.status.can_transition(to) {
            return Err(LifecycleError::InvalidTransition {
                leg: self.index,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_open(&mut self, ticket: Ticket) -> Result<(), LifecycleError> {
        self.transition(LegStatus::Open)?;
        self.ticket = Some(ticket);
        Ok(())
    }

    pub fn mark_closed(&mut self, price: Decimal) -> Result<(), LifecycleError> {
        self.transition(LegStatus::Closed)?;
        self.close_price = Some(price);
        Ok(())
    }

    /// Undo a close or cancel that the venue did not carry out.
    pub fn reopen(&mut self) -> Result<(), LifecycleError> {
        if self.ticket.is_none() || !self.status.is_terminal() {
            return Err(LifecycleError::InvalidTransition {
                leg: self.index,
                from: self.status,
                to: LegStatus::Open,
            });
        }
        self.status = LegStatus::Open;
        self.close_price = None;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status == LegStatus::Open
    }

    /// Move the stop towards the market only. Returns the previous stop when it moved.
    pub fn tighten_stop(&mut self, new_stop: Decimal, direction: Direction) -> Option<Decimal> {
        if !direction.is_beyond(new_stop, self.stop) {
            return None;
        }
        Some(std::mem::replace(&mut self.stop, new_stop))
    }

    /// Set the stop unconditionally, as instructed by an explicit event.
    pub fn set_stop(&mut self, new_stop: Decimal) -> Decimal {
        std::mem::replace(&mut self.stop, new_stop)
    }

    /// Realized P&L of a closed leg in account currency.
    pub fn realized_pnl(&self, entry: Decimal, direction: Direction, value_per_unit: Decimal) -> Decimal {
        match (self.status, self.close_price) {
            (LegStatus::Closed, Some(price)) => {
                (price - entry) * direction.sign() * self.volume * value_per_unit
            }
            _ => Decimal::ZERO,
        }
    }
}

/// Aggregate status derived from the legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    PartiallyOpen,
    Open,
    Closed,
    Cancelled,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PartiallyOpen => "partially_open",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Why a stop moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopChange {
    Breakeven,
    Replicated,
}

/// Entry in an intent's stop modification history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopModification {
    pub leg: u8,
    pub from: Decimal,
    pub to: Decimal,
    pub cause: StopChange,
    pub at: DateTime<Utc>,
}

/// A trade derived from one validated signal, split into legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: IntentId,
    pub source: Option<MessageKey>,
    pub symbol: String,
    pub direction: Direction,
    pub entry: Decimal,
    /// Shared initial stop of every leg
    pub stop: Decimal,
    pub risk_fraction: Decimal,
    /// Volume computed at approval; legs never allocate more.
    pub total_volume: Decimal,
    pub value_per_unit_move: Decimal,
    pub legs: Vec<Leg>,
    pub breakeven_applied: bool,
    pub modifications: Vec<StopModification>,
    pub created_at: DateTime<Utc>,
}

impl TradeIntent {
    pub fn status(&self) -> IntentStatus {
        let total = self.legs.len();
        let count = |s: LegStatus| self.legs.iter().filter(|l| l.status == s).count();
        let (pending, open, closed, cancelled) = (
            count(LegStatus::Pending),
            count(LegStatus::Open),
            count(LegStatus::Closed),
            count(LegStatus::Cancelled),
        );

        if total == 0 || pending == total {
            IntentStatus::Pending
        } else if closed + cancelled == total {
            if closed > 0 {
                IntentStatus::Closed
            } else {
                IntentStatus::Cancelled
            }
        } else if open > 0 && pending == 0 && cancelled == 0 {
            IntentStatus::Open
        } else {
            IntentStatus::PartiallyOpen
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.legs.is_empty() && self.legs.iter().all(|l| l.status.is_terminal())
    }

    pub fn leg(&self, index: u8) -> Option<&Leg> {
        self.legs.iter().find(|l| l.index == index)
    }

    pub fn leg_mut(&mut self, index: u8) -> Option<&mut Leg> {
        self.legs.iter_mut().find(|l| l.index == index)
    }

    pub fn allocated_volume(&self) -> Decimal {
        self.legs.iter().map(|l| l.volume).sum()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| l.realized_pnl(self.entry, self.direction, self.value_per_unit_move))
            .sum()
    }

    /// Lowest-index leg that is still open.
    pub fn first_open_leg(&self) -> Option<&Leg> {
        self.legs.iter().filter(|l| l.is_open()).min_by_key(|l| l.index)
    }
}
