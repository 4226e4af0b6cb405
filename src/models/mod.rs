//! Data models for messages, signals, trade intents, replication events and risk state.

mod event;
mod instrument;
mod intent;
mod message;
mod risk;
mod signal;

pub use event::{CloseReason, EventId, EventKind, EventPayload, ReplicationEvent};
pub use instrument::{SymbolSpec, Tick, Ticket};
pub use intent::{IntentId, IntentStatus, Leg, LegStatus, StopChange, StopModification, TradeIntent};
pub use message::{MessageKey, RawMessage};
pub use risk::{AccountState, DailyRiskState};
pub use signal::{
    CandidateSignal, Direction, MergeState, ParsePass, ValidatedSignal, Verdict, EXPECTED_FIELDS,
};
