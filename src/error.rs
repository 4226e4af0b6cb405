use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Direction, EventId, IntentId, LegStatus, MessageKey, Ticket};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Whether a failed venue call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

/// Failures reported by an execution venue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VenueError {
    #[error("request timed out")]
    Timeout,

    #[error("requote: {0}")]
    Requote(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("market closed for {0}")]
    MarketClosed(String),

    #[error("insufficient margin")]
    InsufficientMargin,

    #[error("invalid volume {volume}: {reason}")]
    InvalidVolume { volume: Decimal, reason: String },

    #[error("position {0} not found")]
    PositionNotFound(Ticket),

    #[error("order rejected: {0}")]
    Rejected(String),
}

impl VenueError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout | Self::Requote(_) | Self::Connection(_) => FailureClass::Transient,
            Self::InvalidSymbol(_)
            | Self::MarketClosed(_)
            | Self::InsufficientMargin
            | Self::InvalidVolume { .. }
            | Self::PositionNotFound(_)
            | Self::Rejected(_) => FailureClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Why the validator refused a candidate. One variant per check.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("symbol not tradable: {symbol} ({detail})")]
    SymbolNotTradable { symbol: String, detail: String },

    #[error("price relationship invalid for {direction}: {detail}")]
    PriceRelationship { direction: Direction, detail: String },

    #[error("signal too old: {age_secs}s exceeds {max_secs}s")]
    TooOld { age_secs: i64, max_secs: i64 },

    #[error("duplicate of {original}: {symbol} {direction} @ {entry}")]
    Duplicate {
        original: MessageKey,
        symbol: String,
        direction: Direction,
        entry: Decimal,
    },
}

/// Why the risk gate refused an accepted signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    #[error("signal was not accepted by validation")]
    NotValidated,

    #[error("news blackout active for {symbol}")]
    NewsBlackout { symbol: String },

    #[error("daily loss cap reached: {realized} >= {cap}")]
    DailyLossCap { realized: Decimal, cap: Decimal },

    #[error("cooldown after {losses} consecutive losses (until {until:?})")]
    Cooldown {
        losses: u32,
        until: Option<DateTime<Utc>>,
    },

    #[error("max concurrent trades reached: {open} >= {max}")]
    MaxConcurrentTrades { open: usize, max: usize },

    #[error("account equity not positive: {0}")]
    NoEquity(Decimal),

    #[error("no instrument specification for {0}")]
    MissingSpec(String),

    #[error("entry and stop are required for sizing")]
    MissingPrices,

    #[error("stop distance is zero")]
    ZeroStopDistance,

    #[error("risk budget buys {volume}, below the minimum volume {min}")]
    VolumeBelowMinimum { volume: Decimal, min: Decimal },
}

/// Replication protocol failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("gap in replication log: expected {expected}, received {received}")]
    Gap { expected: EventId, received: EventId },

    #[error("unknown intent {0}")]
    UnknownIntent(IntentId),

    #[error("unknown leg {leg} of intent {intent}")]
    UnknownLeg { intent: IntentId, leg: u8 },
}

/// Illegal leg state changes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("leg {leg}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        leg: u8,
        from: LegStatus,
        to: LegStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_failure_classes() {
        assert_eq!(VenueError::Timeout.class(), FailureClass::Transient);
        assert_eq!(VenueError::Requote("moved".into()).class(), FailureClass::Transient);
        assert_eq!(VenueError::MarketClosed("XAUUSD".into()).class(), FailureClass::Fatal);
        assert_eq!(
            VenueError::InvalidVolume {
                volume: dec!(0.015),
                reason: "step".into()
            }
            .class(),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_rejection_reason_serializes_tagged() {
        let reason = RejectionReason::TooOld {
            age_secs: 400,
            max_secs: 300,
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains(r#""reason":"too_old""#));
        assert_eq!(reason.to_string(), "signal too old: 400s exceeds 300s");
    }
}
