//! Candidate and validated trade signals.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{MessageKey, SymbolSpec};
use crate::error::RejectionReason;

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Parse a direction word. Accepts the usual channel shorthands.
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "buy" | "long" | "b" => Some(Self::Long),
            "sell" | "short" | "s" => Some(Self::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// True when `price` is strictly on the profitable side of `reference`.
    pub fn is_beyond(&self, price: Decimal, reference: Decimal) -> bool {
        match self {
            Self::Long => price > reference,
            Self::Short => price < reference,
        }
    }

    /// True when `price` has reached `target` (inclusive).
    pub fn target_reached(&self, price: Decimal, target: Decimal) -> bool {
        match self {
            Self::Long => price >= target,
            Self::Short => price <= target,
        }
    }

    /// True when `price` has touched `stop` (inclusive).
    pub fn stop_hit(&self, price: Decimal, stop: Decimal) -> bool {
        match self {
            Self::Long => price <= stop,
            Self::Short => price >= stop,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a candidate inside the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Collecting,
    Complete,
    Stale,
}

impl MergeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Complete => "complete",
            Self::Stale => "stale",
        }
    }
}

/// Which extraction pass produced the fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsePass {
    Heuristic,
    Grammar,
}

/// A signal as understood so far from one message and its edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub source: MessageKey,
    pub edit_seq: u32,
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub entry: Option<Decimal>,
    pub stop: Option<Decimal>,
    /// Targets keyed by their 1-based index.
    pub targets: BTreeMap<u8, Decimal>,
    pub risk_note: Option<String>,
    /// Percentage from the risk note (`Max 0.25%` gives 0.25).
    pub risk_percent: Option<Decimal>,
    pub confidence: f64,
    pub pass: ParsePass,
    pub merge_state: MergeState,
    /// First receipt of the message.
    pub received_at: DateTime<Utc>,
    /// Receipt time of the most recent edit merged in.
    pub updated_at: DateTime<Utc>,
}

/// Number of fields counted towards confidence: symbol, direction, entry, stop, targets.
pub const EXPECTED_FIELDS: usize = 5;

impl CandidateSignal {
    pub fn new(source: MessageKey, edit_seq: u32, pass: ParsePass, received_at: DateTime<Utc>) -> Self {
        Self {
            source,
            edit_seq,
            symbol: None,
            direction: None,
            entry: None,
            stop: None,
            targets: BTreeMap::new(),
            risk_note: None,
            risk_percent: None,
            confidence: 0.0,
            pass,
            merge_state: MergeState::Collecting,
            received_at,
            updated_at: received_at,
        }
    }

    /// Symbol, direction and at least one target: enough to complete.
    pub fn is_actionable(&self) -> bool {
        self.symbol.is_some() && self.direction.is_some() && !self.targets.is_empty()
    }

    pub fn fields_present(&self) -> usize {
        [
            self.symbol.is_some(),
            self.direction.is_some(),
            self.entry.is_some(),
            self.stop.is_some(),
            !self.targets.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// Short human-readable form used in logs and the CLI.
    pub fn summary(&self) -> String {
        let fmt_price = |p: Option<Decimal>| p.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|(i, p)| format!("TP{}={}", i, p))
            .collect();
        format!(
            "{} {} entry={} sl={} [{}]",
            self.symbol.as_deref().unwrap_or("?"),
            self.direction.map(|d| d.as_str()).unwrap_or("?"),
            fmt_price(self.entry),
            fmt_price(self.stop),
            targets.join(" ")
        )
    }
}

/// Outcome of validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected { reason: RejectionReason },
}

/// A candidate frozen together with its validation verdict.
///
/// A re-edit of the source message yields a new `ValidatedSignal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedSignal {
    pub signal: CandidateSignal,
    pub verdict: Verdict,
    /// Instrument details captured while checking tradability.
    pub spec: Option<SymbolSpec>,
    pub validated_at: DateTime<Utc>,
}

impl ValidatedSignal {
    pub fn accepted(signal: CandidateSignal, spec: SymbolSpec, validated_at: DateTime<Utc>) -> Self {
        Self {
            signal,
            verdict: Verdict::Accepted,
            spec: Some(spec),
            validated_at,
        }
    }

    pub fn rejected(
        signal: CandidateSignal,
        reason: RejectionReason,
        spec: Option<SymbolSpec>,
        validated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signal,
            verdict: Verdict::Rejected { reason },
            spec,
            validated_at,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self.verdict, Verdict::Accepted)
    }

    pub fn rejection(&self) -> Option<&RejectionReason> {
        match &self.verdict {
            Verdict::Accepted => None,
            Verdict::Rejected { reason } => Some(reason),
        }
    }
}
