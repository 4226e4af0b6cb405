//! Interpreter and validator configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Weights of the confidence score. The score is clamped to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    /// Multiplied by the fraction of expected fields present
    pub fields: f64,

    /// Bonus when the strict grammar pass produced the candidate
    pub grammar: f64,

    /// Bonus when the heuristic fallback produced the candidate
    pub heuristic: f64,

    /// Bonus when a risk percentage note was recognised
    pub risk_note: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            fields: 0.6,
            grammar: 0.3,
            heuristic: 0.15,
            risk_note: 0.1,
        }
    }
}

/// Configuration for turning messages into candidate signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Candidates scoring below this at completion are discarded
    pub confidence_floor: f64,

    pub weights: ConfidenceWeights,

    /// Seconds without a new edit before an actionable candidate completes
    pub quiet_window_secs: i64,

    /// Seconds after first receipt before an incomplete candidate goes stale
    pub max_signal_age_secs: i64,

    /// Accepted symbols. Empty accepts any ticker-shaped word.
    pub symbols: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            weights: ConfidenceWeights::default(),
            quiet_window_secs: 5,
            max_signal_age_secs: 300, // 5 minutes
            symbols: Vec::new(),
        }
    }
}

/// Configuration for candidate validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum age of a signal at validation time (seconds)
    pub freshness_secs: i64,

    /// Window in which a same-symbol signal counts as a duplicate (seconds)
    pub dedup_window_secs: i64,

    /// Entry prices closer than this are considered the same
    pub dedup_price_tolerance: Decimal,

    /// Bound on the tradability query (milliseconds)
    pub lookup_timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 300,              // 5 minutes
            dedup_window_secs: 1800,          // 30 minutes
            dedup_price_tolerance: dec!(0.5),
            lookup_timeout_ms: 5_000,
        }
    }
}
