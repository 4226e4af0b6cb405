//! Risk and execution configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for sizing and admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade when the signal carries no risk note
    pub default_risk_fraction: Decimal,

    /// Upper bound on the fraction a risk note may ask for
    pub max_risk_fraction: Decimal,

    /// Daily realized loss cap as a fraction of equity
    pub max_daily_loss_fraction: Decimal,

    /// Losing intents in a row that trigger a cooldown
    pub consecutive_loss_limit: u32,

    /// Cooldown length after the loss streak (seconds)
    pub cooldown_secs: i64,

    /// Maximum number of live trade intents
    pub max_concurrent_trades: usize,

    /// Blackout before a high-impact event (seconds)
    pub blackout_pre_secs: i64,

    /// Blackout after a high-impact event (seconds)
    pub blackout_post_secs: i64,

    /// Equity used when no account provider is available
    pub fallback_equity: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_risk_fraction: dec!(0.0025),   // 0.25% per trade
            max_risk_fraction: dec!(0.01),         // never more than 1%
            max_daily_loss_fraction: dec!(0.02),   // stop at 2% daily loss
            consecutive_loss_limit: 2,
            cooldown_secs: 3600,                   // 1 hour
            max_concurrent_trades: 5,
            blackout_pre_secs: 1800,               // 30 minutes
            blackout_post_secs: 1800,
            fallback_equity: dec!(10000),
        }
    }
}

/// Configuration for venue calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Bounded wait per venue call before it counts as a timeout (milliseconds)
    pub call_timeout_ms: u64,

    /// Attempts per call, including the first
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Price polling interval for open intents (milliseconds)
    pub tick_poll_ms: u64,

    /// Interval between interpreter sweeps (milliseconds)
    pub sweep_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            tick_poll_ms: 1_000,
            sweep_interval_ms: 500,
        }
    }
}
