//! Top-level settings, loaded from an optional TOML file.

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::SymbolSpec;
use crate::replication::{FollowerConfig, ReplicationConfig};
use crate::signal::{InterpreterConfig, ValidatorConfig};
use crate::trading::{ExecutionConfig, RiskConfig};

/// Every tunable of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interpreter: InterpreterConfig,
    pub validator: ValidatorConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub replication: ReplicationConfig,

    /// Instrument table for the paper terminal
    pub instruments: Vec<SymbolSpec>,

    pub followers: Vec<FollowerConfig>,

    /// JSON file with scheduled high-impact events
    pub news_calendar: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interpreter: InterpreterConfig::default(),
            validator: ValidatorConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            replication: ReplicationConfig::default(),
            instruments: default_instruments(),
            followers: vec![FollowerConfig {
                id: "follower-1".to_string(),
                volume_multiplier: Decimal::ONE,
            }],
            news_calendar: None,
        }
    }
}

fn default_instruments() -> Vec<SymbolSpec> {
    let spec = |symbol: &str, value: Decimal| SymbolSpec {
        symbol: symbol.to_string(),
        volume_step: dec!(0.01),
        min_volume: dec!(0.01),
        max_volume: dec!(50),
        value_per_unit_move: value,
        trade_allowed: true,
    };
    vec![
        spec("XAUUSD", dec!(1)),
        spec("XAGUSD", dec!(50)),
        spec("EURUSD", dec!(100000)),
        spec("GBPUSD", dec!(100000)),
        spec("US30", dec!(1)),
    ]
}

impl Settings {
    /// Read settings from `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(ConfigError::ReadFile)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let floor = self.interpreter.confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(ConfigError::InvalidValue {
                field: "interpreter.confidence_floor",
                reason: format!("{} is outside [0, 1]", floor),
            });
        }
        if self.risk.default_risk_fraction <= Decimal::ZERO
            || self.risk.default_risk_fraction > self.risk.max_risk_fraction
        {
            return Err(ConfigError::InvalidValue {
                field: "risk.default_risk_fraction",
                reason: "must be positive and not above risk.max_risk_fraction".to_string(),
            });
        }
        if self.execution.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "execution.max_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        for spec in &self.instruments {
            if spec.volume_step <= Decimal::ZERO || spec.min_volume > spec.max_volume {
                return Err(ConfigError::InvalidValue {
                    field: "instruments",
                    reason: format!("{} has an inconsistent volume table", spec.symbol),
                });
            }
        }
        for follower in &self.followers {
            if follower.volume_multiplier <= Decimal::ZERO {
                return Err(ConfigError::InvalidValue {
                    field: "followers.volume_multiplier",
                    reason: format!("{} must scale by a positive factor", follower.id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.risk.default_risk_fraction, dec!(0.0025));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [interpreter]
            quiet_window_secs = 2
            symbols = ["XAUUSD"]

            [risk]
            consecutive_loss_limit = 3

            [[followers]]
            id = "mirror-a"
            volume_multiplier = "0.5"
        "#;
        let settings = Settings::from_toml(raw).unwrap();
        assert_eq!(settings.interpreter.quiet_window_secs, 2);
        assert_eq!(settings.interpreter.max_signal_age_secs, 300);
        assert_eq!(settings.risk.consecutive_loss_limit, 3);
        assert_eq!(settings.followers.len(), 1);
        assert_eq!(settings.followers[0].volume_multiplier, dec!(0.5));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_floor() {
        let mut settings = Settings::default();
        settings.interpreter.confidence_floor = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field: "interpreter.confidence_floor", .. })
        ));
    }
}
