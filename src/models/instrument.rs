//! Instrument specifications, quotes and broker tickets.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Broker-assigned position reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trading constraints of one symbol at a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    /// Smallest volume increment (lots)
    pub volume_step: Decimal,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    /// Account-currency value of a one-unit price move for one lot
    pub value_per_unit_move: Decimal,
    #[serde(default = "default_trade_allowed")]
    pub trade_allowed: bool,
}

fn default_trade_allowed() -> bool {
    true
}

impl SymbolSpec {
    /// Round a volume down to the volume step.
    pub fn floor_to_step(&self, volume: Decimal) -> Decimal {
        if self.volume_step <= Decimal::ZERO {
            return volume;
        }
        (volume / self.volume_step).floor() * self.volume_step
    }

    /// Whole volume steps contained in `volume`.
    pub fn units(&self, volume: Decimal) -> u64 {
        if self.volume_step <= Decimal::ZERO {
            return 0;
        }
        (volume / self.volume_step).floor().to_u64().unwrap_or(0)
    }

    /// Minimum volume expressed in steps (at least one).
    pub fn min_units(&self) -> u64 {
        if self.volume_step <= Decimal::ZERO {
            return 1;
        }
        (self.min_volume / self.volume_step).ceil().to_u64().unwrap_or(1).max(1)
    }

    pub fn is_on_step(&self, volume: Decimal) -> bool {
        self.volume_step <= Decimal::ZERO || (volume % self.volume_step).is_zero()
    }
}

/// Top-of-book quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn new(bid: Decimal, ask: Decimal, time: DateTime<Utc>) -> Self {
        Self { bid, ask, time }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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

    #[test]
    fn test_floor_to_step() {
        let spec = gold();
        assert_eq!(spec.floor_to_step(dec!(2.083333)), dec!(2.08));
        assert_eq!(spec.floor_to_step(dec!(0.009)), dec!(0));
        assert_eq!(spec.units(dec!(2.08)), 208);
    }

    #[test]
    fn test_min_units() {
        let mut spec = gold();
        spec.min_volume = dec!(0.1);
        assert_eq!(spec.min_units(), 10);
        assert!(spec.is_on_step(dec!(1.04)));
        assert!(!spec.is_on_step(dec!(1.045)));
    }
}
