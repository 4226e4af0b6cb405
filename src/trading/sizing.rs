//! Volume sizing from risk fraction and stop distance.

use rust_decimal::Decimal;

use super::RiskConfig;
use crate::error::RiskRejection;
use crate::models::{CandidateSignal, SymbolSpec};

/// Fraction of equity to risk on `signal`.
///
/// A risk note (`Max 0.25%`) overrides the default, capped at `max_risk_fraction`.
pub fn risk_fraction(config: &RiskConfig, signal: &CandidateSignal) -> Decimal {
    match signal.risk_percent {
        Some(pct) if pct > Decimal::ZERO => (pct / Decimal::ONE_HUNDRED).min(config.max_risk_fraction),
        _ => config.default_risk_fraction,
    }
}

/// Total volume so that a stop-out loses `equity * fraction`.
///
/// `volume = equity * fraction / (|entry - stop| * value_per_unit_move)`,
/// floored to the volume step and capped at the instrument maximum.
/// A budget too small for the instrument minimum is refused rather than
/// rounded up, since the minimum would risk more than allowed.
pub fn total_volume(
    equity: Decimal,
    fraction: Decimal,
    entry: Decimal,
    stop: Decimal,
    spec: &SymbolSpec,
) -> Result<Decimal, RiskRejection> {
    if equity <= Decimal::ZERO {
        return Err(RiskRejection::NoEquity(equity));
    }
    let distance = (entry - stop).abs();
    if distance.is_zero() || spec.value_per_unit_move <= Decimal::ZERO {
        return Err(RiskRejection::ZeroStopDistance);
    }

    let risk_amount = equity * fraction;
    let raw = risk_amount / (distance * spec.value_per_unit_move);
    let floored = spec.floor_to_step(raw);

    if floored < spec.min_volume {
        return Err(RiskRejection::VolumeBelowMinimum {
            volume: floored,
            min: spec.min_volume,
        });
    }
    Ok(floored.min(spec.floor_to_step(spec.max_volume)))
}
