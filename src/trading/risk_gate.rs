//! Admission control for validated signals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::sizing;
use super::RiskConfig;
use crate::api::BlackoutProvider;
use crate::error::RiskRejection;
use crate::models::{AccountState, DailyRiskState, ValidatedSignal};

/// Result of admission.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve {
        volume: Decimal,
        risk_fraction: Decimal,
    },
    Reject(RiskRejection),
}

impl Decision {
    #[cfg(test)]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve { .. })
    }
}

/// Stateless gate. Every input is passed in, so the same inputs give the same decision.
pub struct RiskGate {
    config: RiskConfig,
    blackout: Arc<dyn BlackoutProvider>,
}

impl RiskGate {
    pub fn new(config: RiskConfig, blackout: Arc<dyn BlackoutProvider>) -> Self {
        Self { config, blackout }
    }

    pub fn admit(
        &self,
        signal: &ValidatedSignal,
        account: &AccountState,
        daily: &DailyRiskState,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.check(signal, account, daily, now) {
            Ok((volume, risk_fraction)) => {
                info!(
                    source = %signal.signal.source,
                    volume = %volume,
                    risk_fraction = %risk_fraction,
                    "Signal admitted"
                );
                Decision::Approve {
                    volume,
                    risk_fraction,
                }
            }
            Err(reason) => {
                info!(source = %signal.signal.source, reason = %reason, "Signal denied by risk gate");
                Decision::Reject(reason)
            }
        }
    }

    fn check(
        &self,
        signal: &ValidatedSignal,
        account: &AccountState,
        daily: &DailyRiskState,
        now: DateTime<Utc>,
    ) -> Result<(Decimal, Decimal), RiskRejection> {
        if !signal.is_accepted() {
            return Err(RiskRejection::NotValidated);
        }
        let candidate = &signal.signal;
        let symbol = candidate.symbol.clone().ok_or(RiskRejection::NotValidated)?;

        if self.blackout.is_blackout(&symbol, now) {
            return Err(RiskRejection::NewsBlackout { symbol });
        }

        let cap = account.equity * self.config.max_daily_loss_fraction;
        if daily.realized_loss > Decimal::ZERO && daily.realized_loss >= cap {
            return Err(RiskRejection::DailyLossCap {
                realized: daily.realized_loss,
                cap,
            });
        }

        let limit = self.config.consecutive_loss_limit;
        let streak_open = limit > 0 && daily.consecutive_losses >= limit && daily.cooldown_until.is_none();
        if daily.in_cooldown(now) || streak_open {
            return Err(RiskRejection::Cooldown {
                losses: daily.consecutive_losses,
                until: daily.cooldown_until,
            });
        }

        if account.open_trades >= self.config.max_concurrent_trades {
            return Err(RiskRejection::MaxConcurrentTrades {
                open: account.open_trades,
                max: self.config.max_concurrent_trades,
            });
        }

        let spec = signal
            .spec
            .as_ref()
            .ok_or_else(|| RiskRejection::MissingSpec(symbol.clone()))?;
        let (entry, stop) = candidate
            .entry
            .zip(candidate.stop)
            .ok_or(RiskRejection::MissingPrices)?;

        let fraction = sizing::risk_fraction(&self.config, candidate);
        let volume = sizing::total_volume(account.equity, fraction, entry, stop, spec)?;
        debug!(symbol = %symbol, equity = %account.equity, fraction = %fraction, volume = %volume, "Sized");
        Ok((volume, fraction))
    }
}
