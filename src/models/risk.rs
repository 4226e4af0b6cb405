//! Account and daily risk state.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Account snapshot handed to the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Decimal,
    pub open_trades: usize,
}

/// Per-day risk counters. One instance per UTC trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub date: NaiveDate,
    /// Sum of losing leg results for the day (positive number)
    pub realized_loss: Decimal,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub trade_count: u32,
}

impl DailyRiskState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            realized_loss: Decimal::ZERO,
            consecutive_losses: 0,
            cooldown_until: None,
            trade_count: 0,
        }
    }

    pub fn for_time(now: DateTime<Utc>) -> Self {
        Self::new(now.date_naive())
    }

    /// Reset on UTC date change. Returns true when a rollover happened.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today == self.date {
            return false;
        }
        *self = Self::new(today);
        true
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(false, |until| now < until)
    }

    /// Clear a finished cooldown together with the streak that caused it.
    pub fn expire_cooldown(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) if now >= until => {
                self.cooldown_until = None;
                self.consecutive_losses = 0;
                true
            }
            _ => false,
        }
    }

    pub fn record_trade_opened(&mut self) {
        self.trade_count += 1;
    }

    /// Only losing legs count towards the daily loss.
    pub fn record_leg_result(&mut self, pnl: Decimal) {
        if pnl < Decimal::ZERO {
            self.realized_loss += -pnl;
        }
    }

    /// Update the loss streak once an intent has no live legs left.
    pub fn record_intent_result(
        &mut self,
        net_pnl: Decimal,
        now: DateTime<Utc>,
        loss_limit: u32,
        cooldown: Duration,
    ) {
        if net_pnl < Decimal::ZERO {
            self.consecutive_losses += 1;
            if loss_limit > 0 && self.consecutive_losses >= loss_limit {
                self.cooldown_until = Some(now + cooldown);
            }
        } else {
            self.consecutive_losses = 0;
        }
    }
}
