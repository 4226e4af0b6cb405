//! Single owner of the daily risk counters.
//!
//! All updates go through one task, so concurrently closing legs cannot lose
//! each other's results. Every request waits for its reply, which keeps a
//! caller's own updates ordered with its later snapshots.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::RiskConfig;
use crate::db::Repository;
use crate::models::DailyRiskState;

enum Command {
    Snapshot,
    TradeOpened,
    LegClosed { pnl: Decimal },
    IntentFinished { net_pnl: Decimal },
}

struct Request {
    command: Command,
    now: DateTime<Utc>,
    reply: oneshot::Sender<DailyRiskState>,
}

/// Cloneable handle to the ledger task.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Request>,
}

impl LedgerHandle {
    /// Current counters, rolled over to `now`'s date.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<DailyRiskState> {
        self.request(Command::Snapshot, now).await
    }

    pub async fn record_trade_opened(&self, now: DateTime<Utc>) -> Result<DailyRiskState> {
        self.request(Command::TradeOpened, now).await
    }

    pub async fn record_leg_closed(&self, pnl: Decimal, now: DateTime<Utc>) -> Result<DailyRiskState> {
        self.request(Command::LegClosed { pnl }, now).await
    }

    pub async fn record_intent_finished(
        &self,
        net_pnl: Decimal,
        now: DateTime<Utc>,
    ) -> Result<DailyRiskState> {
        self.request(Command::IntentFinished { net_pnl }, now).await
    }

    async fn request(&self, command: Command, now: DateTime<Utc>) -> Result<DailyRiskState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request {
                command,
                now,
                reply,
            })
            .await
            .map_err(|_| anyhow!("Risk ledger stopped"))?;
        rx.await.map_err(|_| anyhow!("Risk ledger dropped the request"))
    }
}

pub struct RiskLedger {
    state: DailyRiskState,
    config: RiskConfig,
    repo: Arc<dyn Repository>,
    rx: mpsc::Receiver<Request>,
}

impl RiskLedger {
    /// Start the ledger task. It stops once every handle is dropped.
    pub fn spawn(
        initial: DailyRiskState,
        config: RiskConfig,
        repo: Arc<dyn Repository>,
    ) -> (LedgerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(256);
        let ledger = Self {
            state: initial,
            config,
            repo,
            rx,
        };
        let task = tokio::spawn(ledger.run());
        (LedgerHandle { tx }, task)
    }

    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let changed = self.apply(request.command, request.now);
            if changed {
                if let Err(e) = self.repo.record_daily_risk(&self.state).await {
                    warn!(error = %e, "Failed to persist daily risk state");
                }
            }
            let _ = request.reply.send(self.state.clone());
        }
        debug!("Risk ledger stopped");
    }

    /// Returns true when the state changed.
    fn apply(&mut self, command: Command, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.state.roll(now) {
            info!(date = %self.state.date, "Daily risk state rolled over");
            changed = true;
        }
        if self.state.expire_cooldown(now) {
            info!("Cooldown finished");
            changed = true;
        }

        match command {
            Command::Snapshot => changed,
            Command::TradeOpened => {
                self.state.record_trade_opened();
                true
            }
            Command::LegClosed { pnl } => {
                self.state.record_leg_result(pnl);
                debug!(pnl = %pnl, realized_loss = %self.state.realized_loss, "Leg result recorded");
                true
            }
            Command::IntentFinished { net_pnl } => {
                self.state.record_intent_result(
                    net_pnl,
                    now,
                    self.config.consecutive_loss_limit,
                    Duration::seconds(self.config.cooldown_secs),
                );
                if let Some(until) = self.state.cooldown_until {
                    if self.state.consecutive_losses >= self.config.consecutive_loss_limit {
                        warn!(
                            losses = self.state.consecutive_losses,
                            until = %until,
                            "Loss streak reached, cooling down"
                        );
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 9, 0, 0).unwrap()
    }

    fn spawn(repo: Arc<MemoryRepository>) -> LedgerHandle {
        let (handle, _task) = RiskLedger::spawn(DailyRiskState::for_time(t0()), RiskConfig::default(), repo);
        handle
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let repo = Arc::new(MemoryRepository::new());
        let ledger = spawn(repo.clone());

        let updates = (0..20).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.record_leg_closed(dec!(-1.5), t0()).await })
        });
        for update in futures::future::join_all(updates).await {
            update.unwrap().unwrap();
        }

        let state = ledger.snapshot(t0()).await.unwrap();
        assert_eq!(state.realized_loss, dec!(30));
        let stored = repo.load_daily_risk(t0().date_naive()).await.unwrap().unwrap();
        assert_eq!(stored.realized_loss, dec!(30));
    }

    #[tokio::test]
    async fn test_streak_and_cooldown_lifecycle() {
        let ledger = spawn(Arc::new(MemoryRepository::new()));
        ledger.record_intent_finished(dec!(-12), t0()).await.unwrap();
        let state = ledger.record_intent_finished(dec!(-12), t0()).await.unwrap();
        assert_eq!(state.consecutive_losses, 2);
        assert_eq!(state.cooldown_until, Some(t0() + Duration::hours(1)));

        let later = ledger.snapshot(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(later.cooldown_until, None);
        assert_eq!(later.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_rollover_on_snapshot() {
        let ledger = spawn(Arc::new(MemoryRepository::new()));
        ledger.record_trade_opened(t0()).await.unwrap();
        ledger.record_leg_closed(dec!(-20), t0()).await.unwrap();

        let next_day = ledger.snapshot(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(next_day.date, (t0() + Duration::days(1)).date_naive());
        assert_eq!(next_day.realized_loss, Decimal::ZERO);
        assert_eq!(next_day.trade_count, 0);
    }
}
