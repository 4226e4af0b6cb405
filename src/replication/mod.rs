//! Primary to follower replication: the event log, follower apply, and
//! restart reconciliation.

mod bus;
mod follower;
mod reconcile;

pub use bus::{EventSource, FollowerLag, ReplicationBus, Subscription};
pub use follower::{Follower, FollowerStats};
pub use reconcile::{ReconcileReport, Reconciler};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Configuration for the replication bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// How long the oldest unacknowledged event may wait before its follower counts as lagging (seconds)
    pub ack_timeout_secs: i64,

    /// Maximum events handed out per delivery or resync request
    pub resync_batch: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            resync_batch: 500,
        }
    }
}

/// One follower terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerConfig {
    pub id: String,

    /// Leg volume scale relative to the primary (1 = same size)
    #[serde(default = "default_multiplier")]
    pub volume_multiplier: Decimal,
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}
