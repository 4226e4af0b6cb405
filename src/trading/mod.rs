//! Trading logic: sizing, admission, execution and position lifecycle.

mod book;
mod config;
mod executor;
mod ledger;
mod risk_gate;
mod sizing;
mod tracker;

pub use book::{IntentBook, SharedIntent};
pub use config::{ExecutionConfig, RiskConfig};
pub use executor::{decompose, Executor};
pub use ledger::{LedgerHandle, RiskLedger};
pub use risk_gate::{Decision, RiskGate};
pub use sizing::{risk_fraction, total_volume};
pub use tracker::{LifecycleAction, MirrorAction, PositionTracker};
