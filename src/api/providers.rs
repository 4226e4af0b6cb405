//! Account equity, news blackout and notification providers.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::VenueError;
use crate::models::{CloseReason, Direction, EventId, IntentId, MessageKey};

const WEBHOOK_TIMEOUT: StdDuration = StdDuration::from_secs(10);

// ==================== Account ====================

#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn equity(&self) -> Result<Decimal, VenueError>;
}

/// Constant equity, for dry runs without a live balance.
pub struct FixedEquity(pub Decimal);

#[async_trait]
impl AccountProvider for FixedEquity {
    async fn equity(&self) -> Result<Decimal, VenueError> {
        Ok(self.0)
    }
}

// ==================== News blackout ====================

pub trait BlackoutProvider: Send + Sync {
    fn is_blackout(&self, symbol: &str, at: DateTime<Utc>) -> bool;
}

pub struct NoBlackout;

impl BlackoutProvider for NoBlackout {
    fn is_blackout(&self, _symbol: &str, _at: DateTime<Utc>) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    #[default]
    High,
}

/// A scheduled economic release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    /// Currency code, e.g. "USD"
    pub currency: String,
    pub name: String,
    #[serde(default)]
    pub impact: Impact,
    pub time: DateTime<Utc>,
}

/// Blackout windows around high-impact events.
///
/// A symbol is affected when its code contains the event currency: a USD
/// release blocks XAUUSD and EURUSD but not US30.
pub struct NewsCalendar {
    events: Vec<NewsEvent>,
    pre: Duration,
    post: Duration,
}

impl NewsCalendar {
    pub fn new(events: Vec<NewsEvent>, pre_secs: i64, post_secs: i64) -> Self {
        Self {
            events,
            pre: Duration::seconds(pre_secs),
            post: Duration::seconds(post_secs),
        }
    }

    /// Load a JSON array of events.
    pub fn load(path: &Path, pre_secs: i64, post_secs: i64) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read news calendar {}", path.display()))?;
        let events: Vec<NewsEvent> =
            serde_json::from_str(&raw).context("Failed to parse news calendar")?;
        info!(events = events.len(), "Loaded news calendar");
        Ok(Self::new(events, pre_secs, post_secs))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl BlackoutProvider for NewsCalendar {
    fn is_blackout(&self, symbol: &str, at: DateTime<Utc>) -> bool {
        let symbol = symbol.to_ascii_uppercase();
        self.events.iter().any(|e| {
            e.impact == Impact::High
                && symbol.contains(&e.currency.to_ascii_uppercase())
                && at >= e.time - self.pre
                && at <= e.time + self.post
        })
    }
}

// ==================== Notifications ====================

/// Human-facing events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    SignalRejected {
        source: MessageKey,
        reason: String,
    },
    TradeOpened {
        intent: IntentId,
        symbol: String,
        direction: Direction,
        legs: usize,
        volume: Decimal,
    },
    LegFailed {
        intent: IntentId,
        leg: u8,
        reason: String,
    },
    BreakevenApplied {
        intent: IntentId,
        symbol: String,
        stop: Decimal,
        legs: usize,
    },
    LegClosed {
        intent: IntentId,
        leg: u8,
        price: Decimal,
        reason: CloseReason,
    },
    FollowerLegCancelled {
        follower: String,
        intent: IntentId,
        leg: u8,
        reason: String,
    },
    FollowerLagging {
        follower: String,
        acked: EventId,
        head: EventId,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignalRejected { source, reason } => {
                write!(f, "Signal {} rejected: {}", source, reason)
            }
            Self::TradeOpened { intent, symbol, direction, legs, volume } => write!(
                f,
                "Opened {} {} {} lots in {} legs (intent {})",
                symbol, direction, volume, legs, intent
            ),
            Self::LegFailed { intent, leg, reason } => {
                write!(f, "Leg {} of intent {} failed: {}", leg, intent, reason)
            }
            Self::BreakevenApplied { intent, symbol, stop, legs } => write!(
                f,
                "Breakeven on {}: {} legs moved to {} (intent {})",
                symbol, legs, stop, intent
            ),
            Self::LegClosed { intent, leg, price, reason } => write!(
                f,
                "Leg {} of intent {} closed at {} ({:?})",
                leg, intent, price, reason
            ),
            Self::FollowerLegCancelled { follower, intent, leg, reason } => write!(
                f,
                "Follower {} skipped leg {} of intent {}: {}",
                follower, leg, intent, reason
            ),
            Self::FollowerLagging { follower, acked, head } => write!(
                f,
                "Follower {} is lagging: acked {} of {}",
                follower, acked, head
            ),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: &Notification) {
        info!(target: "notify", "{}", notification);
    }
}

/// POSTs notifications as JSON. Delivery failures are logged and dropped.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn payload(notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "text": notification.to_string(),
            "event": notification,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, notification: &Notification) {
        let body = Self::payload(notification);
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.url, "Webhook delivered");
            }
            Ok(resp) => {
                warn!(url = %self.url, status = %resp.status(), "Webhook rejected notification");
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Webhook delivery failed");
            }
        }
    }
}

/// Delivers to every inner sink in turn.
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutNotifier {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl NotificationSink for FanoutNotifier {
    async fn notify(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.notify(notification).await;
        }
    }
}

/// Keeps every notification in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    seen: parking_lot::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.seen.lock())
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn nfp() -> NewsEvent {
        NewsEvent {
            currency: "USD".to_string(),
            name: "Non-Farm Payrolls".to_string(),
            impact: Impact::High,
            time: Utc.with_ymd_and_hms(2025, 4, 4, 12, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_blackout_window() {
        let calendar = NewsCalendar::new(vec![nfp()], 1800, 900);
        let release = nfp().time;

        assert!(calendar.is_blackout("XAUUSD", release - Duration::minutes(30)));
        assert!(calendar.is_blackout("EURUSD", release + Duration::minutes(15)));
        assert!(!calendar.is_blackout("XAUUSD", release + Duration::minutes(16)));
        assert!(!calendar.is_blackout("XAUUSD", release - Duration::minutes(31)));
        // no USD in the code
        assert!(!calendar.is_blackout("GBPJPY", release));
    }

    #[test]
    fn test_low_impact_ignored() {
        let mut event = nfp();
        event.impact = Impact::Low;
        let calendar = NewsCalendar::new(vec![event.clone()], 1800, 1800);
        assert!(!calendar.is_blackout("XAUUSD", event.time));
    }

    #[test]
    fn test_calendar_json_defaults_to_high_impact() {
        let raw = r#"[{"currency": "EUR", "name": "ECB rate", "time": "2025-04-17T12:15:00Z"}]"#;
        let events: Vec<NewsEvent> = serde_json::from_str(raw).unwrap();
        assert_eq!(events[0].impact, Impact::High);
    }

    #[test]
    fn test_webhook_payload() {
        let n = Notification::BreakevenApplied {
            intent: IntentId::new(),
            symbol: "XAUUSD".to_string(),
            stop: dec!(3232),
            legs: 1,
        };
        let body = WebhookNotifier::payload(&n);
        assert_eq!(body["event"]["type"], "breakeven_applied");
        assert!(body["text"].as_str().unwrap().contains("moved to 3232"));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingNotifier::default());
        let b = Arc::new(RecordingNotifier::default());
        let fanout = FanoutNotifier::new(vec![a.clone(), b.clone()]);
        let n = Notification::SignalRejected {
            source: MessageKey::new(1, 2),
            reason: "duplicate".to_string(),
        };
        fanout.notify(&n).await;
        assert_eq!(a.take(), vec![n.clone()]);
        assert_eq!(b.take(), vec![n]);
    }
}
