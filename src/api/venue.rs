//! Execution venue port and the retry policy wrapped around its calls.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::VenueError;
use crate::models::{Direction, SymbolSpec, Tick, Ticket};
use crate::trading::ExecutionConfig;

/// One market order with attached stop and take-profit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    /// Reference price from the signal
    pub entry: Decimal,
    pub comment: String,
}

/// A position as the venue reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub ticket: Ticket,
    pub symbol: String,
    /// Comment attached at submission, echoed back by the venue
    pub comment: String,
}

/// Order placement and position management at one brokerage terminal.
///
/// Every call may fail; callers classify failures with [`VenueError::class`].
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, VenueError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<Ticket, VenueError>;

    async fn modify_stop(&self, ticket: Ticket, new_stop: Decimal) -> Result<(), VenueError>;

    async fn close_position(&self, ticket: Ticket) -> Result<(), VenueError>;

    async fn query_tick(&self, symbol: &str) -> Result<Tick, VenueError>;

    async fn open_positions(&self) -> Result<Vec<VenuePosition>, VenueError>;
}

/// Ticket of the open position carrying `comment`, if any.
pub async fn find_order(venue: &dyn ExecutionVenue, comment: &str) -> Result<Option<Ticket>, VenueError> {
    if comment.is_empty() {
        return Ok(None);
    }
    Ok(venue
        .open_positions()
        .await?
        .into_iter()
        .find(|p| p.comment == comment)
        .map(|p| p.ticket))
}

/// Submit `order` under `retry` without ever filling it twice.
///
/// A timed-out submission may still have filled. Before every retry, and
/// once more after a final timeout, the venue is searched for the order's
/// comment and a matching position is adopted instead of resubmitting.
pub async fn place_order(
    venue: &dyn ExecutionVenue,
    retry: &RetryPolicy,
    order: &OrderRequest,
) -> Result<Ticket, VenueError> {
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;

    let result = retry
        .run("submit_order", || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                if let Some(ticket) = find_order(venue, &order.comment).await? {
                    info!(ticket = %ticket, comment = %order.comment, "Adopted fill of an earlier attempt");
                    return Ok(ticket);
                }
            }
            venue.submit_order(order).await
        })
        .await;

    match result {
        Err(VenueError::Timeout) => match find_order(venue, &order.comment).await {
            Ok(Some(ticket)) => {
                info!(ticket = %ticket, comment = %order.comment, "Adopted fill of a timed-out submission");
                Ok(ticket)
            }
            _ => Err(VenueError::Timeout),
        },
        other => other,
    }
}

/// Bounded wait plus exponential backoff for transient venue failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(config.call_timeout_ms),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Run `call` until it succeeds, fails fatally, or attempts run out.
    ///
    /// A call exceeding `call_timeout` counts as [`VenueError::Timeout`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        let call_timeout = self.call_timeout;
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build();

        backoff::future::retry_notify(
            policy,
            || {
                attempt += 1;
                let current = attempt;
                let pending = call();
                async move {
                    let result = match tokio::time::timeout(call_timeout, pending).await {
                        Ok(result) => result,
                        Err(_) => Err(VenueError::Timeout),
                    };
                    result.map_err(|e| {
                        if e.is_transient() && current < max_attempts {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: VenueError, wait: Duration| {
                warn!(
                    operation,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "Transient venue failure, retrying"
                );
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperVenue;
    use crate::config::Settings;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_millis(50),
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = fast_policy(3)
            .run("test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(VenueError::Requote("moved".to_string()))
                } else {
                    Ok(7u64)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast_policy(5)
            .run("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VenueError::MarketClosed("XAUUSD".to_string()))
            })
            .await;
        assert_eq!(result, Err(VenueError::MarketClosed("XAUUSD".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast_policy(3)
            .run("test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VenueError::Connection("reset".to_string()))
            })
            .await;
        assert!(matches!(result, Err(VenueError::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    fn order(comment: &str) -> OrderRequest {
        OrderRequest {
            symbol: "XAUUSD".to_string(),
            direction: Direction::Long,
            volume: Decimal::ONE,
            stop: Decimal::from(3220),
            target: Decimal::from(3235),
            entry: Decimal::from(3232),
            comment: comment.to_string(),
        }
    }

    fn paper() -> PaperVenue {
        PaperVenue::new("paper", Settings::default().instruments)
    }

    #[tokio::test]
    async fn test_fill_behind_a_timeout_is_adopted() {
        let venue = paper();
        // fills, then answers too late
        venue.set_fill_delay(Some(Duration::from_millis(300)));
        let ticket = place_order(&venue, &fast_policy(3), &order("a/1")).await.unwrap();

        assert_eq!(venue.positions().len(), 1);
        assert_eq!(venue.positions()[0].ticket, ticket);
        assert_eq!(venue.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_last_attempt_timeout_is_adopted() {
        let venue = paper();
        venue.set_fill_delay(Some(Duration::from_millis(300)));
        let ticket = place_order(&venue, &fast_policy(1), &order("a/2")).await.unwrap();
        assert_eq!(venue.positions()[0].ticket, ticket);
    }

    #[tokio::test]
    async fn test_unfilled_timeout_is_resubmitted() {
        let venue = paper();
        venue.inject_fault(VenueError::Timeout);
        place_order(&venue, &fast_policy(3), &order("a/3")).await.unwrap();
        assert_eq!(venue.positions().len(), 1);
        assert_eq!(venue.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let result: Result<(), _> = fast_policy(1)
            .run("test", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(VenueError::Timeout));
    }
}
