//! In-memory paper terminal.
//!
//! Fills market orders at the last known quote, keeps a balance and a
//! simple margin account, and lets tests script venue failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

use super::providers::AccountProvider;
use super::venue::{ExecutionVenue, OrderRequest, VenuePosition};
use crate::error::VenueError;
use crate::models::{Direction, SymbolSpec, Tick, Ticket};

/// An open paper position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperPosition {
    pub ticket: Ticket,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    pub comment: String,
    pub opened_at: DateTime<Utc>,
}

/// Notional divided by this is the margin a position ties up.
const LEVERAGE: Decimal = dec!(100);

#[derive(Debug, Default)]
struct PaperState {
    positions: HashMap<Ticket, PaperPosition>,
    ticks: HashMap<String, Tick>,
    balance: Decimal,
    faults: VecDeque<VenueError>,
    closed_markets: HashSet<String>,
    /// Largest accepted distance between the quote and the order's entry
    max_deviation: Option<Decimal>,
    /// Delay between a fill and its confirmation
    fill_delay: Option<Duration>,
    next_ticket: u64,
    submit_calls: u32,
}

pub struct PaperVenue {
    name: String,
    specs: HashMap<String, SymbolSpec>,
    state: Mutex<PaperState>,
}

impl PaperVenue {
    pub fn new(name: impl Into<String>, specs: Vec<SymbolSpec>) -> Self {
        Self {
            name: name.into(),
            specs: specs.into_iter().map(|s| (s.symbol.clone(), s)).collect(),
            state: Mutex::new(PaperState {
                balance: dec!(10000),
                next_ticket: 1,
                ..Default::default()
            }),
        }
    }

    pub fn with_balance(self, balance: Decimal) -> Self {
        self.state.lock().balance = balance;
        self
    }

    pub fn set_tick(&self, symbol: &str, tick: Tick) {
        self.state.lock().ticks.insert(symbol.to_string(), tick);
    }

    /// Queue a failure for the next mutating call (submit, modify, close).
    #[cfg(test)]
    pub fn inject_fault(&self, error: VenueError) {
        self.state.lock().faults.push_back(error);
    }

    /// Requote market orders whose fill price is further than `deviation` from the entry.
    pub fn set_max_deviation(&self, deviation: Option<Decimal>) {
        self.state.lock().max_deviation = deviation;
    }

    /// Confirm fills only after `delay`, as a congested terminal would.
    #[cfg(test)]
    pub fn set_fill_delay(&self, delay: Option<Duration>) {
        self.state.lock().fill_delay = delay;
    }

    #[cfg(test)]
    pub fn set_market_closed(&self, symbol: &str, closed: bool) {
        let mut state = self.state.lock();
        if closed {
            state.closed_markets.insert(symbol.to_string());
        } else {
            state.closed_markets.remove(symbol);
        }
    }

    #[cfg(test)]
    pub fn position(&self, ticket: Ticket) -> Option<PaperPosition> {
        self.state.lock().positions.get(&ticket).cloned()
    }

    /// Open positions ordered by ticket.
    pub fn positions(&self) -> Vec<PaperPosition> {
        let mut positions: Vec<_> = self.state.lock().positions.values().cloned().collect();
        positions.sort_by_key(|p| p.ticket);
        positions
    }

    #[cfg(test)]
    pub fn balance(&self) -> Decimal {
        self.state.lock().balance
    }

    /// Close a position behind the engine's back, as a broker-side stop would.
    #[cfg(test)]
    pub fn force_close(&self, ticket: Ticket) -> Option<PaperPosition> {
        let mut state = self.state.lock();
        let position = state.positions.remove(&ticket)?;
        let price = exit_price(&state, &position);
        state.balance += self.pnl(&position, price);
        Some(position)
    }

    #[cfg(test)]
    pub fn submit_calls(&self) -> u32 {
        self.state.lock().submit_calls
    }

    fn spec(&self, symbol: &str) -> Result<&SymbolSpec, VenueError> {
        self.specs
            .get(symbol)
            .ok_or_else(|| VenueError::InvalidSymbol(symbol.to_string()))
    }

    fn value_per_unit(&self, symbol: &str) -> Decimal {
        self.specs
            .get(symbol)
            .map(|s| s.value_per_unit_move)
            .unwrap_or(Decimal::ONE)
    }

    fn pnl(&self, position: &PaperPosition, price: Decimal) -> Decimal {
        (price - position.open_price) * position.direction.sign() * position.volume * self.value_per_unit(&position.symbol)
    }

    fn margin(&self, symbol: &str, volume: Decimal, price: Decimal) -> Decimal {
        volume * price * self.value_per_unit(symbol) / LEVERAGE
    }

    fn free_margin(&self, state: &PaperState) -> Decimal {
        let (floating, used) = state.positions.values().fold((Decimal::ZERO, Decimal::ZERO), |(f, u), p| {
            (
                f + self.pnl(p, exit_price(state, p)),
                u + self.margin(&p.symbol, p.volume, p.open_price),
            )
        });
        state.balance + floating - used
    }

    /// Checks and bookkeeping of a market order, under the state lock.
    fn fill(&self, order: &OrderRequest) -> Result<(Ticket, Decimal, Option<Duration>), VenueError> {
        let spec = self.spec(&order.symbol)?;
        let mut state = self.state.lock();
        state.submit_calls += 1;
        debug!(venue = %self.name, comment = %order.comment, calls = state.submit_calls, "Paper order received");
        take_fault(&mut state)?;

        if state.closed_markets.contains(&order.symbol) {
            return Err(VenueError::MarketClosed(order.symbol.clone()));
        }
        let invalid = |reason: &str| VenueError::InvalidVolume {
            volume: order.volume,
            reason: reason.to_string(),
        };
        if order.volume < spec.min_volume {
            return Err(invalid("below minimum"));
        }
        if order.volume > spec.max_volume {
            return Err(invalid("above maximum"));
        }
        if !spec.is_on_step(order.volume) {
            return Err(invalid("not a multiple of the volume step"));
        }

        let open_price = state
            .ticks
            .get(&order.symbol)
            .map(|t| match order.direction {
                Direction::Long => t.ask,
                Direction::Short => t.bid,
            })
            .unwrap_or(order.entry);
        if let Some(deviation) = state.max_deviation {
            if (open_price - order.entry).abs() > deviation {
                return Err(VenueError::Requote(format!("{} moved to {}", order.symbol, open_price)));
            }
        }
        if self.margin(&order.symbol, order.volume, open_price) > self.free_margin(&state) {
            return Err(VenueError::InsufficientMargin);
        }

        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;
        state.positions.insert(
            ticket,
            PaperPosition {
                ticket,
                symbol: order.symbol.clone(),
                direction: order.direction,
                volume: order.volume,
                open_price,
                stop: order.stop,
                target: order.target,
                comment: order.comment.clone(),
                opened_at: Utc::now(),
            },
        );
        Ok((ticket, open_price, state.fill_delay))
    }
}

fn take_fault(state: &mut PaperState) -> Result<(), VenueError> {
    match state.faults.pop_front() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Longs close at the bid, shorts at the ask. Falls back to the open price.
fn exit_price(state: &PaperState, position: &PaperPosition) -> Decimal {
    state
        .ticks
        .get(&position.symbol)
        .map(|t| match position.direction {
            Direction::Long => t.bid,
            Direction::Short => t.ask,
        })
        .unwrap_or(position.open_price)
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, VenueError> {
        let mut spec = self.spec(symbol)?.clone();
        if self.state.lock().closed_markets.contains(symbol) {
            spec.trade_allowed = false;
        }
        Ok(spec)
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<Ticket, VenueError> {
        let (ticket, open_price, delay) = self.fill(order)?;
        info!(
            venue = %self.name,
            ticket = %ticket,
            symbol = %order.symbol,
            volume = %order.volume,
            price = %open_price,
            "Paper order filled"
        );
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ticket)
    }

    async fn modify_stop(&self, ticket: Ticket, new_stop: Decimal) -> Result<(), VenueError> {
        let mut state = self.state.lock();
        take_fault(&mut state)?;
        let market = state.positions.get(&ticket).and_then(|p| {
            state.ticks.get(&p.symbol).map(|t| match p.direction {
                Direction::Long => t.bid,
                Direction::Short => t.ask,
            })
        });
        let position = state
            .positions
            .get_mut(&ticket)
            .ok_or(VenueError::PositionNotFound(ticket))?;
        if let Some(price) = market {
            if !position.direction.is_beyond(price, new_stop) {
                return Err(VenueError::Rejected(format!(
                    "stop {} is on the wrong side of {}",
                    new_stop, price
                )));
            }
        }
        debug!(venue = %self.name, ticket = %ticket, from = %position.stop, to = %new_stop, "Paper stop modified");
        position.stop = new_stop;
        Ok(())
    }

    async fn close_position(&self, ticket: Ticket) -> Result<(), VenueError> {
        let mut state = self.state.lock();
        take_fault(&mut state)?;
        let position = state
            .positions
            .remove(&ticket)
            .ok_or(VenueError::PositionNotFound(ticket))?;
        let price = exit_price(&state, &position);
        let pnl = self.pnl(&position, price);
        state.balance += pnl;
        info!(venue = %self.name, ticket = %ticket, price = %price, pnl = %pnl, "Paper position closed");
        Ok(())
    }

    async fn query_tick(&self, symbol: &str) -> Result<Tick, VenueError> {
        self.spec(symbol)?;
        self.state
            .lock()
            .ticks
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Connection(format!("no quote for {}", symbol)))
    }

    async fn open_positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        Ok(self
            .positions()
            .into_iter()
            .map(|p| VenuePosition {
                ticket: p.ticket,
                symbol: p.symbol,
                comment: p.comment,
            })
            .collect())
    }
}

#[async_trait]
impl AccountProvider for PaperVenue {
    async fn equity(&self) -> Result<Decimal, VenueError> {
        let state = self.state.lock();
        let floating: Decimal = state
            .positions
            .values()
            .map(|p| self.pnl(p, exit_price(&state, p)))
            .sum();
        Ok(state.balance + floating)
    }
}
