//! Keyed arena of live trade intents.
//!
//! Each intent sits behind its own async mutex, so work on one intent is
//! serialized while different intents proceed independently.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::models::{IntentId, TradeIntent};

pub type SharedIntent = Arc<Mutex<TradeIntent>>;

#[derive(Default)]
pub struct IntentBook {
    live: DashMap<IntentId, SharedIntent>,
    by_symbol: DashMap<String, BTreeSet<IntentId>>,
    retired: AtomicUsize,
}

impl IntentBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, intent: TradeIntent) -> SharedIntent {
        let id = intent.id;
        self.by_symbol
            .entry(intent.symbol.clone())
            .or_default()
            .insert(id);
        let shared = Arc::new(Mutex::new(intent));
        self.live.insert(id, shared.clone());
        shared
    }

    pub fn get(&self, id: IntentId) -> Option<SharedIntent> {
        self.live.get(&id).map(|entry| entry.value().clone())
    }

    #[cfg(test)]
    pub fn contains(&self, id: IntentId) -> bool {
        self.live.contains_key(&id)
    }

    /// Live intents on `symbol`.
    pub fn ids_for(&self, symbol: &str) -> Vec<IntentId> {
        self.by_symbol
            .get(symbol)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Symbols with at least one live intent.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .by_symbol
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        symbols.sort();
        symbols
    }

    /// Drop a finished intent from the live set.
    pub fn retire(&self, id: IntentId) -> Option<SharedIntent> {
        let (_, shared) = self.live.remove(&id)?;
        self.by_symbol.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
        self.retired.fetch_add(1, Ordering::Relaxed);
        Some(shared)
    }

    pub fn active_count(&self) -> usize {
        self.live.len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    /// Copies of every live intent, oldest first.
    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<TradeIntent> {
        let shared: Vec<SharedIntent> = self.live.iter().map(|e| e.value().clone()).collect();
        let mut intents = Vec::with_capacity(shared.len());
        for intent in shared {
            intents.push(intent.lock().await.clone());
        }
        intents.sort_by_key(|i| i.created_at);
        intents
    }
}
