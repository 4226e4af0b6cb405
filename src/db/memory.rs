//! In-memory repository for tests and `--memory` runs.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use super::Repository;
use crate::models::{
    CandidateSignal, DailyRiskState, EventId, IntentId, MergeState, MessageKey, RawMessage,
    ReplicationEvent, TradeIntent, ValidatedSignal,
};

#[derive(Default)]
struct Tables {
    messages: Vec<RawMessage>,
    candidates: BTreeMap<MessageKey, Vec<CandidateSignal>>,
    verdicts: Vec<ValidatedSignal>,
    intents: HashMap<String, BTreeMap<IntentId, TradeIntent>>,
    events: BTreeMap<EventId, ReplicationEvent>,
    offsets: BTreeMap<String, EventId>,
    daily: HashMap<NaiveDate, DailyRiskState>,
    #[cfg(test)]
    fail_next_intent: bool,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn message_count(&self) -> usize {
        self.tables.lock().messages.len()
    }

    #[cfg(test)]
    pub fn verdicts(&self) -> Vec<ValidatedSignal> {
        self.tables.lock().verdicts.clone()
    }

    /// Make the next intent write fail.
    #[cfg(test)]
    pub fn fail_next_intent_write(&self) {
        self.tables.lock().fail_next_intent = true;
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn record_message(&self, message: &RawMessage) -> Result<()> {
        let mut tables = self.tables.lock();
        let seen = tables
            .messages
            .iter()
            .any(|m| m.key() == message.key() && m.edit_seq == message.edit_seq);
        if !seen {
            tables.messages.push(message.clone());
        }
        Ok(())
    }

    async fn record_candidate(&self, candidate: &CandidateSignal) -> Result<()> {
        self.tables
            .lock()
            .candidates
            .entry(candidate.source)
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn record_verdict(&self, verdict: &ValidatedSignal) -> Result<()> {
        self.tables.lock().verdicts.push(verdict.clone());
        Ok(())
    }

    async fn record_intent(&self, owner: &str, intent: &TradeIntent) -> Result<()> {
        let mut tables = self.tables.lock();
        #[cfg(test)]
        if std::mem::take(&mut tables.fail_next_intent) {
            bail!("Failed to store intent {}: disk full", intent.id);
        }
        tables
            .intents
            .entry(owner.to_string())
            .or_default()
            .insert(intent.id, intent.clone());
        Ok(())
    }

    async fn record_event(&self, event: &ReplicationEvent) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.events.contains_key(&event.id) {
            bail!("Failed to append event {}: id already stored", event.id);
        }
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn record_offset(&self, follower: &str, acked: EventId) -> Result<()> {
        let mut tables = self.tables.lock();
        let offset = tables.offsets.entry(follower.to_string()).or_insert(0);
        *offset = (*offset).max(acked);
        Ok(())
    }

    async fn record_daily_risk(&self, state: &DailyRiskState) -> Result<()> {
        self.tables.lock().daily.insert(state.date, state.clone());
        Ok(())
    }

    async fn load_events(&self) -> Result<Vec<ReplicationEvent>> {
        Ok(self.tables.lock().events.values().cloned().collect())
    }

    async fn load_offsets(&self) -> Result<Vec<(String, EventId)>> {
        Ok(self
            .tables
            .lock()
            .offsets
            .iter()
            .map(|(f, o)| (f.clone(), *o))
            .collect())
    }

    async fn load_intents(&self, owner: &str) -> Result<Vec<TradeIntent>> {
        Ok(self
            .tables
            .lock()
            .intents
            .get(owner)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn load_collecting_candidates(&self) -> Result<Vec<CandidateSignal>> {
        Ok(self
            .tables
            .lock()
            .candidates
            .values()
            .filter_map(|history| history.last())
            .filter(|c| c.merge_state == MergeState::Collecting)
            .cloned()
            .collect())
    }

    async fn load_daily_risk(&self, date: NaiveDate) -> Result<Option<DailyRiskState>> {
        Ok(self.tables.lock().daily.get(&date).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventPayload, ParsePass};
    use chrono::Utc;

    #[tokio::test]
    async fn test_duplicate_event_id_refused() {
        let repo = MemoryRepository::new();
        let event = ReplicationEvent {
            id: 1,
            intent_id: IntentId::new(),
            leg: None,
            payload: EventPayload::Cancel {
                reason: "x".to_string(),
            },
            emitted_at: Utc::now(),
        };
        repo.record_event(&event).await.unwrap();
        assert!(repo.record_event(&event).await.is_err());
    }

    #[tokio::test]
    async fn test_only_latest_collecting_state_restored() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        let mut first = CandidateSignal::new(MessageKey::new(1, 1), 0, ParsePass::Grammar, now);
        repo.record_candidate(&first).await.unwrap();
        first.merge_state = MergeState::Stale;
        repo.record_candidate(&first).await.unwrap();

        let second = CandidateSignal::new(MessageKey::new(1, 2), 1, ParsePass::Heuristic, now);
        repo.record_candidate(&second).await.unwrap();

        assert_eq!(repo.load_collecting_candidates().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_message_edits_stored_once() {
        let repo = MemoryRepository::new();
        let msg = RawMessage::new(1, 1, 0, "XAUUSD buy now", Utc::now());
        repo.record_message(&msg).await.unwrap();
        repo.record_message(&msg).await.unwrap();
        assert_eq!(repo.message_count(), 1);
    }
}
