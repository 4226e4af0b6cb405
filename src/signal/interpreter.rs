//! Signal interpreter: extraction, edit merging, confidence and completion.
//!
//! Each message key owns one slot in a keyed arena. Work on the same key is
//! serialized by the slot's mutex; different keys never contend beyond the
//! map shard lookup.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::config::{ConfidenceWeights, InterpreterConfig};
use super::grammar::{self, Extraction};
use super::heuristic;
use super::lexer::{self, SymbolMatcher};
use crate::models::{CandidateSignal, MergeState, MessageKey, ParsePass, RawMessage, EXPECTED_FIELDS};

/// Result of one completion sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Ready for validation
    pub completed: Vec<CandidateSignal>,
    /// Aged out before completing
    pub stale: Vec<CandidateSignal>,
    /// Complete but below the confidence floor
    pub discarded: Vec<CandidateSignal>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.stale.is_empty() && self.discarded.is_empty()
    }
}

pub struct Interpreter {
    config: InterpreterConfig,
    symbols: SymbolMatcher,
    slots: DashMap<MessageKey, Arc<Mutex<CandidateSignal>>>,
}

impl Interpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        let symbols = SymbolMatcher::new(&config.symbols);
        Self {
            config,
            symbols,
            slots: DashMap::new(),
        }
    }

    /// Run the strict pass, falling back to the heuristic pass when the
    /// strict result is incomplete. Strict fields win over heuristic ones.
    pub fn extract(&self, text: &str) -> (Extraction, ParsePass) {
        let lines = lexer::lex(text);
        let strict = grammar::parse(&lines, &self.symbols);
        if strict.is_complete() {
            return (strict, ParsePass::Grammar);
        }

        let mut fields = heuristic::parse(&lines, &self.symbols);
        fields.overlay(&strict);
        (fields, ParsePass::Heuristic)
    }

    /// Feed one message (or edit). Returns the merged candidate, or `None`
    /// when the message carries nothing usable or cannot change any candidate.
    pub fn interpret(&self, message: &RawMessage, now: DateTime<Utc>) -> Option<CandidateSignal> {
        let key = message.key();
        let (fields, pass) = self.extract(&message.text);

        let slot = match self.slots.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if fields.is_empty() {
                    debug!(source = %key, "No signal fields in message");
                    return None;
                }
                let mut candidate =
                    CandidateSignal::new(key, message.edit_seq, pass, message.received_at);
                overwrite(&mut candidate, &fields);
                candidate.confidence = confidence(&candidate, &self.config.weights);
                debug!(
                    source = %key,
                    pass = ?pass,
                    confidence = candidate.confidence,
                    "New candidate: {}",
                    candidate.summary()
                );
                entry.insert(Arc::new(Mutex::new(candidate.clone())));
                return Some(candidate);
            }
        };

        let mut candidate = slot.lock();
        match candidate.merge_state {
            MergeState::Stale => {
                debug!(source = %key, edit_seq = message.edit_seq, "Edit for stale candidate ignored");
                return None;
            }
            MergeState::Complete => {
                if message.edit_seq <= candidate.edit_seq {
                    return None;
                }
                info!(source = %key, edit_seq = message.edit_seq, "Edit after completion, collecting again");
                candidate.merge_state = MergeState::Collecting;
            }
            MergeState::Collecting => {}
        }

        let max_age = Duration::seconds(self.config.max_signal_age_secs);
        if now - candidate.received_at > max_age {
            debug!(source = %key, "Edit arrived after max signal age, left for sweep");
            return None;
        }

        if !merge(&mut candidate, &fields, message.edit_seq, pass, message.received_at) {
            return None;
        }
        candidate.confidence = confidence(&candidate, &self.config.weights);
        debug!(
            source = %key,
            edit_seq = candidate.edit_seq,
            confidence = candidate.confidence,
            "Merged edit: {}",
            candidate.summary()
        );
        Some(candidate.clone())
    }

    /// Advance collecting candidates whose quiet window or age has elapsed.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let quiet = Duration::seconds(self.config.quiet_window_secs);
        let max_age = Duration::seconds(self.config.max_signal_age_secs);

        // Snapshot the arena so no shard lock is held while slots are locked.
        let slots: Vec<(MessageKey, Arc<Mutex<CandidateSignal>>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut outcome = SweepOutcome::default();
        let mut expired = Vec::new();

        for (key, slot) in slots {
            let mut candidate = slot.lock();
            match candidate.merge_state {
                MergeState::Collecting => {
                    if now - candidate.received_at > max_age {
                        candidate.merge_state = MergeState::Stale;
                        info!(source = %key, "Candidate went stale: {}", candidate.summary());
                        outcome.stale.push(candidate.clone());
                    } else if candidate.is_actionable() && now - candidate.updated_at >= quiet {
                        if candidate.confidence >= self.config.confidence_floor {
                            candidate.merge_state = MergeState::Complete;
                            outcome.completed.push(candidate.clone());
                        } else {
                            candidate.merge_state = MergeState::Stale;
                            info!(
                                source = %key,
                                confidence = candidate.confidence,
                                floor = self.config.confidence_floor,
                                "Candidate below confidence floor, discarded"
                            );
                            outcome.discarded.push(candidate.clone());
                        }
                    }
                }
                MergeState::Complete | MergeState::Stale => {
                    if now - candidate.updated_at > max_age * 2 {
                        expired.push(key);
                    }
                }
            }
        }

        for key in expired {
            self.slots.remove(&key);
        }

        outcome.completed.sort_by_key(|c| (c.received_at, c.source));
        outcome
    }

    /// Reinstall collecting candidates after a restart.
    pub fn restore(&self, candidates: Vec<CandidateSignal>) -> usize {
        let mut restored = 0;
        for candidate in candidates {
            if candidate.merge_state != MergeState::Collecting {
                continue;
            }
            if let Entry::Vacant(entry) = self.slots.entry(candidate.source) {
                entry.insert(Arc::new(Mutex::new(candidate)));
                restored += 1;
            }
        }
        restored
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.slots.len()
    }

    /// Candidates still waiting for edits or their quiet window.
    pub fn collecting(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().lock().merge_state == MergeState::Collecting)
            .count()
    }
}

/// Weighted confidence in [0, 1].
pub fn confidence(candidate: &CandidateSignal, weights: &ConfidenceWeights) -> f64 {
    let fraction = candidate.fields_present() as f64 / EXPECTED_FIELDS as f64;
    let pass_bonus = match candidate.pass {
        ParsePass::Grammar => weights.grammar,
        ParsePass::Heuristic => weights.heuristic,
    };
    let note_bonus = if candidate.risk_percent.is_some() {
        weights.risk_note
    } else {
        0.0
    };
    (fraction * weights.fields + pass_bonus + note_bonus).clamp(0.0, 1.0)
}

/// Merge an extraction by edit order. Returns false for a redelivered edit.
///
/// A newer edit overwrites every field it carries; an older edit that arrives
/// late only fills fields still missing. Targets merge by index either way.
fn merge(
    candidate: &mut CandidateSignal,
    fields: &Extraction,
    edit_seq: u32,
    pass: ParsePass,
    received_at: DateTime<Utc>,
) -> bool {
    match edit_seq.cmp(&candidate.edit_seq) {
        Ordering::Equal => return false,
        Ordering::Greater => {
            overwrite(candidate, fields);
            candidate.edit_seq = edit_seq;
            candidate.updated_at = candidate.updated_at.max(received_at);
        }
        Ordering::Less => fill_gaps(candidate, fields),
    }
    candidate.pass = candidate.pass.max(pass);
    true
}

fn overwrite(candidate: &mut CandidateSignal, fields: &Extraction) {
    if let Some(symbol) = &fields.symbol {
        candidate.symbol = Some(symbol.clone());
    }
    if fields.direction.is_some() {
        candidate.direction = fields.direction;
    }
    if fields.entry.is_some() {
        candidate.entry = fields.entry;
    }
    if fields.stop.is_some() {
        candidate.stop = fields.stop;
    }
    for (index, price) in &fields.targets {
        candidate.targets.insert(*index, *price);
    }
    if fields.risk_percent.is_some() {
        candidate.risk_percent = fields.risk_percent;
        candidate.risk_note = fields.risk_note.clone();
    }
}

fn fill_gaps(candidate: &mut CandidateSignal, fields: &Extraction) {
    if candidate.symbol.is_none() {
        candidate.symbol = fields.symbol.clone();
    }
    if candidate.direction.is_none() {
        candidate.direction = fields.direction;
    }
    if candidate.entry.is_none() {
        candidate.entry = fields.entry;
    }
    if candidate.stop.is_none() {
        candidate.stop = fields.stop;
    }
    for (index, price) in &fields.targets {
        candidate.targets.entry(*index).or_insert(*price);
    }
    if candidate.risk_percent.is_none() {
        candidate.risk_percent = fields.risk_percent;
        candidate.risk_note = fields.risk_note.clone();
    }
}
