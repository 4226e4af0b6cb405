//! Signal validation: completeness, tradability, price ladder, freshness, duplicates.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::config::ValidatorConfig;
use crate::api::ExecutionVenue;
use crate::error::RejectionReason;
use crate::models::{CandidateSignal, Direction, MessageKey, SymbolSpec, ValidatedSignal};

/// A signal that was approved for execution, kept for duplicate detection.
#[derive(Debug, Clone)]
struct AcceptedSignal {
    source: MessageKey,
    direction: Direction,
    entry: Decimal,
    accepted_at: DateTime<Utc>,
}

pub struct Validator {
    config: ValidatorConfig,
    venue: Arc<dyn ExecutionVenue>,
    /// Recently approved signals per symbol
    accepted: DashMap<String, Vec<AcceptedSignal>>,
}

impl Validator {
    pub fn new(config: ValidatorConfig, venue: Arc<dyn ExecutionVenue>) -> Self {
        Self {
            config,
            venue,
            accepted: DashMap::new(),
        }
    }

    /// Run every check in order, stopping at the first failure.
    ///
    /// Never fails: malformed input yields a rejected `ValidatedSignal`.
    pub async fn validate(&self, signal: CandidateSignal, now: DateTime<Utc>) -> ValidatedSignal {
        let (symbol, direction, entry, stop) = match required_fields(&signal) {
            Ok(fields) => fields,
            Err(reason) => return self.reject(signal, reason, None, now),
        };

        let spec = match self.lookup(&symbol).await {
            Ok(spec) => spec,
            Err((reason, spec)) => return self.reject(signal, reason, spec, now),
        };

        if let Err(reason) = check_price_ladder(direction, entry, stop, &signal) {
            return self.reject(signal, reason, Some(spec), now);
        }

        let age = now - signal.received_at;
        if age > Duration::seconds(self.config.freshness_secs) {
            let reason = RejectionReason::TooOld {
                age_secs: age.num_seconds(),
                max_secs: self.config.freshness_secs,
            };
            return self.reject(signal, reason, Some(spec), now);
        }

        if let Err(reason) = self.check_duplicate(&symbol, direction, entry, now) {
            return self.reject(signal, reason, Some(spec), now);
        }

        info!(
            source = %signal.source,
            symbol = %symbol,
            direction = %direction,
            "Signal accepted: {}",
            signal.summary()
        );
        ValidatedSignal::accepted(signal, spec, now)
    }

    /// Query tradability. Runs without any lock held.
    async fn lookup(&self, symbol: &str) -> Result<SymbolSpec, (RejectionReason, Option<SymbolSpec>)> {
        let not_tradable = |detail: String| RejectionReason::SymbolNotTradable {
            symbol: symbol.to_string(),
            detail,
        };
        let wait = StdDuration::from_millis(self.config.lookup_timeout_ms);

        match tokio::time::timeout(wait, self.venue.symbol_spec(symbol)).await {
            Ok(Ok(spec)) if spec.trade_allowed => Ok(spec),
            Ok(Ok(spec)) => Err((not_tradable("trading disabled".to_string()), Some(spec))),
            Ok(Err(e)) => Err((not_tradable(e.to_string()), None)),
            Err(_) => Err((not_tradable("lookup timed out".to_string()), None)),
        }
    }

    /// Same symbol, same direction, entry within tolerance, inside the window.
    fn check_duplicate(
        &self,
        symbol: &str,
        direction: Direction,
        entry: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        match self.accepted.get_mut(symbol) {
            Some(mut recent) => self.find_duplicate(&mut recent, symbol, direction, entry, now),
            None => Ok(()),
        }
    }

    fn find_duplicate(
        &self,
        recent: &mut Vec<AcceptedSignal>,
        symbol: &str,
        direction: Direction,
        entry: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        let window = Duration::seconds(self.config.dedup_window_secs);
        let tolerance = self.config.dedup_price_tolerance;
        recent.retain(|s| now - s.accepted_at <= window);

        match recent
            .iter()
            .find(|s| s.direction == direction && (s.entry - entry).abs() <= tolerance)
        {
            Some(original) => Err(RejectionReason::Duplicate {
                original: original.source,
                symbol: symbol.to_string(),
                direction,
                entry,
            }),
            None => Ok(()),
        }
    }

    /// Record an approved signal in the dedup index.
    ///
    /// Checks again under the symbol's entry, so of two concurrent
    /// duplicates only the first claim wins.
    pub fn claim(&self, signal: &ValidatedSignal, now: DateTime<Utc>) -> Result<(), RejectionReason> {
        let candidate = &signal.signal;
        let (symbol, direction, entry) = match (&candidate.symbol, candidate.direction, candidate.entry) {
            (Some(symbol), Some(direction), Some(entry)) => (symbol, direction, entry),
            _ => return Ok(()),
        };

        let mut recent = self.accepted.entry(symbol.clone()).or_default();
        self.find_duplicate(&mut recent, symbol, direction, entry, now)?;
        recent.push(AcceptedSignal {
            source: candidate.source,
            direction,
            entry,
            accepted_at: now,
        });
        debug!(source = %candidate.source, symbol = %symbol, "Signal claimed for dedup");
        Ok(())
    }

    /// Drop a claim whose trade was never prepared.
    pub fn release(&self, signal: &ValidatedSignal) {
        let candidate = &signal.signal;
        if let Some(symbol) = &candidate.symbol {
            if let Some(mut recent) = self.accepted.get_mut(symbol) {
                recent.retain(|a| a.source != candidate.source);
            }
        }
    }

    fn reject(
        &self,
        signal: CandidateSignal,
        reason: RejectionReason,
        spec: Option<SymbolSpec>,
        now: DateTime<Utc>,
    ) -> ValidatedSignal {
        info!(source = %signal.source, reason = %reason, "Signal rejected");
        ValidatedSignal::rejected(signal, reason, spec, now)
    }
}

fn required_fields(
    signal: &CandidateSignal,
) -> Result<(String, Direction, Decimal, Decimal), RejectionReason> {
    let missing = |field: &str| RejectionReason::MissingField {
        field: field.to_string(),
    };
    let symbol = signal.symbol.clone().ok_or_else(|| missing("symbol"))?;
    let direction = signal.direction.ok_or_else(|| missing("direction"))?;
    let entry = signal.entry.ok_or_else(|| missing("entry"))?;
    let stop = signal.stop.ok_or_else(|| missing("stop"))?;
    if signal.targets.is_empty() {
        return Err(missing("target"));
    }
    Ok((symbol, direction, entry, stop))
}

/// Long: stop < entry < TP1 < TP2 ... Short: the same ladder inverted.
fn check_price_ladder(
    direction: Direction,
    entry: Decimal,
    stop: Decimal,
    signal: &CandidateSignal,
) -> Result<(), RejectionReason> {
    let mut ladder = vec![("stop".to_string(), stop), ("entry".to_string(), entry)];
    ladder.extend(signal.targets.iter().map(|(i, p)| (format!("TP{}", i), *p)));

    let side = match direction {
        Direction::Long => "above",
        Direction::Short => "below",
    };
    for pair in ladder.windows(2) {
        let (lower_name, lower) = &pair[0];
        let (upper_name, upper) = &pair[1];
        if !direction.is_beyond(*upper, *lower) {
            debug!(direction = %direction, "Price ladder broken at {}", upper_name);
            return Err(RejectionReason::PriceRelationship {
                direction,
                detail: format!("{} {} is not {} {} {}", upper_name, upper, side, lower_name, lower),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperVenue;
    use crate::config::Settings;
    use crate::models::{MergeState, ParsePass};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 9, 0, 0).unwrap()
    }

    fn validator() -> Validator {
        let venue = Arc::new(PaperVenue::new("primary", Settings::default().instruments));
        Validator::new(ValidatorConfig::default(), venue)
    }

    fn make_signal(id: i64, direction: Direction, entry: Decimal, stop: Decimal, targets: &[Decimal]) -> CandidateSignal {
        let mut c = CandidateSignal::new(MessageKey::new(1, id), 0, ParsePass::Grammar, t0());
        c.symbol = Some("XAUUSD".to_string());
        c.direction = Some(direction);
        c.entry = Some(entry);
        c.stop = Some(stop);
        for (i, t) in targets.iter().enumerate() {
            c.targets.insert(i as u8 + 1, *t);
        }
        c.merge_state = MergeState::Complete;
        c
    }

    fn long_signal(id: i64) -> CandidateSignal {
        make_signal(id, Direction::Long, dec!(3232), dec!(3220), &[dec!(3235), dec!(3239)])
    }

    #[tokio::test]
    async fn test_accepts_well_formed_signal() {
        let v = validator();
        let result = v.validate(long_signal(1), t0()).await;
        assert!(result.is_accepted());
        assert_eq!(result.spec.as_ref().map(|s| s.symbol.as_str()), Some("XAUUSD"));
    }

    #[tokio::test]
    async fn test_missing_field() {
        let v = validator();
        let mut signal = long_signal(1);
        signal.stop = None;
        let result = v.validate(signal, t0()).await;
        assert_eq!(
            result.rejection(),
            Some(&RejectionReason::MissingField { field: "stop".to_string() })
        );
    }

    #[tokio::test]
    async fn test_unknown_symbol_not_tradable() {
        let v = validator();
        let mut signal = long_signal(1);
        signal.symbol = Some("BTCXYZ".to_string());
        let result = v.validate(signal, t0()).await;
        assert!(matches!(
            result.rejection(),
            Some(RejectionReason::SymbolNotTradable { .. })
        ));
    }

    #[tokio::test]
    async fn test_price_ladder() {
        let v = validator();
        // long with stop above entry
        let bad_long = make_signal(1, Direction::Long, dec!(3232), dec!(3240), &[dec!(3250)]);
        assert!(matches!(
            v.validate(bad_long, t0()).await.rejection(),
            Some(RejectionReason::PriceRelationship { .. })
        ));

        // targets must ascend for a long
        let unordered = make_signal(2, Direction::Long, dec!(3232), dec!(3220), &[dec!(3239), dec!(3235)]);
        assert!(!v.validate(unordered, t0()).await.is_accepted());

        let short = make_signal(3, Direction::Short, dec!(3232), dec!(3244), &[dec!(3228), dec!(3220)]);
        assert!(v.validate(short, t0()).await.is_accepted());
    }

    #[tokio::test]
    async fn test_too_old() {
        let v = validator();
        let result = v.validate(long_signal(1), t0() + Duration::seconds(301)).await;
        assert_eq!(
            result.rejection(),
            Some(&RejectionReason::TooOld { age_secs: 301, max_secs: 300 })
        );
    }

    async fn validate_and_claim(v: &Validator, signal: CandidateSignal, now: DateTime<Utc>) -> ValidatedSignal {
        let validated = v.validate(signal, now).await;
        if validated.is_accepted() {
            v.claim(&validated, now).unwrap();
        }
        validated
    }

    #[tokio::test]
    async fn test_duplicate_within_window() {
        let v = validator();
        assert!(validate_and_claim(&v, long_signal(1), t0()).await.is_accepted());

        let mut near = long_signal(2);
        near.entry = Some(dec!(3232.4));
        let dup = v.validate(near, t0() + Duration::seconds(10)).await;
        assert!(matches!(
            dup.rejection(),
            Some(RejectionReason::Duplicate { original, .. }) if *original == MessageKey::new(1, 1)
        ));

        // outside tolerance is a different signal
        let mut far = long_signal(3);
        far.entry = Some(dec!(3233));
        assert!(v.validate(far, t0() + Duration::seconds(20)).await.is_accepted());
    }

    #[tokio::test]
    async fn test_duplicate_window_expires() {
        let config = ValidatorConfig {
            freshness_secs: 7200,
            dedup_window_secs: 60,
            ..Default::default()
        };
        let venue = Arc::new(PaperVenue::new("primary", Settings::default().instruments));
        let v = Validator::new(config, venue);

        assert!(validate_and_claim(&v, long_signal(1), t0()).await.is_accepted());
        assert!(v.validate(long_signal(2), t0() + Duration::seconds(61)).await.is_accepted());
    }

    #[tokio::test]
    async fn test_rejected_signals_are_not_remembered() {
        let v = validator();
        assert!(!validate_and_claim(&v, long_signal(1), t0() + Duration::seconds(400)).await.is_accepted());
        assert!(v.validate(long_signal(2), t0()).await.is_accepted());
    }

    #[tokio::test]
    async fn test_unclaimed_signal_does_not_block_repost() {
        let v = validator();
        // accepted but never approved downstream
        assert!(v.validate(long_signal(1), t0()).await.is_accepted());
        let repost = v.validate(long_signal(2), t0() + Duration::seconds(30)).await;
        assert!(repost.is_accepted());
        v.claim(&repost, t0() + Duration::seconds(30)).unwrap();

        let third = v.validate(long_signal(3), t0() + Duration::seconds(60)).await;
        assert!(matches!(
            third.rejection(),
            Some(RejectionReason::Duplicate { original, .. }) if *original == MessageKey::new(1, 2)
        ));
    }

    #[tokio::test]
    async fn test_second_claim_of_a_duplicate_fails() {
        let v = validator();
        let first = v.validate(long_signal(1), t0()).await;
        let second = v.validate(long_signal(2), t0()).await;
        assert!(first.is_accepted() && second.is_accepted());

        v.claim(&first, t0()).unwrap();
        assert!(matches!(
            v.claim(&second, t0()),
            Err(RejectionReason::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_released_claim_frees_the_signal() {
        let v = validator();
        let first = validate_and_claim(&v, long_signal(1), t0()).await;
        v.release(&first);

        let repost = v.validate(long_signal(2), t0() + Duration::seconds(5)).await;
        assert!(repost.is_accepted());
        v.claim(&repost, t0() + Duration::seconds(5)).unwrap();
    }
}
