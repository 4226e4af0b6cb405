//! Strict pass: each line is either one canonical field or commentary.
//!
//! Canonical lines:
//! - `SYMBOL DIRECTION [now]`
//! - `Enter|Entry [:] PRICE [- PRICE]`
//! - `SL [:] PRICE`
//! - `TP[n] [:] PRICE` (a bare `TP` takes the next free index)
//! - `Max|Risk [:] PCT% ...`

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::lexer::{Line, SymbolMatcher, Token};
use crate::models::Direction;

/// Largest percentage either pass reads as a risk note.
const MAX_RISK_PERCENT: Decimal = Decimal::TEN;

/// Whether `pct` is a plausible per-trade risk percentage.
pub(super) fn is_risk_percent(pct: Decimal) -> bool {
    pct > Decimal::ZERO && pct <= MAX_RISK_PERCENT
}

/// Fields pulled out of one message by either pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub symbol: Option<String>,
    pub direction: Option<Direction>,
    pub entry: Option<Decimal>,
    pub stop: Option<Decimal>,
    pub targets: BTreeMap<u8, Decimal>,
    pub risk_note: Option<String>,
    pub risk_percent: Option<Decimal>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none()
            && self.direction.is_none()
            && self.entry.is_none()
            && self.stop.is_none()
            && self.targets.is_empty()
            && self.risk_percent.is_none()
    }

    /// Every field a trade needs.
    pub fn is_complete(&self) -> bool {
        self.symbol.is_some()
            && self.direction.is_some()
            && self.entry.is_some()
            && self.stop.is_some()
            && !self.targets.is_empty()
    }

    /// Copy every field present in `other` over this one.
    pub fn overlay(&mut self, other: &Extraction) {
        if other.symbol.is_some() {
            self.symbol = other.symbol.clone();
        }
        if other.direction.is_some() {
            self.direction = other.direction;
        }
        if other.entry.is_some() {
            self.entry = other.entry;
        }
        if other.stop.is_some() {
            self.stop = other.stop;
        }
        for (index, price) in &other.targets {
            self.targets.insert(*index, *price);
        }
        if other.risk_percent.is_some() {
            self.risk_percent = other.risk_percent;
            self.risk_note = other.risk_note.clone();
        }
    }

    pub(crate) fn next_target_index(&self) -> u8 {
        self.targets
            .keys()
            .next_back()
            .map_or(1, |last| last.saturating_add(1))
    }
}

pub fn parse(lines: &[Line], symbols: &SymbolMatcher) -> Extraction {
    let mut out = Extraction::default();

    for line in lines {
        let tokens = line.tokens.as_slice();

        if let Some((symbol, direction)) = header(tokens, symbols) {
            out.symbol = Some(symbol);
            out.direction = Some(direction);
        } else if let Some(price) = keyed_price(tokens, &["enter", "entry"], true) {
            out.entry = Some(price);
        } else if let Some(price) = keyed_price(tokens, &["sl"], false) {
            out.stop = Some(price);
        } else if let Some((index, price)) = target(tokens) {
            let index = index.unwrap_or_else(|| out.next_target_index());
            out.targets.insert(index, price);
        } else if let Some(percent) = risk_percent(tokens) {
            out.risk_percent = Some(percent);
            out.risk_note = Some(line.text.clone());
        }
    }

    out
}

fn header(tokens: &[Token], symbols: &SymbolMatcher) -> Option<(String, Direction)> {
    let (symbol, direction, rest) = match tokens {
        [Token::Word(s), Token::Word(d), rest @ ..] => (s, d, rest),
        _ => return None,
    };
    let trailing_ok = match rest {
        [] => true,
        [t] => t.is_word("now") || t.is_word("market"),
        _ => false,
    };
    if !trailing_ok {
        return None;
    }
    Some((symbols.matches(symbol)?, Direction::parse(direction)?))
}

/// `KEYWORD [:] PRICE`, optionally followed by `- PRICE` when `allow_zone` is set.
fn keyed_price(tokens: &[Token], keywords: &[&str], allow_zone: bool) -> Option<Decimal> {
    let (first, rest) = tokens.split_first()?;
    if !keywords.iter().any(|k| first.is_word(k)) {
        return None;
    }
    let rest = skip_colon(rest);
    match rest {
        [Token::Number(price)] => Some(*price),
        [Token::Number(price), Token::Mark('-'), Token::Number(_)] if allow_zone => Some(*price),
        _ => None,
    }
}

fn target(tokens: &[Token]) -> Option<(Option<u8>, Decimal)> {
    let (first, rest) = tokens.split_first()?;
    let word = first.word()?;
    if word.len() < 2 || !word[..2].eq_ignore_ascii_case("tp") {
        return None;
    }
    let suffix = &word[2..];
    let index = if suffix.is_empty() {
        None
    } else {
        Some(suffix.parse::<u8>().ok().filter(|i| *i > 0)?)
    };
    match skip_colon(rest) {
        [Token::Number(price)] => Some((index, *price)),
        _ => None,
    }
}

fn risk_percent(tokens: &[Token]) -> Option<Decimal> {
    let (first, rest) = tokens.split_first()?;
    if !(first.is_word("max") || first.is_word("risk")) {
        return None;
    }
    match skip_colon(rest) {
        [Token::Number(pct), Token::Percent, ..] if is_risk_percent(*pct) => Some(*pct),
        _ => None,
    }
}

fn skip_colon(tokens: &[Token]) -> &[Token] {
    match tokens {
        [Token::Mark(':'), rest @ ..] => rest,
        _ => tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::lexer::lex;
    use rust_decimal_macros::dec;

    fn strict(text: &str) -> Extraction {
        parse(&lex(text), &SymbolMatcher::default())
    }

    #[test]
    fn test_canonical_message() {
        let out = strict(
            "XAUUSD buy now\nEnter 3232\nSL 3220\nTP1 3235\nTP2 3239\nTP3 3255\nTP4 3333.50 (1000)\nMax 0.25%",
        );
        assert!(out.is_complete());
        assert_eq!(out.symbol.as_deref(), Some("XAUUSD"));
        assert_eq!(out.direction, Some(Direction::Long));
        assert_eq!(out.entry, Some(dec!(3232)));
        assert_eq!(out.stop, Some(dec!(3220)));
        assert_eq!(out.targets.len(), 4);
        assert_eq!(out.targets[&4], dec!(3333.50));
        assert_eq!(out.risk_percent, Some(dec!(0.25)));
        assert_eq!(out.risk_note.as_deref(), Some("Max 0.25%"));
    }

    #[test]
    fn test_comments_and_mixed_case_keywords() {
        let out = strict("XAUUSD sell\nGood luck everyone\nEntry: 3250\nSL 3262 (120pips)\nTp2 3240\nTP 3230");
        assert_eq!(out.direction, Some(Direction::Short));
        assert_eq!(out.stop, Some(dec!(3262)));
        assert_eq!(out.targets.get(&2), Some(&dec!(3240)));
        assert_eq!(out.targets.get(&3), Some(&dec!(3230)));
        assert!(out.is_complete());
    }

    #[test]
    fn test_noncanonical_lines_are_commentary() {
        let out = strict("Gold buy now at 3232\nstop loss 3220\ntake profit 3240");
        assert!(out.is_empty());
    }

    #[test]
    fn test_risk_note_bounds() {
        assert_eq!(strict("Max 10%").risk_percent, Some(dec!(10)));
        assert_eq!(strict("Max 50%").risk_percent, None);
        assert_eq!(strict("Risk: 0%").risk_percent, None);
    }

    #[test]
    fn test_overlay_keeps_existing_targets() {
        let mut base = strict("XAUUSD buy\nTP1 3235\nTP2 3239");
        let edit = strict("TP5 3400");
        base.overlay(&edit);
        assert_eq!(base.targets.len(), 3);
        assert_eq!(base.next_target_index(), 6);
    }
}
