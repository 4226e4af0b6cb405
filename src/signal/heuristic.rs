//! Permissive fallback pass.
//!
//! Looks for field keywords anywhere in a line (case-insensitive, with the
//! usual synonyms) and takes the nearest number after them.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::grammar::{is_risk_percent, Extraction};
use super::lexer::{Line, SymbolMatcher, Token};
use crate::models::Direction;

/// Tokens scanned after a keyword when looking for its number.
const PROXIMITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Target(Option<u8>),
    Stop,
    Entry,
}

pub fn parse(lines: &[Line], symbols: &SymbolMatcher) -> Extraction {
    let mut out = Extraction::default();
    let mut price_after_direction = None;

    for line in lines {
        let tokens = line.tokens.as_slice();
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];

            if let Some(word) = token.word() {
                if out.symbol.is_none() {
                    out.symbol = symbols.matches(word);
                }
                if out.direction.is_none() && is_direction_word(word) {
                    out.direction = Direction::parse(word);
                    if price_after_direction.is_none() {
                        price_after_direction = numbers_after(tokens, i + 1, symbols).first().copied();
                    }
                }
            }

            if let Token::Number(pct) = token {
                if tokens.get(i + 1) == Some(&Token::Percent)
                    && out.risk_percent.is_none()
                    && is_risk_percent(*pct)
                {
                    out.risk_percent = Some(*pct);
                    out.risk_note = Some(line.text.clone());
                }
            }

            if let Some((field, consumed)) = classify(tokens, i) {
                let numbers = numbers_after(tokens, i + consumed, symbols);
                assign(&mut out, field, &numbers);
                i += consumed;
                continue;
            }
            i += 1;
        }
    }

    if out.entry.is_none() {
        out.entry = price_after_direction;
    }
    out
}

fn is_direction_word(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "buy" | "sell" | "long" | "short"
    )
}

/// Field keyword starting at `i`, with the number of tokens it spans.
fn classify(tokens: &[Token], i: usize) -> Option<(Field, usize)> {
    let token = &tokens[i];
    if token.is_mark('@') {
        return Some((Field::Entry, 1));
    }
    let word = token.word()?.to_ascii_lowercase();
    let next_is = |k: &str| tokens.get(i + 1).map_or(false, |t| t.is_word(k));

    match word.as_str() {
        "tp" | "tgt" | "target" | "takeprofit" => return Some((Field::Target(None), 1)),
        "take" if next_is("profit") => return Some((Field::Target(None), 2)),
        "sl" | "stoploss" => return Some((Field::Stop, 1)),
        "stop" if next_is("loss") => return Some((Field::Stop, 2)),
        "stop" => return Some((Field::Stop, 1)),
        "entry" | "enter" | "price" | "at" => return Some((Field::Entry, 1)),
        _ => {}
    }

    for prefix in ["tp", "tgt", "target"] {
        if let Some(suffix) = word.strip_prefix(prefix) {
            if let Ok(index) = suffix.parse::<u8>() {
                if index > 0 {
                    return Some((Field::Target(Some(index)), 1));
                }
            }
        }
    }
    None
}

/// Numbers within reach of position `start`. Filler words and a symbol may
/// sit in between; any other word ends the search.
fn numbers_after(tokens: &[Token], start: usize, symbols: &SymbolMatcher) -> Vec<Decimal> {
    let mut found = Vec::new();
    for token in tokens.iter().skip(start).take(PROXIMITY) {
        match token {
            Token::Number(n) => {
                found.push(*n);
                if found.len() == 2 {
                    break;
                }
            }
            Token::Mark(_) => {}
            Token::Word(w) if found.is_empty() && (is_filler(w) || symbols.matches(w).is_some()) => {}
            _ => break,
        }
    }
    found
}

fn is_filler(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "now" | "at" | "limit" | "market" | "zone" | "is"
    )
}

fn assign(out: &mut Extraction, field: Field, numbers: &[Decimal]) {
    let Some(&first) = numbers.first() else {
        return;
    };
    match field {
        Field::Entry => {
            if out.entry.is_none() {
                out.entry = Some(first);
            }
        }
        Field::Stop => {
            if out.stop.is_none() {
                out.stop = Some(first);
            }
        }
        Field::Target(index) => {
            // "Target 2: 3239" carries its index as a separate number
            let explicit = index.map(|i| (i, first)).or_else(|| {
                let second = *numbers.get(1)?;
                let i = small_index(first)?;
                (second > first).then_some((i, second))
            });
            let (index, price) = explicit.unwrap_or_else(|| (out.next_target_index(), first));
            out.targets.entry(index).or_insert(price);
        }
    }
}

fn small_index(value: Decimal) -> Option<u8> {
    if value.scale() != 0 {
        return None;
    }
    value.to_u8().filter(|i| (1..=9).contains(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::lexer::lex;
    use rust_decimal_macros::dec;

    fn loose(text: &str) -> Extraction {
        parse(&lex(text), &SymbolMatcher::default())
    }

    #[test]
    fn test_free_form_message() {
        let out = loose("Gold XAUUSD buy now at 3232\nstop loss 3220\ntake profit 3235, target 2: 3239");
        assert_eq!(out.symbol.as_deref(), Some("XAUUSD"));
        assert_eq!(out.direction, Some(Direction::Long));
        assert_eq!(out.entry, Some(dec!(3232)));
        assert_eq!(out.stop, Some(dec!(3220)));
        assert_eq!(out.targets.get(&1), Some(&dec!(3235)));
        assert_eq!(out.targets.get(&2), Some(&dec!(3239)));
    }

    #[test]
    fn test_single_line_shorthand() {
        let out = loose("SELL EURUSD @ 1.0850 S/L 1.0900 T/P 1.0800 t/p2 1.0750 risk 0.5%");
        assert_eq!(out.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(out.direction, Some(Direction::Short));
        assert_eq!(out.entry, Some(dec!(1.0850)));
        assert_eq!(out.stop, Some(dec!(1.0900)));
        assert_eq!(out.targets.get(&1), Some(&dec!(1.0800)));
        assert_eq!(out.targets.get(&2), Some(&dec!(1.0750)));
        assert_eq!(out.risk_percent, Some(dec!(0.5)));
    }

    #[test]
    fn test_implausible_percentage_is_not_a_risk_note() {
        let out = loose("XAUUSD buy 3232, 50% of the move done");
        assert_eq!(out.risk_percent, None);
        assert_eq!(out.risk_note, None);
    }

    #[test]
    fn test_price_after_direction() {
        let out = loose("BUY XAUUSD 3232\nsl 3220\ntp 3240");
        assert_eq!(out.entry, Some(dec!(3232)));
        assert_eq!(out.targets.get(&1), Some(&dec!(3240)));
    }

    #[test]
    fn test_nothing_recognisable() {
        assert!(loose("good morning traders, market update later").is_empty());
    }
}
