//! Tokenizer shared by both extraction passes.
//!
//! Works line by line. Parenthesised annotations such as `(100pips)` are
//! dropped, `#` followed by whitespace starts a comment, `#XAUUSD` hashtags
//! keep their word, and slash-joined words (`S/L`, `XAU/USD`) collapse into one.

use std::collections::HashSet;
use std::str::FromStr;

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// ASCII letters and digits, original case kept
    Word(String),
    Number(Decimal),
    Percent,
    /// One of `@ : - =`
    Mark(char),
}

impl Token {
    pub fn word(&self) -> Option<&str> {
        match self {
            Self::Word(w) => Some(w),
            _ => None,
        }
    }


    /// Case-insensitive keyword match.
    pub fn is_word(&self, keyword: &str) -> bool {
        self.word().map_or(false, |w| w.eq_ignore_ascii_case(keyword))
    }

    pub fn is_mark(&self, mark: char) -> bool {
        matches!(self, Self::Mark(c) if *c == mark)
    }
}

/// One non-empty line of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub text: String,
    pub tokens: Vec<Token>,
}

pub fn lex(text: &str) -> Vec<Line> {
    text.lines()
        .filter_map(|raw| {
            let tokens = lex_line(raw);
            if tokens.is_empty() {
                None
            } else {
                Some(Line {
                    text: raw.trim().to_string(),
                    tokens,
                })
            }
        })
        .collect()
}

fn lex_line(line: &str) -> Vec<Token> {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let is_digit_at = |i: usize| i < len && chars[i].is_ascii_digit();

    let mut tokens = Vec::new();
    let mut i = 0;
    while i < len {
        let c = chars[i];

        if c == '(' {
            let mut depth = 0usize;
            while i < len {
                match chars[i] {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            i += 1;
            continue;
        }

        if c == '#' {
            if i + 1 < len && chars[i + 1].is_ascii_alphabetic() {
                i += 1;
                continue;
            }
            break;
        }

        if c.is_ascii_digit() || (c == '.' && is_digit_at(i + 1)) {
            let start = i;
            let mut seen_dot = false;
            while i < len {
                let ch = chars[i];
                if ch.is_ascii_digit() {
                    i += 1;
                } else if ch == '.' && !seen_dot && is_digit_at(i + 1) {
                    seen_dot = true;
                    i += 1;
                } else if ch == ','
                    && !seen_dot
                    && is_digit_at(i + 1)
                    && is_digit_at(i + 2)
                    && is_digit_at(i + 3)
                    && !is_digit_at(i + 4)
                {
                    // thousands separator
                    i += 1;
                } else {
                    break;
                }
            }
            let literal: String = chars[start..i].iter().filter(|ch| **ch != ',').collect();
            if let Ok(value) = Decimal::from_str(&literal) {
                tokens.push(Token::Number(value));
            }
            continue;
        }

        if c.is_ascii_alphabetic() {
            let mut word = String::new();
            loop {
                while i < len && chars[i].is_ascii_alphanumeric() {
                    word.push(chars[i]);
                    i += 1;
                }
                if i + 1 < len && chars[i] == '/' && chars[i + 1].is_ascii_alphabetic() {
                    i += 1;
                    continue;
                }
                break;
            }
            tokens.push(Token::Word(word));
            continue;
        }

        match c {
            '%' => tokens.push(Token::Percent),
            '@' | ':' | '-' | '=' => tokens.push(Token::Mark(c)),
            _ => {}
        }
        i += 1;
    }
    tokens
}

/// Words that look like tickers but are field keywords.
const RESERVED: &[&str] = &[
    "BUY", "SELL", "LONG", "SHORT", "NOW", "ENTER", "ENTRY", "STOP", "LOSS", "STOPLOSS",
    "TARGET", "TAKE", "PROFIT", "TAKEPROFIT", "TGT", "MAX", "RISK", "PRICE", "LIMIT", "MARKET",
    "PIPS", "PIP", "ZONE", "CLOSE", "NEW", "SIGNAL", "UPDATE", "LOT", "LOTS", "AND", "THE",
];

/// Recognises instrument symbols, optionally restricted to a configured universe.
#[derive(Debug, Clone, Default)]
pub struct SymbolMatcher {
    universe: HashSet<String>,
}

impl SymbolMatcher {
    pub fn new<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            universe: symbols
                .into_iter()
                .map(|s| s.as_ref().to_ascii_uppercase())
                .collect(),
        }
    }

    /// Normalised symbol for a word, if the word names one.
    ///
    /// With a universe configured, membership decides (case-insensitive).
    /// Otherwise an all-caps word of 3 to 12 characters with at least three
    /// letters that is not a keyword counts.
    pub fn matches(&self, raw: &str) -> Option<String> {
        let upper = raw.to_ascii_uppercase();
        if !self.universe.is_empty() {
            return self.universe.contains(&upper).then_some(upper);
        }

        let letters = raw.chars().filter(|c| c.is_ascii_alphabetic()).count();
        let shaped = (3..=12).contains(&raw.len())
            && letters >= 3
            && raw.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if shaped && !RESERVED.contains(&upper.as_str()) {
            Some(upper)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lex_canonical_lines() {
        let lines = lex("XAUUSD buy now\nEnter 3232\n\nSL 3176 (100pips)\nTP4 3333.50 (1000)\nMax 0.25%");
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[0].tokens,
            vec![
                Token::Word("XAUUSD".into()),
                Token::Word("buy".into()),
                Token::Word("now".into())
            ]
        );
        assert_eq!(lines[2].tokens, vec![Token::Word("SL".into()), Token::Number(dec!(3176))]);
        assert_eq!(lines[3].tokens, vec![Token::Word("TP4".into()), Token::Number(dec!(3333.50))]);
        assert_eq!(
            lines[4].tokens,
            vec![Token::Word("Max".into()), Token::Number(dec!(0.25)), Token::Percent]
        );
    }

    #[test]
    fn test_lex_comments_and_joins() {
        let lines = lex("#XAUUSD S/L: 3,232.5 # old level\nXAU/USD @ 3240.");
        assert_eq!(
            lines[0].tokens,
            vec![
                Token::Word("XAUUSD".into()),
                Token::Word("SL".into()),
                Token::Mark(':'),
                Token::Number(dec!(3232.5)),
            ]
        );
        assert_eq!(
            lines[1].tokens,
            vec![Token::Word("XAUUSD".into()), Token::Mark('@'), Token::Number(dec!(3240))]
        );
    }

    #[test]
    fn test_symbol_matcher() {
        let open = SymbolMatcher::default();
        assert_eq!(open.matches("XAUUSD"), Some("XAUUSD".to_string()));
        assert_eq!(open.matches("US30"), Some("US30".to_string()));
        assert_eq!(open.matches("BUY"), None);
        assert_eq!(open.matches("TP1"), None);
        assert_eq!(open.matches("xauusd"), None);

        let universe = SymbolMatcher::new(["XAUUSD", "EURUSD"]);
        assert_eq!(universe.matches("xauusd"), Some("XAUUSD".to_string()));
        assert_eq!(universe.matches("GBPUSD"), None);
    }
}
