//! Text normalization and tokenization.
//!
//! Tokens keep the byte span of the source text they came from so that audio
//! chunks can report text positions back to the host.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

/// Zero-width non-joiner, used inside Persian words.
pub const ZWNJ: char = '\u{200C}';

const TATWEEL: char = '\u{0640}';

/// Anything that is not whitespace, a ZWNJ or one of the classes before it becomes a symbol.
static TOKEN_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"(?P<word>[\p{L}\p{M}][\p{L}\p{M}\x{200C}]*)|(?P<num>\p{Nd}+)|(?P<punct>[.,!?;:،؛؟…])|(?P<br>\n)|(?P<other>[^\s\x{200C}])")
});

const PERSIAN_DIGITS: [&str; 10] = ["صفر", "یک", "دو", "سه", "چهار", "پنج", "شش", "هفت", "هشت", "نه"];
const ENGLISH_DIGITS: [&str; 10] = ["zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    Punctuation,
    /// Hard line break; ends a sentence without producing a phoneme.
    SentenceBreak,
    /// Single character outside the other classes (`%`, `@`, emoji, ...).
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Normalized text.
    pub text: String,
    /// Byte range in the original utterance text.
    pub span: Range<usize>,
    pub kind: TokenKind,
    /// Pronunciation chosen by homograph resolution.
    pub pronunciation: Option<String>,
    /// Set when an Ezafe marker follows this word.
    pub ezafe: bool,
}

impl Token {
    pub fn new(text: impl Into<String>, span: Range<usize>, kind: TokenKind) -> Self {
        Self { text: text.into(), span, kind, pronunciation: None, ezafe: false }
    }

    pub fn is_word(&self) -> bool {
        self.kind == TokenKind::Word
    }

    /// Whether this token closes a sentence.
    pub fn ends_sentence(&self) -> bool {
        match self.kind {
            TokenKind::SentenceBreak => true,
            TokenKind::Punctuation => matches!(self.text.as_str(), "." | "!" | "?"),
            TokenKind::Word | TokenKind::Symbol => false,
        }
    }
}

/// Normalize a word: NFC, unify Arabic letter variants with their Persian forms, drop tatweel.
pub fn normalize_word(word: &str) -> String {
    word.nfc()
        .filter(|c| *c != TATWEEL)
        .map(|c| match c {
            '\u{064A}' | '\u{0649}' => 'ی',
            '\u{0643}' => 'ک',
            '\u{06C0}' => 'ه',
            other => other,
        })
        .collect()
}

fn normalize_punctuation(mark: &str) -> &'static str {
    match mark {
        "." | "…" => ".",
        "," | "،" => ",",
        "!" => "!",
        "?" | "؟" => "?",
        ";" | "؛" => ";",
        _ => ":",
    }
}

fn digit_value(c: char) -> Option<usize> {
    match c {
        '0'..='9' => Some(c as usize - '0' as usize),
        '\u{06F0}'..='\u{06F9}' => Some(c as usize - 0x06F0),
        '\u{0660}'..='\u{0669}' => Some(c as usize - 0x0660),
        _ => None,
    }
}

/// Spell a digit string one digit at a time in the voice language.
///
/// Languages without a digit table keep the raw digits.
fn expand_number(digits: &str, language: &str) -> Vec<String> {
    let table = match language {
        "fa" => &PERSIAN_DIGITS,
        "en" => &ENGLISH_DIGITS,
        _ => return vec![digits.to_string()],
    };
    digits.chars().map(|c| digit_value(c).map(|d| table[d].to_string()).unwrap_or_else(|| c.to_string())).collect()
}

/// Split `text` into normalized tokens.
///
/// # Arguments
/// * `text` - Raw utterance text
/// * `language` - Primary language subtag of the target voice (`fa`, `en`, ...)
pub fn tokenize(text: &str, language: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let pattern = match TOKEN_RE.as_ref() {
        Ok(pattern) => pattern,
        Err(e) => {
            warn!("Token pattern failed to compile: {}", e);
            return tokens;
        }
    };

    for caps in pattern.captures_iter(text) {
        if let Some(m) = caps.name("word") {
            tokens.push(Token::new(normalize_word(m.as_str()), m.range(), TokenKind::Word));
        } else if let Some(m) = caps.name("num") {
            for word in expand_number(m.as_str(), language) {
                tokens.push(Token::new(word, m.range(), TokenKind::Word));
            }
        } else if let Some(m) = caps.name("punct") {
            tokens.push(Token::new(normalize_punctuation(m.as_str()), m.range(), TokenKind::Punctuation));
        } else if let Some(m) = caps.name("br") {
            tokens.push(Token::new("\n", m.range(), TokenKind::SentenceBreak));
        } else if let Some(m) = caps.name("other") {
            tokens.push(Token::new(m.as_str(), m.range(), TokenKind::Symbol));
        }
    }

    tokens
}

/// Index of the nearest word before `index` in the same sentence.
pub fn previous_word(tokens: &[Token], index: usize) -> Option<usize> {
    tokens[..index].iter().rposition(|t| t.is_word() || t.ends_sentence()).filter(|&i| tokens[i].is_word())
}

/// Index of the nearest word after `index` in the same sentence.
pub fn next_word(tokens: &[Token], index: usize) -> Option<usize> {
    let offset = index + 1;
    tokens[offset..].iter().position(|t| t.is_word() || t.ends_sentence()).map(|i| i + offset).filter(|&i| tokens[i].is_word())
}
