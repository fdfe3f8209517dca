//! Grapheme-to-phoneme mapping for a target voice.
//!
//! Words are mapped by rule (Persian letter table, Latin identity) unless a
//! pronunciation was already chosen upstream. Every phoneme must belong to the
//! voice's phoneme set; a word that cannot be expressed collapses to the voice's
//! fallback symbol instead of failing the utterance.

use std::ops::Range;

use tracing::debug;

use super::token::{Token, TokenKind, ZWNJ};
use crate::error::{Result, SynthError};
use crate::voice::{BOS, EOS, PAD, VoiceMetadata};

const WORD_SEPARATOR: &str = " ";
const VOWELS: [&str; 6] = ["a", "e", "i", "o", "u", "ɒ"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phoneme {
    pub symbol: String,
    /// Byte range of the source text this phoneme was produced from.
    pub span: Range<usize>,
}

/// Phonemes for one utterance, split into sentences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhonemeSequence {
    phonemes: Vec<Phoneme>,
    sentence_ends: Vec<usize>,
    degraded_tokens: usize,
}

impl PhonemeSequence {
    pub fn phonemes(&self) -> &[Phoneme] {
        &self.phonemes
    }

    pub fn len(&self) -> usize {
        self.phonemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phonemes.is_empty()
    }

    /// Number of words replaced by the fallback symbol.
    pub fn degraded_tokens(&self) -> usize {
        self.degraded_tokens
    }

    /// Non-empty sentences in order.
    pub fn sentences(&self) -> Vec<&[Phoneme]> {
        let mut start = 0;
        let mut out = Vec::with_capacity(self.sentence_ends.len());
        for &end in &self.sentence_ends {
            let sentence = trim_separators(&self.phonemes[start..end]);
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
        out
    }

    /// Symbols joined without separators, for logging.
    pub fn to_symbol_string(&self) -> String {
        self.phonemes.iter().map(|p| p.symbol.as_str()).collect()
    }

    fn push(&mut self, symbol: impl Into<String>, span: Range<usize>) {
        self.phonemes.push(Phoneme { symbol: symbol.into(), span });
    }

    fn end_sentence(&mut self) {
        let len = self.phonemes.len();
        if self.sentence_ends.last().is_none_or(|&last| last < len) {
            self.sentence_ends.push(len);
        }
    }
}

fn trim_separators(sentence: &[Phoneme]) -> &[Phoneme] {
    let start = sentence.iter().position(|p| p.symbol != WORD_SEPARATOR).unwrap_or(sentence.len());
    let end = sentence.iter().rposition(|p| p.symbol != WORD_SEPARATOR).map_or(start, |i| i + 1);
    &sentence[start..end]
}

/// Model input ids for one sentence: `^ _ (ids(p) _)* $`.
pub fn sentence_ids(sentence: &[Phoneme], metadata: &VoiceMetadata) -> Vec<i64> {
    let map = &metadata.phoneme_id_map;
    let pad = map.get(PAD).cloned().unwrap_or_default();

    let mut ids = map.get(BOS).cloned().unwrap_or_default();
    ids.extend_from_slice(&pad);
    for phoneme in sentence {
        if let Some(phoneme_ids) = map.get(&phoneme.symbol) {
            ids.extend_from_slice(phoneme_ids);
            ids.extend_from_slice(&pad);
        }
    }
    ids.extend(map.get(EOS).cloned().unwrap_or_default());
    ids
}

fn consonant(c: char) -> Option<&'static str> {
    Some(match c {
        'ب' => "b",
        'پ' => "p",
        'ت' | 'ط' => "t",
        'ث' | 'س' | 'ص' => "s",
        'ج' => "dʒ",
        'چ' => "tʃ",
        'ح' => "h",
        'خ' => "x",
        'د' => "d",
        'ذ' | 'ز' | 'ض' | 'ظ' => "z",
        'ر' => "ɾ",
        'ژ' => "ʒ",
        'ش' => "ʃ",
        'ع' | 'ء' | 'ئ' | 'أ' | 'ؤ' | 'إ' => "ʔ",
        'غ' => "ɣ",
        'ف' => "f",
        'ق' => "ɢ",
        'ک' => "k",
        'گ' => "ɡ",
        'ل' => "l",
        'م' => "m",
        'ن' => "n",
        _ => return None,
    })
}

fn is_vowel_letter(c: char) -> bool {
    matches!(c, 'ا' | 'آ' | 'و' | 'ی')
}

/// Rule-based phonemes for a word, or the first grapheme that has no rule.
fn word_phonemes(word: &str) -> std::result::Result<Vec<String>, char> {
    let chars: Vec<char> = word.chars().filter(|c| *c != ZWNJ).collect();
    if chars.as_slice() == ['و'] {
        return Ok(vec!["v".into(), "a".into()]);
    }

    let mut out: Vec<String> = Vec::with_capacity(chars.len() + 2);
    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).map(|j| chars[j]);
        let next = chars.get(i + 1).copied();

        match c {
            'a'..='z' => out.push(c.to_string()),
            'A'..='Z' => out.push(c.to_ascii_lowercase().to_string()),
            'ا' if i == 0 => {
                out.push("ʔ".into());
                if !matches!(next, Some('ی' | 'و')) {
                    out.push("a".into());
                }
            }
            'ا' => out.push("ɒ".into()),
            'آ' => {
                if i == 0 {
                    out.push("ʔ".into());
                }
                out.push("ɒ".into());
            }
            'و' => {
                let vowel = match prev {
                    None => false,
                    Some('ا') if i == 1 => true,
                    Some(p) if is_vowel_letter(p) => false,
                    Some(_) => !next.is_some_and(is_vowel_letter),
                };
                out.push(if vowel { "u" } else { "v" }.into());
            }
            'ی' => {
                let vowel = match prev {
                    None => false,
                    Some('ا') if i == 1 => true,
                    Some(p) if is_vowel_letter(p) => false,
                    Some(_) => !next.is_some_and(is_vowel_letter),
                };
                out.push(if vowel { "i" } else { "j" }.into());
            }
            'ه' | 'ة' => {
                let silent = i + 1 == chars.len() && i > 0 && prev.is_some_and(|p| !is_vowel_letter(p));
                out.push(if silent || c == 'ة' { "e" } else { "h" }.into());
            }
            '\u{064E}' => out.push("a".into()),
            '\u{0650}' => out.push("e".into()),
            '\u{064F}' => out.push("o".into()),
            '\u{064B}' => {
                out.push("a".into());
                out.push("n".into());
            }
            '\u{0651}' => {
                if let Some(last) = out.last().cloned() {
                    out.push(last);
                }
            }
            '\u{0652}' | '\u{0654}' => {}
            '\u{0670}' => out.push("ɒ".into()),
            other => match consonant(other) {
                Some(p) => out.push(p.into()),
                None => return Err(other),
            },
        }
    }
    Ok(out)
}

fn pronunciation_phonemes(pronunciation: &str) -> Vec<String> {
    if pronunciation.contains(char::is_whitespace) {
        pronunciation.split_whitespace().map(str::to_string).collect()
    } else {
        pronunciation.chars().map(|c| c.to_string()).collect()
    }
}

/// Express `symbols` in the voice's inventory.
///
/// Multi-character symbols the voice lacks (`dʒ`) are split into their
/// characters when each of those is known. Returns `None` if anything is left over.
fn fit_to_voice(symbols: Vec<String>, metadata: &VoiceMetadata) -> Option<Vec<String>> {
    let map = &metadata.phoneme_id_map;
    let mut fitted = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        if map.contains_key(&symbol) {
            fitted.push(symbol);
        } else if symbol.chars().count() > 1 && symbol.chars().all(|c| map.contains_key(&c.to_string())) {
            fitted.extend(symbol.chars().map(|c| c.to_string()));
        } else {
            return None;
        }
    }
    Some(fitted)
}

fn ezafe_phonemes(after_vowel: bool) -> &'static [&'static str] {
    if after_vowel { &["j", "e"] } else { &["e"] }
}

/// Map tokens to phonemes supported by the voice.
///
/// Symbols map to the fallback phoneme and count as degraded tokens.
///
/// # Errors
/// Returns `UnsupportedGrapheme` only if a word needs the fallback symbol and
/// the voice does not define it.
pub fn phonemize(tokens: &[Token], metadata: &VoiceMetadata) -> Result<PhonemeSequence> {
    let mut sequence = PhonemeSequence::default();
    let separator = metadata.phoneme_id_map.contains_key(WORD_SEPARATOR);
    let fallback = metadata.fallback_phoneme();

    for token in tokens {
        match token.kind {
            TokenKind::SentenceBreak => {
                sequence.end_sentence();
            }
            TokenKind::Punctuation => {
                if metadata.phoneme_id_map.contains_key(&token.text) {
                    sequence.push(token.text.clone(), token.span.clone());
                }
                if token.ends_sentence() {
                    sequence.end_sentence();
                }
            }
            TokenKind::Symbol => {
                if separator && sequence.phonemes.last().is_some_and(|p| p.symbol != WORD_SEPARATOR) {
                    sequence.push(WORD_SEPARATOR, token.span.clone());
                }

                sequence.degraded_tokens += 1;
                if metadata.phoneme_id_map.contains_key(fallback) {
                    debug!(token = %token.text, fallback, "Symbol without pronunciation, using fallback phoneme");
                    sequence.push(fallback, token.span.clone());
                } else {
                    debug!(token = %token.text, "Symbol without pronunciation skipped");
                }
            }
            TokenKind::Word => {
                if separator && sequence.phonemes.last().is_some_and(|p| p.symbol != WORD_SEPARATOR) {
                    sequence.push(WORD_SEPARATOR, token.span.clone());
                }

                let symbols = match token.pronunciation {
                    Some(ref pronunciation) => Ok(pronunciation_phonemes(pronunciation)),
                    None => word_phonemes(&token.text),
                };

                let (fitted, unsupported) = match symbols {
                    Ok(symbols) => match fit_to_voice(symbols, metadata) {
                        Some(fitted) if !fitted.is_empty() => (fitted, None),
                        _ => (Vec::new(), token.text.chars().find(|c| !metadata.phoneme_id_map.contains_key(&c.to_string()))),
                    },
                    Err(grapheme) => (Vec::new(), Some(grapheme)),
                };

                if fitted.is_empty() {
                    if !metadata.phoneme_id_map.contains_key(fallback) {
                        return Err(SynthError::UnsupportedGrapheme { token: token.text.clone(), grapheme: unsupported.unwrap_or_default() });
                    }
                    debug!(token = %token.text, grapheme = ?unsupported, fallback, "Unsupported grapheme, using fallback phoneme");
                    sequence.degraded_tokens += 1;
                    sequence.push(fallback, token.span.clone());
                    continue;
                }

                let last_vowel = fitted.last().map(String::as_str).is_some_and(|p| VOWELS.contains(&p));
                for symbol in fitted {
                    sequence.push(symbol, token.span.clone());
                }

                if token.ezafe {
                    let marker = ezafe_phonemes(last_vowel);
                    if marker.iter().all(|p| metadata.phoneme_id_map.contains_key(*p)) {
                        for p in marker {
                            sequence.push(*p, token.span.clone());
                        }
                    }
                }
            }
        }
    }

    sequence.end_sentence();
    Ok(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::token::tokenize;

    fn metadata(symbols: &[&str]) -> VoiceMetadata {
        let mut map = serde_json::Map::new();
        for (id, symbol) in ["_", "^", "$", " "].iter().chain(symbols.iter()).enumerate() {
            map.insert(symbol.to_string(), serde_json::json!([id]));
        }
        serde_json::from_value(serde_json::json!({ "phoneme_id_map": map })).unwrap()
    }

    fn persian() -> VoiceMetadata {
        metadata(&["a", "e", "i", "o", "u", "ɒ", "b", "d", "k", "t", "m", "n", "ɾ", "s", "ʃ", "ʔ", "j", "v", "z", "x", "ʒ", "h", ".", ",", "?"])
    }

    fn symbols(sequence: &PhonemeSequence) -> Vec<&str> {
        sequence.phonemes().iter().map(|p| p.symbol.as_str()).collect()
    }

    #[test]
    fn test_persian_word_rules() {
        let seq = phonemize(&tokenize("کتاب", "fa"), &persian()).unwrap();
        assert_eq!(symbols(&seq), vec!["k", "t", "ɒ", "b"]);

        let seq = phonemize(&tokenize("این", "fa"), &persian()).unwrap();
        assert_eq!(symbols(&seq), vec!["ʔ", "i", "n"]);

        let seq = phonemize(&tokenize("خانه", "fa"), &persian()).unwrap();
        assert_eq!(symbols(&seq), vec!["x", "ɒ", "n", "e"]);
    }

    #[test]
    fn test_spans_point_into_source() {
        let text = "سلام دوست";
        let tokens = tokenize(text, "fa");
        let seq = phonemize(&tokens, &persian()).unwrap();
        let last = seq.phonemes().last().unwrap();
        assert_eq!(&text[last.span.clone()], "دوست");
        assert!(seq.phonemes().iter().any(|p| p.symbol == " "));
    }

    #[test]
    fn test_unknown_graphemes_use_fallback() {
        let meta = metadata(&["a", "b", "c"]);
        let seq = phonemize(&tokenize("abc xyz", "en"), &meta).unwrap();
        assert_eq!(symbols(&seq), vec!["a", "b", "c", " ", "_"]);
        assert_eq!(seq.degraded_tokens(), 1);
    }

    #[test]
    fn test_symbols_count_as_degraded() {
        let meta = metadata(&["a", "b", "c"]);
        let seq = phonemize(&tokenize("ab % c", "en"), &meta).unwrap();
        assert_eq!(symbols(&seq), vec!["a", "b", " ", "_", " ", "c"]);
        assert_eq!(seq.degraded_tokens(), 1);

        let mut meta = metadata(&["a"]);
        meta.fallback_phoneme = Some("#".into());
        let seq = phonemize(&tokenize("a @", "en"), &meta).unwrap();
        assert_eq!(symbols(&seq), vec!["a", " "]);
        assert_eq!(seq.degraded_tokens(), 1);
    }

    #[test]
    fn test_declared_fallback_symbol() {
        let mut meta = metadata(&["a", "?"]);
        meta.fallback_phoneme = Some("?".into());
        let seq = phonemize(&tokenize("☃ξ", "en"), &meta).unwrap();
        assert_eq!(symbols(&seq), vec!["?", " ", "?"]);
        assert_eq!(seq.degraded_tokens(), 2);
    }

    #[test]
    fn test_missing_fallback_is_an_error() {
        let mut meta = metadata(&["a"]);
        meta.fallback_phoneme = Some("#".into());
        let err = phonemize(&tokenize("xyz", "en"), &meta).unwrap_err();
        assert!(matches!(err, SynthError::UnsupportedGrapheme { .. }));
    }

    #[test]
    fn test_resolved_pronunciation_wins() {
        let mut tokens = tokenize("شیر", "fa");
        tokens[0].pronunciation = Some("ʃiɾ".into());
        let seq = phonemize(&tokens, &persian()).unwrap();
        assert_eq!(symbols(&seq), vec!["ʃ", "i", "ɾ"]);
    }

    #[test]
    fn test_ezafe_after_consonant_and_vowel() {
        let mut tokens = tokenize("کتاب من", "fa");
        tokens[0].ezafe = true;
        let seq = phonemize(&tokens, &persian()).unwrap();
        assert_eq!(symbols(&seq), vec!["k", "t", "ɒ", "b", "e", " ", "m", "n"]);

        let mut tokens = tokenize("خانه من", "fa");
        tokens[0].ezafe = true;
        let seq = phonemize(&tokens, &persian()).unwrap();
        assert_eq!(symbols(&seq)[..6], ["x", "ɒ", "n", "e", "j", "e"]);
    }

    #[test]
    fn test_multi_char_phoneme_split_for_char_inventories() {
        let meta = metadata(&["d", "ʒ", "ɒ"]);
        let seq = phonemize(&tokenize("جا", "fa"), &meta).unwrap();
        assert_eq!(symbols(&seq), vec!["d", "ʒ", "ɒ"]);
    }

    #[test]
    fn test_sentences_split_on_terminal_punctuation() {
        let seq = phonemize(&tokenize("ab. ba? c", "en"), &metadata(&["a", "b", "c", ".", "?"])).unwrap();
        let sentences = seq.sentences();
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(), vec!["a", "b", "."]);
        assert_eq!(sentences[2].iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_sentence_ids_intersperse_padding() {
        let meta = metadata(&["a", "b"]);
        let seq = phonemize(&tokenize("ab", "en"), &meta).unwrap();
        // ^=1 _=0 $=2 a=4 b=5
        assert_eq!(sentence_ids(seq.sentences()[0], &meta), vec![1, 0, 4, 0, 5, 0, 2]);
    }

    #[test]
    fn test_phonemize_is_deterministic() {
        let tokens = tokenize("سلام، کتاب من را بده.", "fa");
        let first = phonemize(&tokens, &persian()).unwrap();
        let second = phonemize(&tokens, &persian()).unwrap();
        assert_eq!(first, second);
    }
}
