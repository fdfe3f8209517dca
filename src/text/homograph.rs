//! Homograph disambiguation from a pronunciation dictionary and local context.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::token::{Token, next_word, normalize_word, previous_word};
use super::{ResourceStatus, TextStage};
use crate::error::Result;

/// Neighboring words that favor a pronunciation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContextFeatures {
    #[serde(default)]
    pub prev: Vec<String>,
    #[serde(default)]
    pub next: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Candidate {
    /// Phonemes, one per character or whitespace separated.
    pub pronunciation: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub context: ContextFeatures,
}

impl Candidate {
    fn score(&self, prev: Option<&str>, next: Option<&str>) -> usize {
        let prev_hit = prev.is_some_and(|p| self.context.prev.iter().any(|c| c == p));
        let next_hit = next.is_some_and(|n| self.context.next.iter().any(|c| c == n));
        usize::from(prev_hit) + usize::from(next_hit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomographEntry {
    pub surface: String,
    pub candidates: Vec<Candidate>,
}

/// Surface form to candidate pronunciations. Read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct HomographDictionary {
    entries: HashMap<String, HomographEntry>,
}

impl HomographDictionary {
    /// Parse a dictionary from JSON.
    ///
    /// # Errors
    /// Returns `Json` if the document is not a map of surface forms to candidate lists.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<Candidate>> = serde_json::from_str(json)?;
        let entries = raw
            .into_iter()
            .filter(|(_, candidates)| !candidates.is_empty())
            .map(|(surface, mut candidates)| {
                let surface = normalize_word(&surface);
                for candidate in &mut candidates {
                    candidate.context.prev.iter_mut().for_each(|w| *w = normalize_word(w));
                    candidate.context.next.iter_mut().for_each(|w| *w = normalize_word(w));
                }
                (surface.clone(), HomographEntry { surface, candidates })
            })
            .collect();
        Ok(Self { entries })
    }

    /// Read a dictionary file.
    ///
    /// # Errors
    /// Returns `Io` or `Json` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, surface: &str) -> Option<&HomographEntry> {
        self.entries.get(surface)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Picks a pronunciation for each dictionary word.
///
/// Candidates are ranked by the number of matching context features, then by
/// priority, then by dictionary order. Without a dictionary every token passes
/// through unchanged.
#[derive(Debug)]
pub struct HomographResolver {
    dictionary: Option<HomographDictionary>,
    status: ResourceStatus,
}

impl HomographResolver {
    /// Load the dictionary at `path`, degrading to pass-through on failure.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self { dictionary: None, status: ResourceStatus::NotConfigured };
        };

        match HomographDictionary::from_file(path) {
            Ok(dictionary) => {
                info!("📖 Loaded homograph dictionary ({} entries) from {}", dictionary.len(), path.display());
                Self::from_dictionary(dictionary)
            }
            Err(e) => Self { dictionary: None, status: ResourceStatus::unavailable("Homograph dictionary", path, e) },
        }
    }

    pub fn from_dictionary(dictionary: HomographDictionary) -> Self {
        Self { dictionary: Some(dictionary), status: ResourceStatus::Loaded }
    }

    pub fn status(&self) -> &ResourceStatus {
        &self.status
    }

    /// True when running without a dictionary.
    pub fn is_degraded(&self) -> bool {
        self.dictionary.is_none()
    }

    /// Attach pronunciations to dictionary words.
    pub fn resolve(&self, mut tokens: Vec<Token>) -> Vec<Token> {
        let Some(ref dictionary) = self.dictionary else {
            return tokens;
        };

        for i in 0..tokens.len() {
            if !tokens[i].is_word() || tokens[i].pronunciation.is_some() {
                continue;
            }
            let Some(entry) = dictionary.get(&tokens[i].text) else {
                continue;
            };

            let prev = previous_word(&tokens, i).map(|j| tokens[j].text.as_str());
            let next = next_word(&tokens, i).map(|j| tokens[j].text.as_str());

            let chosen = entry
                .candidates
                .iter()
                .enumerate()
                .max_by_key(|(order, c)| (c.score(prev, next), c.priority, Reverse(*order)))
                .map(|(_, c)| c.pronunciation.clone());

            debug!(word = %tokens[i].text, pronunciation = ?chosen, "Homograph resolved");
            tokens[i].pronunciation = chosen;
        }

        tokens
    }
}

impl TextStage for HomographResolver {
    fn name(&self) -> &'static str {
        "homograph"
    }

    fn process(&self, tokens: Vec<Token>) -> Vec<Token> {
        self.resolve(tokens)
    }

    fn is_degraded(&self) -> bool {
        HomographResolver::is_degraded(self)
    }
}
