//! Ezafe marker insertion.
//!
//! A linear sequence labeler decides, left to right, whether each word is linked
//! to the following word by an Ezafe. The previous decision is a feature, so
//! chains like "کتاب بزرگ من" are labeled consistently.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::token::{Token, normalize_word};
use super::{ResourceStatus, TextStage};
use crate::error::Result;

/// Feature weights of the tagger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EzafeModel {
    #[serde(default)]
    threshold: f32,
    weights: HashMap<String, f32>,
}

impl EzafeModel {
    /// Parse a model from JSON.
    ///
    /// # Errors
    /// Returns `Json` if the document does not match the model format.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut model: Self = serde_json::from_str(json)?;
        model.weights = model.weights.into_iter().map(|(feature, weight)| (normalize_word(&feature), weight)).collect();
        Ok(model)
    }

    /// Read a model file.
    ///
    /// # Errors
    /// Returns `Io` or `Json` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn feature_count(&self) -> usize {
        self.weights.len()
    }

    fn score(&self, word: &str, next: &str, prev_linked: bool) -> f32 {
        let features = [
            "bias".to_string(),
            format!("w={}", word),
            format!("next={}", next),
            format!("suffix={}", word.chars().last().unwrap_or_default()),
            format!("next_prefix={}", next.chars().next().unwrap_or_default()),
            format!("pair={}|{}", word, next),
            format!("prev_label={}", if prev_linked { "E" } else { "O" }),
        ];
        features.iter().filter_map(|f| self.weights.get(f)).sum()
    }

    /// Label each token; `true` means an Ezafe follows it.
    pub fn predict(&self, tokens: &[Token]) -> Vec<bool> {
        let mut labels = vec![false; tokens.len()];
        let mut prev_linked = false;

        for i in 0..tokens.len() {
            let eligible = tokens[i].is_word() && tokens.get(i + 1).is_some_and(Token::is_word);
            if !eligible {
                prev_linked = false;
                continue;
            }
            labels[i] = self.score(&tokens[i].text, &tokens[i + 1].text, prev_linked) > self.threshold;
            prev_linked = labels[i];
        }

        labels
    }
}

/// Inserts Ezafe markers, or leaves tokens untouched when no model is loaded.
#[derive(Debug)]
pub struct GrammaticalMarkerInserter {
    model: Option<EzafeModel>,
    status: ResourceStatus,
}

impl GrammaticalMarkerInserter {
    /// Load the tagger at `path`. Absence or failure leaves the inserter as identity.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self { model: None, status: ResourceStatus::NotConfigured };
        };

        match EzafeModel::from_file(path) {
            Ok(model) => {
                info!("🔗 Loaded Ezafe model ({} features) from {}", model.feature_count(), path.display());
                Self::from_model(model)
            }
            Err(e) => Self { model: None, status: ResourceStatus::unavailable("Ezafe model", path, e) },
        }
    }

    pub fn from_model(model: EzafeModel) -> Self {
        Self { model: Some(model), status: ResourceStatus::Loaded }
    }

    /// Whether a tagger is loaded.
    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn status(&self) -> &ResourceStatus {
        &self.status
    }

    pub fn annotate(&self, mut tokens: Vec<Token>) -> Vec<Token> {
        let Some(ref model) = self.model else {
            return tokens;
        };

        let labels = model.predict(&tokens);
        let mut marked = 0usize;
        for (token, linked) in tokens.iter_mut().zip(labels) {
            token.ezafe = linked;
            marked += usize::from(linked);
        }
        debug!(tokens = tokens.len(), marked, "Ezafe annotated");

        tokens
    }
}

impl TextStage for GrammaticalMarkerInserter {
    fn name(&self) -> &'static str {
        "ezafe"
    }

    fn process(&self, tokens: Vec<Token>) -> Vec<Token> {
        self.annotate(tokens)
    }

    fn is_degraded(&self) -> bool {
        !self.is_available()
    }
}
