//! Linguistic preprocessing: normalization, homographs, Ezafe, phonemes.

pub mod ezafe;
pub mod homograph;
pub mod phonemizer;
pub mod resources;
pub mod token;

pub use ezafe::{EzafeModel, GrammaticalMarkerInserter};
pub use homograph::{HomographDictionary, HomographEntry, HomographResolver};
pub use phonemizer::{Phoneme, PhonemeSequence, phonemize, sentence_ids};
pub use resources::{LinguisticResources, ResourceManager, ResourcePaths};
pub use token::{Token, TokenKind, tokenize};

use std::fmt::Display;
use std::path::Path;

use tracing::warn;

use crate::error::SynthError;

/// A step of the fixed preprocessing chain.
///
/// Stages never fail: a stage without its resource passes tokens through and
/// reports itself as degraded.
pub trait TextStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, tokens: Vec<Token>) -> Vec<Token>;

    fn is_degraded(&self) -> bool {
        false
    }
}

/// Load state of an optional linguistic resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Loaded,
    NotConfigured,
    Failed(String),
}

impl ResourceStatus {
    /// Status of a resource that could not be loaded from `path`. Logs the failure.
    pub(crate) fn unavailable(resource: &'static str, path: &Path, cause: impl Display) -> Self {
        let error = SynthError::ResourceUnavailable { resource, reason: format!("{}: {}", path.display(), cause) };
        warn!("{}, continuing without it", error);
        Self::Failed(error.to_string())
    }
}
