//! Ownership of the linguistic resources shared by all utterances.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::TextStage;
use super::ezafe::GrammaticalMarkerInserter;
use super::homograph::HomographResolver;

/// Where the linguistic resources live and whether the Persian stages run.
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    pub homograph_dict: Option<PathBuf>,
    pub ezafe_model: Option<PathBuf>,
    pub persian_enabled: bool,
}

impl Default for ResourcePaths {
    fn default() -> Self {
        Self { homograph_dict: None, ezafe_model: None, persian_enabled: true }
    }
}

/// One loaded generation of linguistic resources. Read-only.
#[derive(Debug)]
pub struct LinguisticResources {
    homographs: HomographResolver,
    ezafe: GrammaticalMarkerInserter,
    persian_enabled: bool,
}

impl LinguisticResources {
    /// Load everything named in `paths`. Missing resources degrade, never fail.
    pub fn load(paths: &ResourcePaths) -> Self {
        Self::new(HomographResolver::load(paths.homograph_dict.as_deref()), GrammaticalMarkerInserter::load(paths.ezafe_model.as_deref()), paths.persian_enabled)
    }

    pub fn new(homographs: HomographResolver, ezafe: GrammaticalMarkerInserter, persian_enabled: bool) -> Self {
        Self { homographs, ezafe, persian_enabled }
    }

    pub fn homographs(&self) -> &HomographResolver {
        &self.homographs
    }

    pub fn ezafe(&self) -> &GrammaticalMarkerInserter {
        &self.ezafe
    }

    pub fn persian_enabled(&self) -> bool {
        self.persian_enabled
    }

    /// Linguistic stages for a voice language, in execution order.
    pub fn stages_for(&self, language: &str) -> Vec<&dyn TextStage> {
        if self.persian_enabled && language == "fa" { vec![&self.homographs as &dyn TextStage, &self.ezafe] } else { Vec::new() }
    }
}

/// Holds the current resource generation and swaps it on reload.
///
/// Workers take an `Arc` snapshot per utterance, so a reload never changes the
/// resources under an utterance that is already running.
pub struct ResourceManager {
    paths: RwLock<ResourcePaths>,
    current: RwLock<Arc<LinguisticResources>>,
}

impl ResourceManager {
    pub fn init(paths: ResourcePaths) -> Self {
        let resources = Arc::new(LinguisticResources::load(&paths));
        Self { paths: RwLock::new(paths), current: RwLock::new(resources) }
    }

    /// Manager around already-built resources.
    pub fn with_resources(paths: ResourcePaths, resources: LinguisticResources) -> Self {
        Self { paths: RwLock::new(paths), current: RwLock::new(Arc::new(resources)) }
    }

    pub fn snapshot(&self) -> Arc<LinguisticResources> {
        self.current.read().clone()
    }

    pub fn paths(&self) -> ResourcePaths {
        self.paths.read().clone()
    }

    /// Re-read every resource from disk and publish the new generation.
    pub fn reload(&self) -> Arc<LinguisticResources> {
        let paths = self.paths();
        let resources = Arc::new(LinguisticResources::load(&paths));
        *self.current.write() = resources.clone();
        info!(
            homographs_degraded = resources.homographs().is_degraded(),
            ezafe_available = resources.ezafe().is_available(),
            persian = resources.persian_enabled(),
            "Linguistic resources reloaded"
        );
        resources
    }

    /// Toggle the Persian stages and reload.
    pub fn set_persian_enabled(&self, enabled: bool) -> Arc<LinguisticResources> {
        self.paths.write().persian_enabled = enabled;
        self.reload()
    }
}
