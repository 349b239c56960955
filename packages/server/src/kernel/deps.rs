//! Server dependencies for stage executors (using traits for testability)
//!
//! This module provides the central dependency container handed to every
//! executor and route handler. All external services sit behind trait
//! abstractions so tests can swap in-memory fakes.

use std::sync::Arc;

use crate::config::Config;
use crate::domains::sessions::store::SessionStore;
use crate::kernel::fanout::EventFanout;
use crate::kernel::tasks::TaskQueue;
use crate::kernel::traits::{
    BaseAllergenDetector, BaseCategorizer, BaseDescriber, BaseImageFinder, BaseImageStore,
    BaseIngredientDetector, BaseTextExtractor, BaseTranslator,
};

/// Server dependencies accessible to executors (using traits for testability)
pub struct ServerDeps {
    pub config: Config,
    pub store: Arc<dyn SessionStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub fanout: Arc<dyn EventFanout>,
    pub image_store: Arc<dyn BaseImageStore>,
    pub text_extractor: Arc<dyn BaseTextExtractor>,
    pub categorizer: Arc<dyn BaseCategorizer>,
    pub translator: Arc<dyn BaseTranslator>,
    /// Secondary translator tried before the identity fallback.
    pub translator_fallback: Option<Arc<dyn BaseTranslator>>,
    pub describer: Arc<dyn BaseDescriber>,
    pub allergen_detector: Arc<dyn BaseAllergenDetector>,
    pub ingredient_detector: Arc<dyn BaseIngredientDetector>,
    pub image_finder: Arc<dyn BaseImageFinder>,
}
