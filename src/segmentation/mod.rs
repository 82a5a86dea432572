mod adapter;
mod mailbox;
mod model_engine;
mod preprocess;
#[cfg(feature = "rvm")]
mod rvm;
pub mod types;

pub use adapter::SegmentationAdapter;
pub use mailbox::ResultSlot;
pub use model_engine::ModelEngine;
pub use preprocess::Preprocessor;
#[cfg(feature = "rvm")]
pub use rvm::RobustVideoMatting;
pub use types::{
    EngineFactory, Matte, ResultCallback, SegmentationEngine, SegmentationModel, SegmentationResult,
};

#[cfg(feature = "rvm")]
use std::sync::Arc;

/// Engine factory backed by the RVM model found under the configured model base
#[cfg(feature = "rvm")]
pub fn rvm_engine_factory(file: &'static str) -> Arc<dyn EngineFactory> {
    let factory = move |config: &crate::config::SegmentationConfig| -> anyhow::Result<Arc<dyn SegmentationEngine>> {
        let model = RobustVideoMatting::new(config.locate(file))?;
        Ok(Arc::new(ModelEngine::new(model)))
    };
    Arc::new(factory)
}
