//! Adapter for pretrained layout detectors.
//!
//! The crate ships no model weights. Callers plug one in by implementing
//! [`LayoutModelLoader`] (the expensive, fallible part: reading weights,
//! starting an inference session) and [`LayoutModel`] (per-page inference).
//! [`ModelLayout`] loads the model at most once per process, on the first
//! `initialize`, and shares it between every page and document afterwards.

use super::{LayoutBackend, LayoutInput, LayoutRegion, RegionSource};
use crate::error::PerceptionError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// A loaded detector. Inference is synchronous and CPU-bound.
pub trait LayoutModel: Send + Sync {
    fn detect(&self, input: &LayoutInput) -> Result<Vec<LayoutRegion>, PerceptionError>;
}

/// Produces a [`LayoutModel`]; called at most once per [`ModelLayout`].
#[async_trait]
pub trait LayoutModelLoader: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Arc<dyn LayoutModel>, PerceptionError>;
}

/// Layout backend backed by a lazily loaded pretrained model.
pub struct ModelLayout {
    loader: Arc<dyn LayoutModelLoader>,
    model: OnceCell<Arc<dyn LayoutModel>>,
}

impl fmt::Debug for ModelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLayout")
            .field("loader", &self.loader.name())
            .field("loaded", &self.model.initialized())
            .finish()
    }
}

impl ModelLayout {
    pub fn new(loader: Arc<dyn LayoutModelLoader>) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
        }
    }
}

#[async_trait]
impl LayoutBackend for ModelLayout {
    fn name(&self) -> &str {
        self.loader.name()
    }

    async fn initialize(&self) -> Result<(), PerceptionError> {
        let loader = &self.loader;
        self.model
            .get_or_try_init(|| async {
                let model = loader.load().await?;
                info!("Loaded layout model '{}'", loader.name());
                Ok::<_, PerceptionError>(model)
            })
            .await?;
        Ok(())
    }

    fn detect(&self, input: &LayoutInput) -> Result<Vec<LayoutRegion>, PerceptionError> {
        let model = self.model.get().ok_or_else(|| PerceptionError::BackendUnavailable {
            backend: self.name().to_string(),
            reason: "layout model not initialised".into(),
        })?;
        Ok(model
            .detect(input)?
            .into_iter()
            .map(|r| LayoutRegion::new(r.bbox, r.kind, r.confidence, RegionSource::Model))
            .collect())
    }
}
