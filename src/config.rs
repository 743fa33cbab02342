//! Top-level fine-tuning configuration.

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetConfig;
use crate::inject::InjectConfig;
use crate::traits::TransformConfig;
use crate::training::TrainConfig;
use crate::Result;

/// Everything one fine-tuning run needs, threaded explicitly through the
/// pipeline instead of living in ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneConfig {
    /// Adapter variant, rank, and target submodule.
    pub adapter: InjectConfig,
    /// Windowing geometry and normalization.
    pub dataset: DatasetConfig,
    /// Optimizer and schedule settings.
    pub train: TrainConfig,
}

impl FineTuneConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.adapter.validate()?;
        self.dataset.validate()?;
        self.train.validate()
    }
}
