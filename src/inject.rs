//! Adapter injection: retrofit a registered model with LoRA/DoRA
//! transforms without touching its forward code.

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::error::{LoadcastError, Result};
use crate::params::ParamRegistry;
use crate::traits::TransformConfig;

/// Where and how to inject adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectConfig {
    /// Adapter variant to install.
    pub kind: AdapterKind,

    /// Rank of the low-rank decomposition.
    pub rank: usize,

    /// Dotted path of the submodule to adapt; empty targets the whole
    /// model.
    #[serde(default)]
    pub submodule: String,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::Lora,
            rank: 8,
            submodule: String::new(),
        }
    }
}

impl TransformConfig for InjectConfig {
    fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(LoadcastError::InvalidConfig("rank must be > 0".into()));
        }
        Ok(())
    }
}

/// Freeze the whole model, then install one adapter per eligible
/// parameter under the configured submodule.
///
/// Eligible means exactly 2-D: matrix-shaped weights only, never biases,
/// norm scales, or higher-rank tensors. Parameters that already carry a
/// transform are skipped silently, so repeated calls over overlapping
/// submodules install exactly one adapter per parameter and leave the
/// trainable-parameter count unchanged.
///
/// Returns the number of adapters installed by this call.
///
/// # Errors
///
/// Returns [`LoadcastError::SubmoduleNotFound`] if nothing lives under
/// the configured path. The freeze from step one is deliberately left in
/// effect on that failure: a model that failed injection must not slip
/// back into full fine-tuning.
pub fn inject_adapters(registry: &mut ParamRegistry, config: &InjectConfig) -> Result<usize> {
    config.validate()?;

    // Full fine-tuning is disabled for the entire model, unconditionally
    // and before any lookup can fail.
    registry.freeze_all();

    if !config.submodule.is_empty() && !registry.contains_submodule(&config.submodule) {
        return Err(LoadcastError::SubmoduleNotFound {
            path: config.submodule.clone(),
        });
    }

    let targets: Vec<String> = registry
        .params_under(&config.submodule)
        .map(str::to_owned)
        .collect();

    let mut installed = 0;
    for path in targets {
        if registry.ndim(&path)? != 2 {
            continue;
        }
        if registry.install_transform(&path, config.kind.build(config.rank))? {
            installed += 1;
        }
    }
    Ok(installed)
}
