//! Core traits: the weight-provider seam and the opaque model boundary.

use candle_core::{Tensor, Var};

use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait TransformConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// A computed transform over a single frozen 2-D weight matrix.
///
/// Consuming code never reads an adapted parameter directly; it asks the
/// transform for the *effective* weight. Swapping an adapter in or out
/// means substituting the provider, not mutating the base tensor.
pub trait WeightTransform: Send + Sync {
    /// Compute the effective weight from the frozen base weight.
    ///
    /// The first call materializes the transform's own factors from the
    /// shape, device, and dtype of `base`; later calls reuse them.
    ///
    /// # Errors
    ///
    /// Returns an error if factor materialization or the tensor ops fail.
    fn effective_weight(&self, base: &Tensor) -> Result<Tensor>;

    /// The transform's own trainable variables.
    ///
    /// Empty until the first [`effective_weight`](Self::effective_weight)
    /// call has materialized the factors.
    fn trainable_vars(&self) -> Vec<Var>;

    /// Factor tensors keyed as `{prefix}.{factor}` for checkpointing.
    fn named_tensors(&self, prefix: &str) -> Vec<(String, Tensor)>;

    /// Number of trainable scalars owned by the transform.
    ///
    /// Zero until the factors have been materialized.
    fn num_parameters(&self) -> usize;

    /// Fold the transform into the base weight for inference.
    ///
    /// For low-rank adapters the merged weight *is* the effective weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the effective weight cannot be computed.
    fn merge(&self, base: &Tensor) -> Result<Tensor> {
        self.effective_weight(base)
    }
}

/// The opaque forecasting-model capability the train loop drives.
///
/// Nothing is assumed about the forward internals; implementors are
/// expected to read their weights through a
/// [`ParamRegistry`](crate::params::ParamRegistry) so adapter transforms
/// take effect.
pub trait Forecaster {
    /// Predict the horizon from a batch of context windows.
    ///
    /// # Arguments
    /// * `context` - Right-aligned context, shape `(batch, context_len)`
    /// * `padding` - Padding indicator, shape `(batch, context_len + lookahead)`
    /// * `freq` - Frequency tag, shape `(batch, 1)`, i64
    ///
    /// # Errors
    ///
    /// Returns an error if the forward computation fails.
    fn forward(&self, context: &Tensor, padding: &Tensor, freq: &Tensor) -> Result<Tensor>;
}
