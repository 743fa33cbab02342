//! LoRA (Low-Rank Adaptation) as a weight transform.
//!
//! The adapter perturbs a frozen weight matrix with a fixed-rank
//! correction: `W' = W + B·A` where `A ∈ R^{r×in}` and `B ∈ R^{out×r}`.
//! `B` starts at zero so the effective weight equals the original weight
//! exactly until the first optimizer step.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::sync::OnceLock;

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{LoadcastError, Result};
use crate::traits::{TransformConfig, WeightTransform};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub rank: usize,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { rank: 8 }
    }
}

impl TransformConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(LoadcastError::InvalidConfig("rank must be > 0".into()));
        }
        Ok(())
    }
}

/// The lazily allocated low-rank factors.
pub(crate) struct LoraFactors {
    /// Down projection, shape `(rank, in_features)`, init normal(0, 1).
    pub(crate) a: Var,
    /// Up projection, shape `(out_features, rank)`, init zeros.
    pub(crate) b: Var,
    pub(crate) in_features: usize,
    pub(crate) out_features: usize,
    pub(crate) rank: usize,
}

impl LoraFactors {
    /// Allocate factors matching the shape, device, and dtype of `base`.
    pub(crate) fn materialize(base: &Tensor, rank: usize) -> Result<Self> {
        let (out_features, in_features) = base.dims2()?;
        let a = Tensor::randn(0f32, 1f32, (rank, in_features), base.device())?
            .to_dtype(base.dtype())?;
        let a = Var::from_tensor(&a)?;
        let b = Var::zeros((out_features, rank), base.dtype(), base.device())?;
        Ok(Self {
            a,
            b,
            in_features,
            out_features,
            rank,
        })
    }

    /// The low-rank update `B·A`, shape `(out_features, in_features)`.
    pub(crate) fn delta(&self) -> Result<Tensor> {
        Ok(self.b.as_tensor().matmul(self.a.as_tensor())?)
    }
}

/// Low-rank adapter over a single frozen 2-D weight.
///
/// Factors are materialized exactly once, on the first
/// [`effective_weight`](WeightTransform::effective_weight) call, from the
/// weight they decorate; the adapter object itself can be created before
/// the target weight is known.
pub struct LoraAdapter {
    config: LoraConfig,
    factors: OnceLock<LoraFactors>,
}

impl LoraAdapter {
    /// Create an unmaterialized adapter.
    #[must_use]
    pub fn new(config: LoraConfig) -> Self {
        Self {
            config,
            factors: OnceLock::new(),
        }
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.rank
    }

    /// Whether the factors have been materialized yet.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.factors.get().is_some()
    }

    fn factors(&self, base: &Tensor) -> Result<&LoraFactors> {
        if let Some(factors) = self.factors.get() {
            return Ok(factors);
        }
        let fresh = LoraFactors::materialize(base, self.config.rank)?;
        // A concurrent initializer wins the race; the loser's factors are
        // dropped, keeping materialization idempotent.
        Ok(self.factors.get_or_init(|| fresh))
    }
}

impl WeightTransform for LoraAdapter {
    fn effective_weight(&self, base: &Tensor) -> Result<Tensor> {
        let factors = self.factors(base)?;
        Ok((base + factors.delta()?)?)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match self.factors.get() {
            Some(factors) => vec![factors.a.clone(), factors.b.clone()],
            None => Vec::new(),
        }
    }

    fn named_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        match self.factors.get() {
            Some(factors) => vec![
                (format!("{prefix}.lora_a"), factors.a.as_tensor().clone()),
                (format!("{prefix}.lora_b"), factors.b.as_tensor().clone()),
            ],
            None => Vec::new(),
        }
    }

    fn num_parameters(&self) -> usize {
        match self.factors.get() {
            Some(factors) => factors.rank * (factors.in_features + factors.out_features),
            None => 0,
        }
    }
}
