//! DoRA (Weight-Decomposed Low-Rank Adaptation) as a weight transform.
//!
//! DoRA decomposes the frozen weight into direction and magnitude. The
//! low-rank update perturbs the direction only; the result is
//! re-normalized per output row and rescaled by a learned magnitude
//! vector initialized from the original row norms:
//!
//! `W' = ((W + B·A) / row_norm(W + B·A)) * m`
//!
//! `B` starts at zero so the direction is unchanged at init, and `m`
//! starts equal to the original row norms so the magnitude is unchanged
//! too - the effective weight equals the original until training moves
//! the factors.
//!
//! Reference: <https://arxiv.org/abs/2402.09353>

use std::sync::OnceLock;

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::adapters::lora::LoraFactors;
use crate::error::{LoadcastError, Result};
use crate::traits::{TransformConfig, WeightTransform};

/// Configuration for DoRA adapters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DoraConfig {
    /// Rank of the low-rank direction update.
    pub rank: usize,
}

impl Default for DoraConfig {
    fn default() -> Self {
        Self { rank: 8 }
    }
}

impl TransformConfig for DoraConfig {
    fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(LoadcastError::InvalidConfig("rank must be > 0".into()));
        }
        Ok(())
    }
}

/// Low-rank direction factors plus the learned magnitude vector.
struct DoraFactors {
    low_rank: LoraFactors,
    /// Per-row magnitude, shape `(1, out_features)`, init `row_norm(W)`.
    magnitude: Var,
}

impl DoraFactors {
    fn materialize(base: &Tensor, rank: usize) -> Result<Self> {
        let low_rank = LoraFactors::materialize(base, rank)?;
        let magnitude = row_norm(base)?.t()?.detach();
        let magnitude = Var::from_tensor(&magnitude)?;
        Ok(Self {
            low_rank,
            magnitude,
        })
    }
}

/// Per-row L2 norm, shape `(out_features, 1)`.
fn row_norm(weight: &Tensor) -> Result<Tensor> {
    Ok(weight.sqr()?.sum_keepdim(1)?.sqrt()?)
}

/// Magnitude-decomposed low-rank adapter over a single frozen 2-D weight.
///
/// Same lazy, idempotent materialization as
/// [`LoraAdapter`](crate::adapters::lora::LoraAdapter).
pub struct DoraAdapter {
    config: DoraConfig,
    factors: OnceLock<DoraFactors>,
}

impl DoraAdapter {
    /// Create an unmaterialized adapter.
    #[must_use]
    pub fn new(config: DoraConfig) -> Self {
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

    fn factors(&self, base: &Tensor) -> Result<&DoraFactors> {
        if let Some(factors) = self.factors.get() {
            return Ok(factors);
        }
        let fresh = DoraFactors::materialize(base, self.config.rank)?;
        Ok(self.factors.get_or_init(|| fresh))
    }
}

impl WeightTransform for DoraAdapter {
    fn effective_weight(&self, base: &Tensor) -> Result<Tensor> {
        let factors = self.factors(base)?;
        let direction = (base + factors.low_rank.delta()?)?;
        let normalized = direction.broadcast_div(&row_norm(&direction)?)?;
        Ok(normalized.broadcast_mul(&factors.magnitude.as_tensor().t()?)?)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        match self.factors.get() {
            Some(factors) => vec![
                factors.low_rank.a.clone(),
                factors.low_rank.b.clone(),
                factors.magnitude.clone(),
            ],
            None => Vec::new(),
        }
    }

    fn named_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        match self.factors.get() {
            Some(factors) => vec![
                (
                    format!("{prefix}.dora_a"),
                    factors.low_rank.a.as_tensor().clone(),
                ),
                (
                    format!("{prefix}.dora_b"),
                    factors.low_rank.b.as_tensor().clone(),
                ),
                (
                    format!("{prefix}.dora_m"),
                    factors.magnitude.as_tensor().clone(),
                ),
            ],
            None => Vec::new(),
        }
    }

    fn num_parameters(&self) -> usize {
        match self.factors.get() {
            Some(factors) => {
                let low_rank = &factors.low_rank;
                low_rank.rank * (low_rank.in_features + low_rank.out_features)
                    + low_rank.out_features
            }
            None => 0,
        }
    }
}
