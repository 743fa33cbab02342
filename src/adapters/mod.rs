//! Rank-decomposition adapter implementations.

pub mod dora;
pub mod lora;

use serde::{Deserialize, Serialize};

use crate::traits::WeightTransform;

pub use dora::{DoraAdapter, DoraConfig};
pub use lora::{LoraAdapter, LoraConfig};

/// Which rank-decomposition variant to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// Plain low-rank adaptation: `W' = W + B·A`.
    Lora,
    /// Weight-decomposed low-rank adaptation: the low-rank update is
    /// re-normalized per row and rescaled by a learned magnitude.
    Dora,
}

impl AdapterKind {
    /// Build a fresh, unmaterialized adapter of this kind.
    #[must_use]
    pub fn build(self, rank: usize) -> Box<dyn WeightTransform> {
        match self {
            Self::Lora => Box::new(LoraAdapter::new(LoraConfig { rank })),
            Self::Dora => Box::new(DoraAdapter::new(DoraConfig { rank })),
        }
    }
}
