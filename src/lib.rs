//! # loadcast
//!
//! Parameter-efficient fine-tuning of time-series foundation models on
//! building-energy load data.
//!
//! The crate retrofits an already-trained forecasting model with low-rank
//! adapters and drives a fine-tuning run end to end:
//!
//! - **`LoRA`** / **`DoRA`** rank-decomposition adapters that perturb a
//!   frozen weight matrix without modifying it
//! - an explicit [`ParamRegistry`] standing in for the model's module
//!   tree, with adapter transforms routing every weight read
//! - selective checkpointing of adapter factors only
//! - a windowed dataset mapping flat indices to `(context, horizon)`
//!   pairs across stacked buildings
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use loadcast::{inject_adapters, AdapterKind, InjectConfig, ParamRegistry};
//!
//! let mut params = ParamRegistry::new();
//! // ... model registers its weights ...
//! let installed = inject_adapters(
//!     &mut params,
//!     &InjectConfig { kind: AdapterKind::Lora, rank: 16, submodule: "stacked_transformer".into() },
//! )?;
//! ```
//!
//! ## Architecture
//!
//! Adapters implement the [`WeightTransform`] trait; the registry owns
//! the frozen base weights and substitutes the provider on read. The
//! forecasting transformer itself stays opaque behind [`Forecaster`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod inject;
pub mod params;
pub mod training;
pub mod traits;

pub use adapters::dora::{DoraAdapter, DoraConfig};
pub use adapters::lora::{LoraAdapter, LoraConfig};
pub use adapters::AdapterKind;
pub use checkpoint::{
    filter_state_dict, load_config, load_state_dict, save_config, save_selective,
    save_state_dict, selective_state_dict, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use config::FineTuneConfig;
pub use dataset::{
    train_val_test_split, DatasetConfig, ForecastBatch, ForecastSample, Norm, SplitDatasets,
    WindowedForecastDataset,
};
pub use error::{LoadcastError, Result};
pub use inject::{inject_adapters, InjectConfig};
pub use params::ParamRegistry;
pub use training::{
    evaluate, fit, format_parameter_count, FitReport, LrSchedule, MetricsLog, MetricsRow,
    TrainConfig, TrainState,
};
pub use traits::{Forecaster, TransformConfig, WeightTransform};
