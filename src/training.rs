//! Training loop and utilities for adapter fine-tuning.
//!
//! The loop is deliberately plain: synchronous epochs over deterministic
//! batches, AdamW over the registry's trainable variables only, MSE loss
//! with MAE tracked alongside, and per-step metrics written out as CSV.
//! A failing step aborts the whole run.

#![allow(clippy::cast_precision_loss)]

use std::fmt::Write as _;
use std::path::Path;

use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::dataset::WindowedForecastDataset;
use crate::error::{LoadcastError, Result};
use crate::params::ParamRegistry;
use crate::traits::Forecaster;

/// Learning rate schedule strategies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "schedule")]
pub enum LrSchedule {
    /// Constant learning rate.
    #[default]
    Constant,
    /// Linear warmup from 0 to the base rate.
    LinearWarmup {
        /// Number of warmup steps.
        warmup_steps: usize,
    },
    /// Cosine annealing from the base rate down to `min_lr`.
    CosineAnnealing {
        /// Total number of steps.
        total_steps: usize,
        /// Minimum learning rate.
        min_lr: f64,
    },
    /// Multiply the rate by `factor` once per epoch.
    EpochDecay {
        /// Per-epoch multiplier, e.g. 0.9.
        factor: f64,
    },
}

impl LrSchedule {
    /// Learning rate for the given step and epoch.
    #[must_use]
    pub fn get_lr(&self, step: usize, epoch: usize, base_lr: f64) -> f64 {
        match self {
            Self::Constant => base_lr,
            Self::LinearWarmup { warmup_steps } => {
                if *warmup_steps == 0 || step >= *warmup_steps {
                    base_lr
                } else {
                    base_lr * (step as f64 / *warmup_steps as f64)
                }
            }
            Self::CosineAnnealing {
                total_steps,
                min_lr,
            } => {
                if *total_steps == 0 || step >= *total_steps {
                    *min_lr
                } else {
                    let progress = step as f64 / *total_steps as f64;
                    let cosine = (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0;
                    min_lr + (base_lr - min_lr) * cosine
                }
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            Self::EpochDecay { factor } => base_lr * factor.powi(epoch as i32),
        }
    }
}

/// Training-run configuration, threaded explicitly; never ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of epochs.
    pub epochs: usize,
    /// Samples per batch.
    pub batch_size: usize,
    /// Base learning rate.
    pub learning_rate: f64,
    /// Learning rate schedule.
    #[serde(default)]
    pub lr_schedule: LrSchedule,
    /// AdamW weight decay.
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 512,
            learning_rate: 1e-6,
            lr_schedule: LrSchedule::Constant,
            weight_decay: 0.0,
        }
    }
}

impl TrainConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(LoadcastError::InvalidConfig(
                "epochs and batch_size must be > 0".into(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(LoadcastError::InvalidConfig(
                "learning_rate must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Mutable counters of a training run.
#[derive(Debug, Clone, Default)]
pub struct TrainState {
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Completed epochs.
    pub epoch: usize,
    /// Best validation MSE seen.
    pub best_val_loss: Option<f64>,
}

impl TrainState {
    /// Fresh state at step zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current learning rate under the schedule.
    #[must_use]
    pub fn current_lr(&self, config: &TrainConfig) -> f64 {
        config
            .lr_schedule
            .get_lr(self.global_step, self.epoch, config.learning_rate)
    }

    /// Record a completed optimizer step.
    pub fn step(&mut self) {
        self.global_step += 1;
    }

    /// Record a completed epoch.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Track the best validation loss; returns `true` on improvement.
    pub fn update_best_val_loss(&mut self, val_loss: f64) -> bool {
        match self.best_val_loss {
            Some(best) if val_loss >= best => false,
            _ => {
                self.best_val_loss = Some(val_loss);
                true
            }
        }
    }
}

/// One logged training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsRow {
    /// Global step.
    pub step: usize,
    /// Batch MSE.
    pub mse_loss: f64,
    /// Batch MAE.
    pub mae_loss: f64,
}

/// Per-step metrics, serializable as `step,mse_loss,mae_loss` CSV.
#[derive(Debug, Clone, Default)]
pub struct MetricsLog {
    rows: Vec<MetricsRow>,
}

impl MetricsLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one step.
    pub fn push(&mut self, step: usize, mse_loss: f64, mae_loss: f64) {
        self.rows.push(MetricsRow {
            step,
            mse_loss,
            mae_loss,
        });
    }

    /// The logged rows, in step order.
    #[must_use]
    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    /// Render as CSV with a `step,mse_loss,mae_loss` header.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("step,mse_loss,mae_loss\n");
        for row in &self.rows {
            let _ = writeln!(out, "{},{},{}", row.step, row.mse_loss, row.mae_loss);
        }
        out
    }

    /// Write the CSV rendering to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_csv())
            .map_err(|e| LoadcastError::Io(format!("failed to write metrics csv: {e}")))
    }
}

/// Outcome of a [`fit`] run.
pub struct FitReport {
    /// Per-step train metrics.
    pub train_log: MetricsLog,
    /// Per-epoch validation metrics, one row per epoch, when a
    /// validation set was supplied.
    pub val_log: MetricsLog,
    /// Final counters.
    pub state: TrainState,
}

/// Mean MSE and MAE of the model over a full dataset pass.
///
/// # Errors
///
/// Returns an error if a forward pass or loss computation fails.
pub fn evaluate<M: Forecaster>(
    model: &M,
    dataset: &WindowedForecastDataset,
    batch_size: usize,
) -> Result<(f64, f64)> {
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut mse_sum = 0.0;
    let mut mae_sum = 0.0;
    let mut batches = 0usize;
    for chunk in indices.chunks(batch_size) {
        let batch = dataset.batch(chunk)?;
        let prediction = model.forward(&batch.context, &batch.padding, &batch.freq)?;
        mse_sum += f64::from(loss::mse(&prediction, &batch.horizon)?.to_scalar::<f32>()?);
        mae_sum += f64::from(
            (prediction - &batch.horizon)?
                .abs()?
                .mean_all()?
                .to_scalar::<f32>()?,
        );
        batches += 1;
    }
    if batches == 0 {
        return Err(LoadcastError::InvalidConfig(
            "cannot evaluate on an empty dataset".into(),
        ));
    }
    Ok((mse_sum / batches as f64, mae_sum / batches as f64))
}

/// Run the fine-tuning loop: AdamW over the registry's trainable
/// variables (typically only adapter factors), MSE objective, optional
/// per-epoch validation.
///
/// Materializes any installed transforms first so their factors exist
/// before the optimizer is constructed. Batches are deterministic and
/// unshuffled.
///
/// # Errors
///
/// Fails on invalid configuration, when no trainable variables remain,
/// or when any forward/backward step fails; a failing step aborts the
/// run.
pub fn fit<M: Forecaster>(
    model: &M,
    registry: &ParamRegistry,
    train: &WindowedForecastDataset,
    val: Option<&WindowedForecastDataset>,
    config: &TrainConfig,
) -> Result<FitReport> {
    config.validate()?;
    if train.is_empty() {
        return Err(LoadcastError::EmptyTrainSplit);
    }

    registry.materialize_transforms()?;
    let vars = registry.trainable_vars();
    if vars.is_empty() {
        return Err(LoadcastError::InvalidConfig(
            "no trainable parameters: inject adapters or unfreeze something".into(),
        ));
    }

    let mut optimizer = AdamW::new(
        vars,
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..ParamsAdamW::default()
        },
    )?;

    let mut state = TrainState::new();
    let mut train_log = MetricsLog::new();
    let mut val_log = MetricsLog::new();
    let indices: Vec<usize> = (0..train.len()).collect();

    for _ in 0..config.epochs {
        for chunk in indices.chunks(config.batch_size) {
            let batch = train.batch(chunk)?;
            let prediction = model.forward(&batch.context, &batch.padding, &batch.freq)?;
            let mse = loss::mse(&prediction, &batch.horizon)?;
            let mae = (&prediction - &batch.horizon)?.abs()?.mean_all()?;

            optimizer.set_learning_rate(state.current_lr(config));
            optimizer.backward_step(&mse)?;

            state.step();
            train_log.push(
                state.global_step,
                f64::from(mse.to_scalar::<f32>()?),
                f64::from(mae.to_scalar::<f32>()?),
            );
        }
        state.new_epoch();

        if let Some(val) = val {
            let (val_mse, val_mae) = evaluate(model, val, config.batch_size)?;
            state.update_best_val_loss(val_mse);
            val_log.push(state.epoch, val_mse, val_mae);
        }
    }

    Ok(FitReport {
        train_log,
        val_log,
        state,
    })
}

/// Format a parameter count with engineering units, e.g. `12.29K`.
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1e9)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1e6)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1e3)
    } else {
        count.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_lr() {
        let schedule = LrSchedule::Constant;
        assert!((schedule.get_lr(0, 0, 1e-3) - 1e-3).abs() < 1e-12);
        assert!((schedule.get_lr(500, 3, 1e-3) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_linear_warmup() {
        let schedule = LrSchedule::LinearWarmup { warmup_steps: 100 };
        assert!((schedule.get_lr(0, 0, 1e-3)).abs() < 1e-12);
        assert!((schedule.get_lr(50, 0, 1e-3) - 5e-4).abs() < 1e-12);
        assert!((schedule.get_lr(100, 0, 1e-3) - 1e-3).abs() < 1e-12);
        // Degenerate warmup returns the base rate immediately.
        let instant = LrSchedule::LinearWarmup { warmup_steps: 0 };
        assert!((instant.get_lr(0, 0, 1e-3) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_annealing() {
        let schedule = LrSchedule::CosineAnnealing {
            total_steps: 100,
            min_lr: 1e-4,
        };
        assert!((schedule.get_lr(0, 0, 1e-3) - 1e-3).abs() < 1e-12);
        let halfway = 1e-4 + (1e-3 - 1e-4) * 0.5;
        assert!((schedule.get_lr(50, 0, 1e-3) - halfway).abs() < 1e-9);
        assert!((schedule.get_lr(100, 0, 1e-3) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_epoch_decay() {
        let schedule = LrSchedule::EpochDecay { factor: 0.9 };
        assert!((schedule.get_lr(10, 0, 1e-3) - 1e-3).abs() < 1e-12);
        assert!((schedule.get_lr(10, 1, 1e-3) - 9e-4).abs() < 1e-12);
        assert!((schedule.get_lr(10, 2, 1e-3) - 8.1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_train_state_best_val_loss() {
        let mut state = TrainState::new();
        assert!(state.update_best_val_loss(1.0));
        assert!(state.update_best_val_loss(0.5));
        assert!(!state.update_best_val_loss(0.8));
        assert_eq!(state.best_val_loss, Some(0.5));
    }

    #[test]
    fn test_metrics_csv() {
        let mut log = MetricsLog::new();
        log.push(1, 0.5, 0.25);
        log.push(2, 0.4, 0.2);
        let csv = log.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("step,mse_loss,mae_loss"));
        assert_eq!(lines.next(), Some("1,0.5,0.25"));
        assert_eq!(lines.next(), Some("2,0.4,0.2"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_metrics_csv_write() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("train.csv");
        let mut log = MetricsLog::new();
        log.push(1, 1.0, 0.5);
        log.write_csv(&path)?;
        assert!(std::fs::read_to_string(&path)?.starts_with("step,mse_loss"));
        Ok(())
    }

    #[test]
    fn test_train_config_validation() {
        let bad = TrainConfig {
            epochs: 0,
            ..TrainConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = TrainConfig {
            learning_rate: 0.0,
            ..TrainConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_format_parameter_count() {
        assert_eq!(format_parameter_count(100), "100");
        assert_eq!(format_parameter_count(1_234), "1.23K");
        assert_eq!(format_parameter_count(12_345_678), "12.35M");
        assert_eq!(format_parameter_count(1_234_567_890), "1.23B");
    }
}
