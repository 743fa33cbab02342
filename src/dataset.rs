//! Windowed forecasting dataset over multi-building load arrays.
//!
//! Turns a raw `(entities, time, features)` array into fixed-length
//! `(context, horizon)` training pairs. Only feature channel 0 is
//! consumed here; the remaining channels are reserved for exogenous
//! covariates handled elsewhere. Indices are laid out grouped by entity:
//! all of entity 0's windows, then entity 1's, and so on.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{LoadcastError, Result};

/// Windowing geometry and normalization switch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Number of entities (buildings) to take from the array.
    pub num_entities: usize,
    /// Length of real history per window.
    pub lookback: usize,
    /// Forecast horizon length.
    pub lookahead: usize,
    /// Fixed context-buffer width the model consumes; left-padded with
    /// zeros when it exceeds `lookback`.
    pub context_len: usize,
    /// Whether to z-score values with global statistics.
    pub normalize: bool,
}

impl DatasetConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("num_entities", self.num_entities),
            ("lookback", self.lookback),
            ("lookahead", self.lookahead),
            ("context_len", self.context_len),
        ] {
            if value == 0 {
                return Err(LoadcastError::InvalidConfig(format!(
                    "{name} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

/// Global z-score statistics, computed on the train split and reused for
/// validation and test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Norm {
    /// Global mean over the flattened values.
    pub mean: f32,
    /// Global (population) standard deviation.
    pub std: f32,
}

/// One training pair plus its indicator tensors.
pub struct ForecastSample {
    /// Right-aligned context, shape `(context_len,)`.
    pub context: Tensor,
    /// Padding indicator over context then horizon, shape
    /// `(context_len + lookahead,)`; 1 = padded slot, 0 = real data.
    pub padding: Tensor,
    /// Categorical sampling-frequency tag, shape `(1,)`, i64.
    pub freq: Tensor,
    /// Label window, shape `(lookahead,)`.
    pub horizon: Tensor,
    /// The un-padded raw context window, when requested.
    pub raw_context: Option<Tensor>,
}

/// A stack of samples along a leading batch dimension.
pub struct ForecastBatch {
    /// Shape `(batch, context_len)`.
    pub context: Tensor,
    /// Shape `(batch, context_len + lookahead)`.
    pub padding: Tensor,
    /// Shape `(batch, 1)`, i64.
    pub freq: Tensor,
    /// Shape `(batch, lookahead)`.
    pub horizon: Tensor,
}

/// Deterministic flat-index to `(context, horizon)` mapping across
/// stacked entities.
pub struct WindowedForecastDataset {
    values: Vec<Vec<f32>>,
    config: DatasetConfig,
    norm: Norm,
    windows_per_entity: usize,
    padding: Vec<f32>,
    emit_raw_context: bool,
    device: Device,
}

impl WindowedForecastDataset {
    /// Build a dataset from a `(entities, time, features)` tensor.
    ///
    /// Statistics are computed from the data unless `norm` is supplied;
    /// pass the train split's statistics for validation and test sets.
    ///
    /// # Errors
    ///
    /// Fails if more entities are requested than present, if the time
    /// axis is too short for a single window, or if normalization is
    /// requested over zero-variance data.
    pub fn new(
        data: &Tensor,
        config: DatasetConfig,
        norm: Option<Norm>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let (entities, time_len, _features) = data.dims3()?;
        if entities < config.num_entities {
            return Err(LoadcastError::EntityCountExceeded {
                requested: config.num_entities,
                available: entities,
            });
        }
        if time_len < config.lookback + config.lookahead {
            return Err(LoadcastError::InvalidConfig(format!(
                "time axis of length {time_len} cannot hold lookback {} + lookahead {}",
                config.lookback, config.lookahead
            )));
        }

        // First num_entities entities, feature channel 0 only.
        let raw = data
            .narrow(0, 0, config.num_entities)?
            .narrow(2, 0, 1)?
            .squeeze(2)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        let norm = match norm {
            Some(norm) => norm,
            None => compute_norm(&raw)?,
        };

        let values = if config.normalize {
            if norm.std == 0.0 {
                return Err(LoadcastError::InvalidConfig(
                    "cannot normalize zero-variance data".into(),
                ));
            }
            raw.iter()
                .map(|series| series.iter().map(|v| (v - norm.mean) / norm.std).collect())
                .collect()
        } else {
            raw
        };

        // Indicator over context then horizon: leading context slots that
        // hold no real history are flagged 1.
        let padded_len = config.context_len.saturating_sub(config.lookback);
        let mut padding = vec![0f32; config.context_len + config.lookahead];
        for slot in &mut padding[..padded_len] {
            *slot = 1.0;
        }

        let windows_per_entity = time_len - config.lookback - config.lookahead + 1;

        Ok(Self {
            values,
            config,
            norm,
            windows_per_entity,
            padding,
            emit_raw_context: false,
            device: device.clone(),
        })
    }

    /// Also emit the un-padded raw context window with every sample.
    #[must_use]
    pub fn with_raw_context(mut self) -> Self {
        self.emit_raw_context = true;
        self
    }

    /// Total number of windows across all entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows_per_entity * self.config.num_entities
    }

    /// Whether the dataset holds no windows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Windows per entity: `time_len - lookback - lookahead + 1`.
    #[must_use]
    pub fn windows_per_entity(&self) -> usize {
        self.windows_per_entity
    }

    /// The statistics in effect (train statistics when reused).
    #[must_use]
    pub fn norm(&self) -> Norm {
        self.norm
    }

    /// The dataset geometry.
    #[must_use]
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Map a flat index to `(entity_index, window_offset)`.
    ///
    /// Indices are grouped by entity, not interleaved.
    ///
    /// # Errors
    ///
    /// Returns [`LoadcastError::IndexOutOfRange`] past the end.
    pub fn entity_and_offset(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.len() {
            return Err(LoadcastError::IndexOutOfRange {
                index,
                len: self.len(),
            });
        }
        Ok((
            index / self.windows_per_entity,
            index % self.windows_per_entity,
        ))
    }

    /// Fetch the sample at a flat index.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range index or failed tensor
    /// construction.
    pub fn get(&self, index: usize) -> Result<ForecastSample> {
        let (entity, offset) = self.entity_and_offset(index)?;
        let series = &self.values[entity];
        let cfg = &self.config;

        let window = &series[offset..offset + cfg.lookback];
        let horizon = &series[offset + cfg.lookback..offset + cfg.lookback + cfg.lookahead];

        // Right-align the most recent history; truncate from the left if
        // the window is wider than the context buffer.
        let take = cfg.lookback.min(cfg.context_len);
        let mut context = vec![0f32; cfg.context_len];
        context[cfg.context_len - take..].copy_from_slice(&window[cfg.lookback - take..]);

        let raw_context = if self.emit_raw_context {
            Some(Tensor::from_slice(window, cfg.lookback, &self.device)?)
        } else {
            None
        };

        Ok(ForecastSample {
            context: Tensor::from_vec(context, cfg.context_len, &self.device)?,
            padding: Tensor::from_slice(&self.padding, self.padding.len(), &self.device)?,
            freq: Tensor::zeros(1, DType::I64, &self.device)?,
            horizon: Tensor::from_slice(horizon, cfg.lookahead, &self.device)?,
            raw_context,
        })
    }

    /// Stack the samples at `indices` into batched tensors.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty index list, out-of-range indices,
    /// or failed tensor construction.
    pub fn batch(&self, indices: &[usize]) -> Result<ForecastBatch> {
        if indices.is_empty() {
            return Err(LoadcastError::InvalidConfig(
                "cannot build an empty batch".into(),
            ));
        }
        let mut contexts = Vec::with_capacity(indices.len());
        let mut paddings = Vec::with_capacity(indices.len());
        let mut freqs = Vec::with_capacity(indices.len());
        let mut horizons = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self.get(index)?;
            contexts.push(sample.context);
            paddings.push(sample.padding);
            freqs.push(sample.freq);
            horizons.push(sample.horizon);
        }
        Ok(ForecastBatch {
            context: Tensor::stack(&contexts, 0)?,
            padding: Tensor::stack(&paddings, 0)?,
            freq: Tensor::stack(&freqs, 0)?,
            horizon: Tensor::stack(&horizons, 0)?,
        })
    }
}

/// Population mean and standard deviation over all values.
fn compute_norm(values: &[Vec<f32>]) -> Result<Norm> {
    let count = values.iter().map(Vec::len).sum::<usize>();
    if count == 0 {
        return Err(LoadcastError::EmptyTrainSplit);
    }
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    let mean = values
        .iter()
        .flatten()
        .map(|&v| f64::from(v))
        .sum::<f64>()
        / count;
    let variance = values
        .iter()
        .flatten()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / count;
    #[allow(clippy::cast_possible_truncation)]
    Ok(Norm {
        mean: mean as f32,
        std: variance.sqrt() as f32,
    })
}

/// Train, validation, and test datasets sharing the train statistics.
pub struct SplitDatasets {
    /// Train split.
    pub train: WindowedForecastDataset,
    /// Validation split, `None` when its slice is too short for a window.
    pub val: Option<WindowedForecastDataset>,
    /// Test split, `None` when its slice is too short for a window.
    pub test: Option<WindowedForecastDataset>,
    /// The train split's statistics, reused by val and test.
    pub norm: Norm,
}

/// Split the time axis by cumulative ratios and build one dataset per
/// split, normalizing val and test with the train statistics.
///
/// # Errors
///
/// Fails on ratios outside `[0, 1]` or summing past 1, or when the train
/// slice holds no timesteps.
pub fn train_val_test_split(
    data: &Tensor,
    ratios: [f64; 3],
    config: DatasetConfig,
    device: &Device,
) -> Result<SplitDatasets> {
    if ratios.iter().any(|r| *r < 0.0) || ratios.iter().sum::<f64>() > 1.0 + 1e-9 {
        return Err(LoadcastError::InvalidConfig(
            "split ratios must be non-negative and sum to at most 1".into(),
        ));
    }

    let (_, time_len, _) = data.dims3()?;
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let cut = |ratio: f64| (ratio * time_len as f64) as usize;
    let train_end = cut(ratios[0]);
    let val_end = cut(ratios[0] + ratios[1]);

    if train_end == 0 {
        return Err(LoadcastError::EmptyTrainSplit);
    }

    let train_slice = data.narrow(1, 0, train_end)?;
    let train = WindowedForecastDataset::new(&train_slice, config, None, device)?;
    let norm = train.norm();

    let min_len = config.lookback + config.lookahead;
    let val = if val_end - train_end >= min_len {
        let slice = data.narrow(1, train_end, val_end - train_end)?;
        Some(WindowedForecastDataset::new(
            &slice,
            config,
            Some(norm),
            device,
        )?)
    } else {
        None
    };
    let test = if time_len - val_end >= min_len {
        let slice = data.narrow(1, val_end, time_len - val_end)?;
        Some(WindowedForecastDataset::new(
            &slice,
            config,
            Some(norm),
            device,
        )?)
    } else {
        None
    };

    Ok(SplitDatasets {
        train,
        val,
        test,
        norm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_data(entities: usize, time_len: usize, features: usize) -> anyhow::Result<Tensor> {
        // values[e, t, f] = 100 * e + t, so windows are easy to predict.
        let device = Device::Cpu;
        let mut values = Vec::with_capacity(entities * time_len * features);
        for e in 0..entities {
            for t in 0..time_len {
                for _ in 0..features {
                    values.push((100 * e + t) as f32);
                }
            }
        }
        Ok(Tensor::from_vec(
            values,
            (entities, time_len, features),
            &device,
        )?)
    }

    fn small_config() -> DatasetConfig {
        DatasetConfig {
            num_entities: 3,
            lookback: 10,
            lookahead: 5,
            context_len: 10,
            normalize: false,
        }
    }

    #[test]
    fn test_length_and_layout() -> anyhow::Result<()> {
        let data = ramp_data(3, 100, 1)?;
        let dataset =
            WindowedForecastDataset::new(&data, small_config(), None, &Device::Cpu)?;

        assert_eq!(dataset.windows_per_entity(), 100 - 10 - 5 + 1);
        assert_eq!(dataset.len(), 86 * 3);
        assert_eq!(dataset.entity_and_offset(0)?, (0, 0));
        assert_eq!(dataset.entity_and_offset(86)?, (1, 0));
        assert_eq!(dataset.entity_and_offset(85)?, (0, 85));
        assert_eq!(dataset.entity_and_offset(257)?, (2, 85));
        assert!(dataset.entity_and_offset(258).is_err());
        Ok(())
    }

    #[test]
    fn test_windowing_bijection() -> anyhow::Result<()> {
        let data = ramp_data(3, 30, 1)?;
        let config = DatasetConfig {
            num_entities: 3,
            lookback: 8,
            lookahead: 4,
            context_len: 8,
            normalize: false,
        };
        let dataset = WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?;

        let mut seen = std::collections::HashSet::new();
        for index in 0..dataset.len() {
            let (entity, offset) = dataset.entity_and_offset(index)?;
            assert!(entity < 3);
            assert!(offset < dataset.windows_per_entity());
            assert!(seen.insert((entity, offset)));
        }
        assert_eq!(seen.len(), dataset.len());
        Ok(())
    }

    #[test]
    fn test_sample_contents_unnormalized() -> anyhow::Result<()> {
        let data = ramp_data(3, 100, 1)?;
        let dataset =
            WindowedForecastDataset::new(&data, small_config(), None, &Device::Cpu)?;

        // Entity 1, window 0: context 100..110, horizon 110..115.
        let sample = dataset.get(86)?;
        let context = sample.context.to_vec1::<f32>()?;
        let horizon = sample.horizon.to_vec1::<f32>()?;
        assert_eq!(context, (100..110).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(horizon, (110..115).map(|v| v as f32).collect::<Vec<_>>());
        assert_eq!(sample.freq.to_vec1::<i64>()?, vec![0]);
        Ok(())
    }

    #[test]
    fn test_padding_when_context_exceeds_lookback() -> anyhow::Result<()> {
        let data = ramp_data(1, 40, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 6,
            lookahead: 4,
            context_len: 10,
            normalize: false,
        };
        let dataset = WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?;

        let sample = dataset.get(0)?;
        let context = sample.context.to_vec1::<f32>()?;
        let padding = sample.padding.to_vec1::<f32>()?;

        assert_eq!(padding.len(), 10 + 4);
        // First context_len - lookback = 4 slots: zero-filled and flagged.
        assert_eq!(&context[..4], &[0.0; 4]);
        assert_eq!(&padding[..4], &[1.0; 4]);
        // Trailing slots hold real data, unflagged; horizon tail is real.
        assert_eq!(&context[4..], &(0..6).map(|v| v as f32).collect::<Vec<_>>()[..]);
        assert!(padding[4..].iter().all(|&p| p == 0.0));
        Ok(())
    }

    #[test]
    fn test_lookback_wider_than_context_truncates_left() -> anyhow::Result<()> {
        let data = ramp_data(1, 40, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 12,
            lookahead: 2,
            context_len: 8,
            normalize: false,
        };
        let dataset = WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?;

        let sample = dataset.get(0)?;
        let context = sample.context.to_vec1::<f32>()?;
        // Most recent 8 of the 12-point window: 4..12.
        assert_eq!(context, (4..12).map(|v| v as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_normalization_and_supplied_stats() -> anyhow::Result<()> {
        let data = ramp_data(2, 50, 1)?;
        let config = DatasetConfig {
            num_entities: 2,
            lookback: 10,
            lookahead: 5,
            context_len: 10,
            normalize: true,
        };
        let dataset = WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?;
        let norm = dataset.norm();
        assert!(norm.std > 0.0);

        let sample = dataset.get(0)?;
        let context = sample.context.to_vec1::<f32>()?;
        let expected = (0.0 - norm.mean) / norm.std;
        assert!((context[0] - expected).abs() < 1e-5);

        // Supplied statistics short-circuit computation.
        let reused =
            WindowedForecastDataset::new(&data, config, Some(Norm { mean: 0.0, std: 1.0 }), &Device::Cpu)?;
        let raw = reused.get(0)?.context.to_vec1::<f32>()?;
        assert!((raw[0] - 0.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_raw_context_mode() -> anyhow::Result<()> {
        let data = ramp_data(1, 40, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 6,
            lookahead: 2,
            context_len: 10,
            normalize: false,
        };
        let dataset =
            WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?.with_raw_context();

        let sample = dataset.get(5)?;
        let raw = sample
            .raw_context
            .expect("raw context requested")
            .to_vec1::<f32>()?;
        assert_eq!(raw, (5..11).map(|v| v as f32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_too_many_entities() -> anyhow::Result<()> {
        let data = ramp_data(2, 50, 1)?;
        let mut config = small_config();
        config.num_entities = 5;
        let result = WindowedForecastDataset::new(&data, config, None, &Device::Cpu);
        assert!(matches!(
            result,
            Err(LoadcastError::EntityCountExceeded {
                requested: 5,
                available: 2
            })
        ));
        Ok(())
    }

    #[test]
    fn test_only_first_feature_channel_used() -> anyhow::Result<()> {
        // Channel 1 holds garbage; results must match the 1-channel case.
        let device = Device::Cpu;
        let base = ramp_data(1, 30, 1)?;
        let noise = Tensor::randn(0f32, 100f32, (1, 30, 1), &device)?;
        let stacked = Tensor::cat(&[&base, &noise], 2)?;

        let config = DatasetConfig {
            num_entities: 1,
            lookback: 8,
            lookahead: 4,
            context_len: 8,
            normalize: false,
        };
        let single = WindowedForecastDataset::new(&base, config, None, &device)?;
        let multi = WindowedForecastDataset::new(&stacked, config, None, &device)?;
        assert_eq!(
            single.get(3)?.context.to_vec1::<f32>()?,
            multi.get(3)?.context.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_batch_stacking() -> anyhow::Result<()> {
        let data = ramp_data(2, 40, 1)?;
        let config = DatasetConfig {
            num_entities: 2,
            lookback: 8,
            lookahead: 4,
            context_len: 12,
            normalize: false,
        };
        let dataset = WindowedForecastDataset::new(&data, config, None, &Device::Cpu)?;

        let batch = dataset.batch(&[0, 1, 2, 3])?;
        assert_eq!(batch.context.dims(), &[4, 12]);
        assert_eq!(batch.padding.dims(), &[4, 16]);
        assert_eq!(batch.freq.dims(), &[4, 1]);
        assert_eq!(batch.horizon.dims(), &[4, 4]);
        Ok(())
    }

    #[test]
    fn test_split_reuses_train_stats() -> anyhow::Result<()> {
        let data = ramp_data(2, 200, 1)?;
        let config = DatasetConfig {
            num_entities: 2,
            lookback: 10,
            lookahead: 5,
            context_len: 10,
            normalize: true,
        };
        let splits = train_val_test_split(&data, [0.8, 0.1, 0.1], config, &Device::Cpu)?;

        let val = splits.val.expect("val slice long enough");
        let test = splits.test.expect("test slice long enough");
        assert_eq!(splits.train.norm(), splits.norm);
        assert_eq!(val.norm(), splits.norm);
        assert_eq!(test.norm(), splits.norm);
        assert_eq!(splits.train.windows_per_entity(), 160 - 10 - 5 + 1);
        Ok(())
    }

    #[test]
    fn test_split_empty_train_is_error() -> anyhow::Result<()> {
        let data = ramp_data(1, 50, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 5,
            lookahead: 5,
            context_len: 5,
            normalize: true,
        };
        let result = train_val_test_split(&data, [0.0, 0.5, 0.5], config, &Device::Cpu);
        assert!(matches!(result, Err(LoadcastError::EmptyTrainSplit)));
        Ok(())
    }

    #[test]
    fn test_split_bad_ratios() -> anyhow::Result<()> {
        let data = ramp_data(1, 50, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 5,
            lookahead: 5,
            context_len: 5,
            normalize: true,
        };
        assert!(train_val_test_split(&data, [0.8, 0.3, 0.3], config, &Device::Cpu).is_err());
        assert!(train_val_test_split(&data, [-0.1, 0.5, 0.5], config, &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_short_tail_splits_are_none() -> anyhow::Result<()> {
        let data = ramp_data(1, 100, 1)?;
        let config = DatasetConfig {
            num_entities: 1,
            lookback: 10,
            lookahead: 10,
            context_len: 10,
            normalize: true,
        };
        // 2% tails are too short for lookback + lookahead = 20.
        let splits = train_val_test_split(&data, [0.96, 0.02, 0.02], config, &Device::Cpu)?;
        assert!(splits.val.is_none());
        assert!(splits.test.is_none());
        Ok(())
    }
}
