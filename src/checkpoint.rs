//! Selective checkpointing: persist only the parameters that matter.
//!
//! A fine-tuning run never re-saves the frozen base model; it filters the
//! full parameter snapshot down to the adapter factors by substring
//! patterns over parameter paths, and refuses to write a checkpoint that
//! came out empty.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{LoadcastError, Result};
use crate::params::ParamRegistry;

/// Default filename for selective adapter checkpoints.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Default filename for the fine-tune configuration.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Retain only entries whose path contains at least one pattern as a
/// substring.
///
/// # Errors
///
/// Returns [`LoadcastError::EmptyStateDict`] when nothing matches - a
/// typo'd pattern must fail loudly instead of producing a checkpoint
/// that looks valid but is empty.
pub fn filter_state_dict<S: AsRef<str>>(
    state: &HashMap<String, Tensor>,
    patterns: &[S],
) -> Result<HashMap<String, Tensor>> {
    let filtered: HashMap<String, Tensor> = state
        .iter()
        .filter(|(path, _)| patterns.iter().any(|p| path.contains(p.as_ref())))
        .map(|(path, tensor)| (path.clone(), tensor.clone()))
        .collect();

    if filtered.is_empty() {
        return Err(LoadcastError::EmptyStateDict {
            patterns: patterns.iter().map(|p| p.as_ref().to_owned()).collect(),
        });
    }
    Ok(filtered)
}

/// The registry's full snapshot filtered by substring patterns.
///
/// # Errors
///
/// Returns [`LoadcastError::EmptyStateDict`] when nothing matches.
pub fn selective_state_dict<S: AsRef<str>>(
    registry: &ParamRegistry,
    patterns: &[S],
) -> Result<HashMap<String, Tensor>> {
    filter_state_dict(&registry.state_dict(), patterns)
}

/// Save a state dict to a safetensors file.
///
/// # Errors
///
/// Returns an error if serialization or the file write fails.
pub fn save_state_dict<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> Result<()> {
    candle_core::safetensors::save(state, path)?;
    Ok(())
}

/// Filter the registry's snapshot and save the result.
///
/// # Errors
///
/// Returns [`LoadcastError::EmptyStateDict`] when nothing matches, or an
/// error if the write fails. An empty checkpoint is never written.
pub fn save_selective<S: AsRef<str>, P: AsRef<Path>>(
    registry: &ParamRegistry,
    patterns: &[S],
    path: P,
) -> Result<()> {
    let state = selective_state_dict(registry, patterns)?;
    save_state_dict(&state, path)
}

/// Load a state dict from a safetensors file onto a device.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state_dict<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path.as_ref(), device)?)
}

/// Save a configuration struct as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if serialization or the file write fails.
pub fn save_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| LoadcastError::Io(format!("failed to serialize config: {e}")))?;
    fs::write(path, json).map_err(|e| LoadcastError::Io(format!("failed to write config: {e}")))?;
    Ok(())
}

/// Load a configuration struct from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| LoadcastError::Io(format!("failed to read config: {e}")))?;
    serde_json::from_str(&json).map_err(|e| LoadcastError::Io(format!("failed to parse config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn state_with(keys: &[&str]) -> anyhow::Result<HashMap<String, Tensor>> {
        let device = Device::Cpu;
        let mut state = HashMap::new();
        for key in keys {
            state.insert((*key).to_owned(), Tensor::zeros((2, 2), DType::F32, &device)?);
        }
        Ok(state)
    }

    #[test]
    fn test_filter_keeps_matching_entries() -> anyhow::Result<()> {
        let state = state_with(&["base.w", "adapter.lora_a", "adapter.lora_b"])?;
        let filtered = filter_state_dict(&state, &["adapter"])?;

        let mut keys: Vec<&str> = filtered.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["adapter.lora_a", "adapter.lora_b"]);
        Ok(())
    }

    #[test]
    fn test_filter_multiple_patterns() -> anyhow::Result<()> {
        let state = state_with(&["base.w", "x.lora_a", "y.dora_m"])?;
        let filtered = filter_state_dict(&state, &["lora_", "dora_"])?;
        assert_eq!(filtered.len(), 2);
        Ok(())
    }

    #[test]
    fn test_filter_empty_result_is_error() -> anyhow::Result<()> {
        let state = state_with(&["base.w", "adapter.lora_a"])?;
        let result = filter_state_dict(&state, &["nomatch"]);
        assert!(matches!(
            result,
            Err(LoadcastError::EmptyStateDict { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_selective_save_load_round_trip() -> anyhow::Result<()> {
        use crate::adapters::AdapterKind;

        let device = Device::Cpu;
        let mut registry = ParamRegistry::new();
        let weight = Tensor::randn(0f32, 1f32, (4, 6), &device)?;
        registry.register_tensor("head.weight", &weight)?;
        registry.install_transform("head.weight", AdapterKind::Lora.build(2))?;
        registry.materialize_transforms()?;

        let dir = TempDir::new()?;
        let path = dir.path().join(ADAPTER_WEIGHTS_FILENAME);
        save_selective(&registry, &["lora_"], &path)?;
        assert!(path.exists());

        let loaded = load_state_dict(&path, &device)?;
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains_key("head.weight.lora_a"));
        assert!(loaded.contains_key("head.weight.lora_b"));
        assert_eq!(loaded["head.weight.lora_a"].dims(), &[2, 6]);
        // The frozen base weight is not part of the selective checkpoint.
        assert!(!loaded.contains_key("head.weight"));
        Ok(())
    }

    #[test]
    fn test_empty_checkpoint_never_written() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut registry = ParamRegistry::new();
        let weight = Tensor::randn(0f32, 1f32, (4, 4), &device)?;
        registry.register_tensor("head.weight", &weight)?;

        let dir = TempDir::new()?;
        let path = dir.path().join(ADAPTER_WEIGHTS_FILENAME);
        assert!(save_selective(&registry, &["lora_"], &path).is_err());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_config_round_trip() -> anyhow::Result<()> {
        use crate::adapters::AdapterKind;
        use crate::inject::InjectConfig;

        let dir = TempDir::new()?;
        let path = dir.path().join(ADAPTER_CONFIG_FILENAME);

        let config = InjectConfig {
            kind: AdapterKind::Dora,
            rank: 16,
            submodule: "stacked_transformer".into(),
        };
        save_config(&config, &path)?;

        let loaded: InjectConfig = load_config(&path)?;
        assert_eq!(loaded.kind, AdapterKind::Dora);
        assert_eq!(loaded.rank, 16);
        assert_eq!(loaded.submodule, "stacked_transformer");
        Ok(())
    }
}
