//! Explicit parameter registry standing in for a module tree.
//!
//! Rather than reflecting over a model's attributes at runtime, the model
//! registers every named parameter here once at construction time. Reads
//! of an adapted parameter route through the installed
//! [`WeightTransform`]; the frozen raw tensor is never handed out for an
//! adapted slot.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Tensor, Var};

use crate::error::{LoadcastError, Result};
use crate::traits::WeightTransform;

/// One registered parameter: the raw variable, its trainability flag,
/// and an optional transform routing reads.
struct ParamSlot {
    base: Var,
    trainable: bool,
    transform: Option<Box<dyn WeightTransform>>,
}

/// Ordered map from dotted parameter path to parameter slot.
///
/// Paths follow the usual `block.layer.weight` convention; a "submodule"
/// is simply a shared dotted prefix.
#[derive(Default)]
pub struct ParamRegistry {
    slots: BTreeMap<String, ParamSlot>,
}

impl ParamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter under a dotted path. New parameters are
    /// trainable until frozen.
    ///
    /// # Errors
    /// Returns [`LoadcastError::DuplicateParameter`] if the path is taken.
    pub fn register(&mut self, path: impl Into<String>, var: Var) -> Result<()> {
        let path = path.into();
        if self.slots.contains_key(&path) {
            return Err(LoadcastError::DuplicateParameter { path });
        }
        self.slots.insert(
            path,
            ParamSlot {
                base: var,
                trainable: true,
                transform: None,
            },
        );
        Ok(())
    }

    /// Register a plain tensor, wrapping it in a fresh [`Var`].
    ///
    /// # Errors
    /// Returns an error if the path is taken or the wrap fails.
    pub fn register_tensor(&mut self, path: impl Into<String>, tensor: &Tensor) -> Result<()> {
        self.register(path, Var::from_tensor(tensor)?)
    }

    /// Number of registered parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All registered paths, in lexicographic order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Paths under a dotted prefix; the empty prefix scopes the whole
    /// registry.
    pub fn params_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.slots
            .keys()
            .filter(move |path| prefix.is_empty() || path.starts_with(&format!("{prefix}.")))
            .map(String::as_str)
    }

    /// Whether any parameter lives under the dotted prefix.
    #[must_use]
    pub fn contains_submodule(&self, prefix: &str) -> bool {
        self.params_under(prefix).next().is_some()
    }

    /// The effective weight at `path`: routed through the installed
    /// transform when present, otherwise the raw tensor.
    ///
    /// Gradients flow into the transform's factors only; the raw tensor
    /// stays frozen unless explicitly marked trainable.
    ///
    /// # Errors
    /// Returns [`LoadcastError::ParameterNotFound`] for unknown paths.
    pub fn weight(&self, path: &str) -> Result<Tensor> {
        let slot = self.slot(path)?;
        match &slot.transform {
            Some(transform) => transform.effective_weight(slot.base.as_tensor()),
            None => Ok(slot.base.as_tensor().clone()),
        }
    }

    /// Number of dimensions of the raw parameter at `path`.
    ///
    /// # Errors
    /// Returns an error for unknown paths.
    pub fn ndim(&self, path: &str) -> Result<usize> {
        Ok(self.slot(path)?.base.dims().len())
    }

    /// Mark every parameter non-trainable.
    pub fn freeze_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.trainable = false;
        }
    }

    /// Set the trainability flag of one parameter.
    ///
    /// # Errors
    /// Returns an error for unknown paths.
    pub fn set_trainable(&mut self, path: &str, trainable: bool) -> Result<()> {
        let slot = self
            .slots
            .get_mut(path)
            .ok_or_else(|| LoadcastError::ParameterNotFound { path: path.into() })?;
        slot.trainable = trainable;
        Ok(())
    }

    /// Trainability flag of one parameter.
    ///
    /// # Errors
    /// Returns an error for unknown paths.
    pub fn is_trainable(&self, path: &str) -> Result<bool> {
        Ok(self.slot(path)?.trainable)
    }

    /// Install a transform over the parameter slot at `path`.
    ///
    /// Returns `false` without touching the slot if a transform is
    /// already installed - re-adapting the same parameter is a silent
    /// skip, never an error.
    ///
    /// # Errors
    /// Returns an error for unknown paths.
    pub fn install_transform(
        &mut self,
        path: &str,
        transform: Box<dyn WeightTransform>,
    ) -> Result<bool> {
        let slot = self
            .slots
            .get_mut(path)
            .ok_or_else(|| LoadcastError::ParameterNotFound { path: path.into() })?;
        if slot.transform.is_some() {
            return Ok(false);
        }
        slot.transform = Some(transform);
        Ok(true)
    }

    /// Whether a transform is installed at `path`.
    #[must_use]
    pub fn has_transform(&self, path: &str) -> bool {
        self.slots
            .get(path)
            .is_some_and(|slot| slot.transform.is_some())
    }

    /// Compute every adapted effective weight once, so transform factors
    /// exist before the optimizer is constructed.
    ///
    /// # Errors
    /// Returns an error if any effective-weight computation fails.
    pub fn materialize_transforms(&self) -> Result<()> {
        for slot in self.slots.values() {
            if let Some(transform) = &slot.transform {
                transform.effective_weight(slot.base.as_tensor())?;
            }
        }
        Ok(())
    }

    /// All variables the optimizer should update: base variables still
    /// marked trainable plus the materialized transform factors.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        for slot in self.slots.values() {
            if slot.trainable {
                vars.push(slot.base.clone());
            }
            if let Some(transform) = &slot.transform {
                vars.extend(transform.trainable_vars());
            }
        }
        vars
    }

    /// Total scalar count across all registered parameters and
    /// materialized transform factors.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.slots
            .values()
            .map(|slot| {
                slot.base.elem_count()
                    + slot
                        .transform
                        .as_ref()
                        .map_or(0, |transform| transform.num_parameters())
            })
            .sum()
    }

    /// Scalar count of trainable parameters only.
    #[must_use]
    pub fn num_trainable_parameters(&self) -> usize {
        self.trainable_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }

    /// Full parameter snapshot: raw tensors at their paths, transform
    /// factors under `{path}.{factor}` names.
    #[must_use]
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        for (path, slot) in &self.slots {
            state.insert(path.clone(), slot.base.as_tensor().clone());
            if let Some(transform) = &slot.transform {
                state.extend(transform.named_tensors(path));
            }
        }
        state
    }

    fn slot(&self, path: &str) -> Result<&ParamSlot> {
        self.slots
            .get(path)
            .ok_or_else(|| LoadcastError::ParameterNotFound { path: path.into() })
    }
}
