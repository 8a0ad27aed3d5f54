//! Optimizers (Adam, RMSprop, SGD) with checkpointable state.
//!
//! Updates are applied in place to every variable of a [`VarMap`] that has a
//! gradient in the [`GradStore`]. Moment estimates are keyed by the variable's
//! path so they can be written to and restored from a checkpoint.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use candle_nn::VarMap;

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{HsvgError, Result};

const FIRST_MOMENT: &str = "first.";
const SECOND_MOMENT: &str = "second.";

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Optimizer family
    pub kind: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Smoothing constant for RMSprop
    pub alpha: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 0.002,
            beta1: 0.9,
            beta2: 0.999,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Take kind, learning rate and `beta1` from the training section.
    #[must_use]
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self {
            kind: training.optimizer,
            learning_rate: training.learning_rate,
            beta1: training.beta1,
            ..Self::default()
        }
    }

    /// Create the optimizer with empty state.
    #[must_use]
    pub fn build(&self) -> HsvgOptimizer {
        HsvgOptimizer {
            config: self.clone(),
            step_count: 0,
            first: HashMap::new(),
            second: HashMap::new(),
        }
    }
}

/// Stateful optimizer over the parameters of a [`VarMap`].
#[derive(Debug)]
pub struct HsvgOptimizer {
    config: OptimizerConfig,
    step_count: usize,
    /// First moments (Adam).
    first: HashMap<String, Tensor>,
    /// Second moments (Adam, RMSprop).
    second: HashMap<String, Tensor>,
}

impl HsvgOptimizer {
    /// Optimizer family.
    #[must_use]
    pub fn kind(&self) -> OptimizerKind {
        self.config.kind
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Updates applied so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Backpropagate `loss` and apply one update.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn backward_step(&mut self, var_map: &VarMap, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(var_map, &grads)
    }

    /// Apply one update using precomputed gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter map is poisoned or a tensor op fails.
    pub fn step(&mut self, var_map: &VarMap, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let data = var_map
            .data()
            .lock()
            .map_err(|e| HsvgError::Training(format!("parameter map poisoned: {e}")))?;

        for (name, var) in data.iter() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let update = match self.config.kind {
                OptimizerKind::Adam => self.adam_update(name, grad)?,
                OptimizerKind::RmsProp => self.rmsprop_update(name, grad)?,
                OptimizerKind::Sgd => (grad * self.config.learning_rate)?,
            };
            var.set(&(var.as_tensor() - update)?)?;
        }
        Ok(())
    }

    fn moment(map: &mut HashMap<String, Tensor>, name: &str, like: &Tensor) -> Result<Tensor> {
        if let Some(t) = map.get(name) {
            return Ok(t.clone());
        }
        let zeros = Tensor::zeros(like.dims(), DType::F32, like.device())?;
        map.insert(name.to_string(), zeros.clone());
        Ok(zeros)
    }

    fn adam_update(&mut self, name: &str, grad: &Tensor) -> Result<Tensor> {
        let OptimizerConfig {
            learning_rate,
            beta1,
            beta2,
            eps,
            ..
        } = self.config;
        let t = i32::try_from(self.step_count).unwrap_or(i32::MAX);
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        let m = Self::moment(&mut self.first, name, grad)?;
        let v = Self::moment(&mut self.second, name, grad)?;
        let m = ((m * beta1)? + (grad * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let denom = ((v.sqrt()? / bc2.sqrt())? + eps)?;
        let update = ((&m / denom)? * (learning_rate / bc1))?;

        self.first.insert(name.to_string(), m);
        self.second.insert(name.to_string(), v);
        Ok(update)
    }

    fn rmsprop_update(&mut self, name: &str, grad: &Tensor) -> Result<Tensor> {
        let OptimizerConfig {
            learning_rate,
            alpha,
            eps,
            ..
        } = self.config;
        let v = Self::moment(&mut self.second, name, grad)?;
        let v = ((v * alpha)? + (grad.sqr()? * (1.0 - alpha))?)?;
        let update = ((grad / (v.sqrt()? + eps)?)? * learning_rate)?;
        self.second.insert(name.to_string(), v);
        Ok(update)
    }

    /// Moment estimates as a flat tensor map, e.g. `first.encoder.head.weight`.
    #[must_use]
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let first = self
            .first
            .iter()
            .map(|(k, v)| (format!("{FIRST_MOMENT}{k}"), v.clone()));
        let second = self
            .second
            .iter()
            .map(|(k, v)| (format!("{SECOND_MOMENT}{k}"), v.clone()));
        first.chain(second).collect()
    }

    /// Restore moments written by [`HsvgOptimizer::state_tensors`] together
    /// with the step count used for bias correction.
    ///
    /// # Errors
    ///
    /// Returns [`HsvgError::Checkpoint`] on keys that are not moment entries.
    pub fn load_state(&mut self, tensors: HashMap<String, Tensor>, step_count: usize) -> Result<()> {
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(FIRST_MOMENT) {
                first.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(SECOND_MOMENT) {
                second.insert(name.to_string(), tensor);
            } else {
                return Err(HsvgError::Checkpoint(format!(
                    "unexpected optimizer state entry: {key}"
                )));
            }
        }
        self.first = first;
        self.second = second;
        self.step_count = step_count;
        Ok(())
    }
}
