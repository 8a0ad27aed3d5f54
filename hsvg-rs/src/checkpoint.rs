//! Epoch checkpoints.
//!
//! A checkpoint is a single safetensors file `hsvgnet_ep<NNNN>.safetensors`
//! in the run directory. It holds three groups of entries:
//!
//! - `model.<path>`: every model parameter
//! - `optim.<key>`: optimizer moments (see [`HsvgOptimizer::state_tensors`])
//! - `meta.epoch`, `meta.step_count`, `meta.learning_rate`
//!
//! Files are written to a temporary name and renamed into place, so a reader
//! never observes a half-written checkpoint.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::{HsvgError, Result};
use crate::optimizer::HsvgOptimizer;

const PREFIX: &str = "hsvgnet_ep";
const EXTENSION: &str = "safetensors";
const MODEL: &str = "model.";
const OPTIM: &str = "optim.";
const META_EPOCH: &str = "meta.epoch";
const META_STEP: &str = "meta.step_count";
const META_LR: &str = "meta.learning_rate";

/// Metadata restored from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    /// Last completed epoch.
    pub epoch: usize,
    /// Optimizer updates applied so far.
    pub step_count: usize,
    /// Learning rate at save time.
    pub learning_rate: f64,
    /// File the record was read from.
    pub path: PathBuf,
}

impl CheckpointRecord {
    /// Epoch to continue training from.
    #[must_use]
    pub fn resume_epoch(&self) -> usize {
        self.epoch + 1
    }
}

/// Saves and discovers checkpoints in one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manage checkpoints in `dir`, creating it if missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the checkpoints.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint for `epoch`.
    #[must_use]
    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{epoch:04}.{EXTENSION}"))
    }

    /// Save model parameters and optimizer state after `epoch`.
    pub fn save(&self, epoch: usize, var_map: &VarMap, optimizer: &HsvgOptimizer) -> Result<PathBuf> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        {
            let data = var_map
                .data()
                .lock()
                .map_err(|e| HsvgError::Checkpoint(format!("parameter map poisoned: {e}")))?;
            for (name, var) in data.iter() {
                tensors.insert(format!("{MODEL}{name}"), var.as_tensor().clone());
            }
        }
        for (key, tensor) in optimizer.state_tensors() {
            tensors.insert(format!("{OPTIM}{key}"), tensor);
        }
        tensors.insert(META_EPOCH.into(), counter(epoch)?);
        tensors.insert(META_STEP.into(), counter(optimizer.step_count())?);
        tensors.insert(
            META_LR.into(),
            Tensor::new(&[optimizer.learning_rate()], &Device::Cpu)?,
        );

        let path = self.checkpoint_path(epoch);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        candle_core::safetensors::save(&tensors, &tmp)?;
        fs::rename(&tmp, &path)?;
        tracing::info!("{} was saved.", path.display());
        Ok(path)
    }

    /// Epochs with a checkpoint on disk, ascending.
    pub fn checkpoint_epochs(&self) -> Result<Vec<usize>> {
        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(epoch) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_epoch)
            {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Most recent checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .checkpoint_epochs()?
            .last()
            .map(|&epoch| self.checkpoint_path(epoch)))
    }

    /// Restore `var_map` and `optimizer` from `path`.
    ///
    /// # Errors
    ///
    /// Any unreadable file, missing entry or shape mismatch is reported as
    /// [`HsvgError::Checkpoint`].
    pub fn load(
        &self,
        path: &Path,
        var_map: &VarMap,
        optimizer: &mut HsvgOptimizer,
    ) -> Result<CheckpointRecord> {
        let device = first_device(var_map)?;
        let mut tensors = candle_core::safetensors::load(path, &device).map_err(|e| {
            HsvgError::Checkpoint(format!("failed to read {}: {e}", path.display()))
        })?;

        let epoch = read_counter(&mut tensors, META_EPOCH)?;
        let step_count = read_counter(&mut tensors, META_STEP)?;
        let learning_rate = take(&mut tensors, META_LR)?
            .to_vec1::<f64>()?
            .first()
            .copied()
            .ok_or_else(|| HsvgError::Checkpoint(format!("{META_LR} is empty")))?;

        let mut optim_state = HashMap::new();
        let mut model_state = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL) {
                model_state.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIM) {
                optim_state.insert(name.to_string(), tensor);
            } else {
                return Err(HsvgError::Checkpoint(format!("unexpected entry: {key}")));
            }
        }

        {
            let data = var_map
                .data()
                .lock()
                .map_err(|e| HsvgError::Checkpoint(format!("parameter map poisoned: {e}")))?;
            if data.len() != model_state.len() {
                return Err(HsvgError::Checkpoint(format!(
                    "checkpoint has {} parameters, model has {}",
                    model_state.len(),
                    data.len()
                )));
            }
            for (name, var) in data.iter() {
                let saved = model_state
                    .get(name)
                    .ok_or_else(|| HsvgError::Checkpoint(format!("missing parameter {name}")))?;
                if saved.dims() != var.dims() {
                    return Err(HsvgError::Checkpoint(format!(
                        "parameter {name}: saved shape {:?}, model shape {:?}",
                        saved.dims(),
                        var.dims()
                    )));
                }
                var.set(&saved.to_dtype(var.dtype())?)?;
            }
        }

        optimizer.load_state(optim_state, step_count)?;
        optimizer.set_learning_rate(learning_rate);

        Ok(CheckpointRecord {
            epoch,
            step_count,
            learning_rate,
            path: path.to_path_buf(),
        })
    }
}

fn parse_epoch(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(PREFIX)?
        .strip_suffix(EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn counter(value: usize) -> Result<Tensor> {
    let value = i64::try_from(value)
        .map_err(|_| HsvgError::Checkpoint(format!("counter {value} does not fit in i64")))?;
    Ok(Tensor::new(&[value], &Device::Cpu)?)
}

fn take(tensors: &mut HashMap<String, Tensor>, key: &str) -> Result<Tensor> {
    tensors
        .remove(key)
        .ok_or_else(|| HsvgError::Checkpoint(format!("missing entry {key}")))
}

fn read_counter(tensors: &mut HashMap<String, Tensor>, key: &str) -> Result<usize> {
    let value = take(tensors, key)?
        .to_vec1::<i64>()?
        .first()
        .copied()
        .ok_or_else(|| HsvgError::Checkpoint(format!("{key} is empty")))?;
    usize::try_from(value).map_err(|_| HsvgError::Checkpoint(format!("{key} is negative")))
}

fn first_device(var_map: &VarMap) -> Result<Device> {
    Ok(var_map
        .all_vars()
        .first()
        .map_or(Device::Cpu, |v| v.device().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerConfig;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn params(value: f64) -> (VarMap, Tensor) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let w = vb
            .pp("layer")
            .get_with_hints((2, 2), "weight", Init::Const(value))
            .unwrap();
        (var_map, w)
    }

    fn trained_optimizer(var_map: &VarMap, w: &Tensor) -> HsvgOptimizer {
        let mut optimizer = OptimizerConfig::default().build();
        let loss = w.sqr().unwrap().sum_all().unwrap();
        optimizer.backward_step(var_map, &loss).unwrap();
        optimizer.set_learning_rate(0.0015);
        optimizer
    }

    #[test]
    fn test_checkpoint_path_format() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        assert_eq!(
            manager.checkpoint_path(9),
            dir.path().join("hsvgnet_ep0009.safetensors")
        );
    }

    #[test]
    fn test_parse_epoch() {
        assert_eq!(parse_epoch("hsvgnet_ep0019.safetensors"), Some(19));
        assert_eq!(parse_epoch("hsvgnet_ep0019.safetensors.tmp"), None);
        assert_eq!(parse_epoch("hsvgnet_ep0019.pth.tar"), None);
        assert_eq!(parse_epoch("other_ep0019.safetensors"), None);
    }

    #[test]
    fn test_empty_dir_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("nested/run")).unwrap();
        assert!(manager.dir().exists());
        assert!(manager.latest_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_restores_params_and_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();

        let (var_map, w) = params(1.0);
        let optimizer = trained_optimizer(&var_map, &w);
        let path = manager.save(9, &var_map, &optimizer).unwrap();
        assert!(path.exists());

        let (restored_map, restored_w) = params(0.0);
        let mut restored_opt = OptimizerConfig::default().build();
        let record = manager.load(&path, &restored_map, &mut restored_opt).unwrap();

        assert_eq!(record.epoch, 9);
        assert_eq!(record.resume_epoch(), 10);
        assert_eq!(record.step_count, 1);
        assert_eq!(restored_opt.learning_rate(), 0.0015);
        assert_eq!(
            restored_w.to_vec2::<f32>().unwrap(),
            w.to_vec2::<f32>().unwrap()
        );

        let saved_state = optimizer.state_tensors();
        let loaded_state = restored_opt.state_tensors();
        assert_eq!(saved_state.len(), loaded_state.len());
        for (key, tensor) in &saved_state {
            assert_eq!(
                tensor.to_vec2::<f32>().unwrap(),
                loaded_state[key].to_vec2::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn test_latest_checkpoint_picks_highest_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let (var_map, w) = params(1.0);
        let optimizer = trained_optimizer(&var_map, &w);
        for epoch in [9, 29, 19] {
            manager.save(epoch, &var_map, &optimizer).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(manager.checkpoint_epochs().unwrap(), vec![9, 19, 29]);
        assert_eq!(
            manager.latest_checkpoint().unwrap(),
            Some(manager.checkpoint_path(29))
        );
    }

    #[test]
    fn test_corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let path = manager.checkpoint_path(0);
        fs::write(&path, b"not a safetensors file").unwrap();

        let (var_map, _) = params(1.0);
        let mut optimizer = OptimizerConfig::default().build();
        let err = manager.load(&path, &var_map, &mut optimizer).unwrap_err();
        assert!(matches!(err, HsvgError::Checkpoint(_)));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).unwrap();
        let (var_map, w) = params(1.0);
        let optimizer = trained_optimizer(&var_map, &w);
        let path = manager.save(0, &var_map, &optimizer).unwrap();

        let other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        vb.pp("layer")
            .get_with_hints((3, 2), "weight", Init::Const(0.0))
            .unwrap();
        let mut opt = OptimizerConfig::default().build();
        assert!(matches!(
            manager.load(&path, &other, &mut opt),
            Err(HsvgError::Checkpoint(_))
        ));
    }
}
