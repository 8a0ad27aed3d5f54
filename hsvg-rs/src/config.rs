//! Configuration parsing and validation.
//!
//! A run is fully described by an [`HsvgConfig`], usually loaded from YAML and
//! then patched by command-line overrides (see [`crate::cli`]). The hierarchy
//! is an explicit list of [`LevelConfig`] entries, one per level, so the
//! dimensionality schedule is data that can be inspected and validated rather
//! than something recomputed inline from a single scalar.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HsvgError, Result};

/// Main configuration for HSVG training.
///
/// # Example
///
/// ```rust
/// use hsvg_rs::HsvgConfig;
///
/// # fn main() -> hsvg_rs::Result<()> {
/// let mut config = HsvgConfig::from_preset("smmnist")?;
/// config.training.n_future = 5;
/// config.validate()?;
/// assert_eq!(config.training.seq_len(), 10);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HsvgConfig {
    /// Network shape and hierarchy schedule.
    pub model: ModelConfig,

    /// Optimization and unrolling hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Dataset selection and loader settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Base directory for logs, samples and checkpoints.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Run identifier; replaces the derived model id when non-empty.
    #[serde(default)]
    pub name: String,

    /// Random seed for noise, shuffling and synthetic data.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_log_dir() -> String {
    "logs/hsvg/".into()
}

fn default_seed() -> u64 {
    1
}

/// Frame encoder/decoder shape plus the per-level hierarchy schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image channels (1 for grayscale).
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Frame height and width; a power of two, at least 8.
    #[serde(default = "default_image_width")]
    pub image_width: usize,

    /// Encoder output / decoder input dimensionality.
    #[serde(default = "default_g_dim")]
    pub g_dim: usize,

    /// Width of the first convolution; doubles at every downsampling stage.
    #[serde(default = "default_filters")]
    pub filters: usize,

    /// Hierarchy levels, index 0 is the finest.
    pub levels: Vec<LevelConfig>,

    /// How the per-pixel squared error is reduced.
    #[serde(default)]
    pub rec_criterion: RecCriterion,
}

fn default_channels() -> usize {
    1
}
fn default_image_width() -> usize {
    64
}
fn default_g_dim() -> usize {
    128
}
fn default_filters() -> usize {
    64
}

/// Dimensions of one hierarchy level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Latent dimensionality.
    pub z_dim: usize,
    /// Size of the top-down signal this level emits.
    pub out_dim: usize,
    /// LSTM width.
    pub rnn_size: usize,
    /// Stacked LSTM cells per recurrent module.
    #[serde(default = "default_rnn_layers")]
    pub rnn_layers: usize,
}

fn default_rnn_layers() -> usize {
    1
}

impl LevelConfig {
    /// Build the default schedule: level `i` of `n_level` gets
    /// `z_dim * (n_level - i)` latents and `(g_dim / 8) * (n_level - i)`
    /// outputs, so the finest level is the widest.
    ///
    /// ```rust
    /// use hsvg_rs::config::LevelConfig;
    ///
    /// let levels = LevelConfig::schedule(3, 4, 128, 256, 1);
    /// let z: Vec<usize> = levels.iter().map(|l| l.z_dim).collect();
    /// assert_eq!(z, vec![12, 8, 4]);
    /// assert_eq!(levels[0].out_dim, 48);
    /// ```
    #[must_use]
    pub fn schedule(
        n_level: usize,
        z_dim: usize,
        g_dim: usize,
        rnn_size: usize,
        rnn_layers: usize,
    ) -> Vec<Self> {
        (0..n_level)
            .map(|i| Self {
                z_dim: z_dim * (n_level - i),
                out_dim: (g_dim / 8).max(1) * (n_level - i),
                rnn_size,
                rnn_layers,
            })
            .collect()
    }
}

/// Reduction applied to the reconstruction error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecCriterion {
    /// Mean over every element (`MSELoss` default).
    #[default]
    Mean,
    /// Sum over every element.
    Sum,
}

/// Optimizer family, resolved once when the configuration is read.
///
/// ```rust
/// use hsvg_rs::config::OptimizerKind;
///
/// assert_eq!("rmsprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
/// assert!("adagrad".parse::<OptimizerKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    /// Adam with `(beta1, 0.999)` betas.
    #[default]
    Adam,
    /// RMSprop with smoothing constant 0.99.
    RmsProp,
    /// Plain stochastic gradient descent.
    Sgd,
}

impl OptimizerKind {
    /// Name used on the command line and in YAML.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Sgd => "sgd",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = HsvgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(HsvgError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = HsvgError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(kind: OptimizerKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Initial learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Momentum term for Adam.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Sequences per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Optimizer family.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Epochs to train for.
    #[serde(default = "default_epochs")]
    pub n_epochs: usize,

    /// Training steps per epoch.
    #[serde(default = "default_epoch_size")]
    pub epoch_size: usize,

    /// Weight on the KL term.
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Multiplicative learning-rate decay applied once per epoch.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,

    /// Frames to condition on.
    #[serde(default = "default_n_past")]
    pub n_past: usize,

    /// Frames to predict during training.
    #[serde(default = "default_n_future")]
    pub n_future: usize,

    /// Frames to roll out during evaluation.
    #[serde(default = "default_n_eval")]
    pub n_eval: usize,

    /// Independent stochastic rollouts per evaluation.
    #[serde(default = "default_n_samples")]
    pub n_samples: usize,

    /// Save a checkpoint after every N completed epochs.
    #[serde(default = "default_save_every")]
    pub save_every: usize,
}

fn default_lr() -> f64 {
    0.002
}
fn default_beta1() -> f64 {
    0.9
}
fn default_batch_size() -> usize {
    100
}
fn default_epochs() -> usize {
    300
}
fn default_epoch_size() -> usize {
    600
}
fn default_beta() -> f64 {
    1e-4
}
fn default_lr_decay() -> f64 {
    0.995
}
fn default_n_past() -> usize {
    5
}
fn default_n_future() -> usize {
    10
}
fn default_n_eval() -> usize {
    30
}
fn default_n_samples() -> usize {
    20
}
fn default_save_every() -> usize {
    10
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            beta1: default_beta1(),
            batch_size: default_batch_size(),
            optimizer: OptimizerKind::Adam,
            n_epochs: default_epochs(),
            epoch_size: default_epoch_size(),
            beta: default_beta(),
            lr_decay: default_lr_decay(),
            n_past: default_n_past(),
            n_future: default_n_future(),
            n_eval: default_n_eval(),
            n_samples: default_n_samples(),
            save_every: default_save_every(),
        }
    }
}

impl TrainingConfig {
    /// Frames unrolled per training sequence (`n_past + n_future`).
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.n_past + self.n_future
    }

    /// Frames a loaded sequence must hold to serve both training and evaluation.
    #[must_use]
    pub fn frames_needed(&self) -> usize {
        self.seq_len().max(self.n_eval)
    }

    /// Number of steps whose losses are accumulated (`n_past + n_future - 2`).
    #[must_use]
    pub fn predicted_steps(&self) -> usize {
        self.seq_len().saturating_sub(2)
    }
}

/// Source of training sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Procedurally generated stochastic bouncing blocks.
    #[default]
    Bouncing,
    /// Pre-rendered `u8` frames stored as safetensors under `data_root`.
    TensorFile,
}

impl DatasetKind {
    /// Short name used in the run directory.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetKind::Bouncing => "bouncing",
            DatasetKind::TensorFile => "tensor_file",
        }
    }
}

/// Dataset and loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset to train with.
    #[serde(default)]
    pub dataset: DatasetKind,

    /// Root directory for on-disk data.
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Moving objects per synthetic sequence.
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,

    /// Synthetic training sequences per pass.
    #[serde(default = "default_train_size")]
    pub train_size: usize,

    /// Synthetic test sequences per pass.
    #[serde(default = "default_test_size")]
    pub test_size: usize,

    /// Loader worker threads; 0 loads inline on the training thread.
    #[serde(default = "default_data_threads")]
    pub data_threads: usize,

    /// Bound on the queue of prepared batches.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_data_root() -> String {
    "data".into()
}
fn default_num_blocks() -> usize {
    2
}
fn default_train_size() -> usize {
    60_000
}
fn default_test_size() -> usize {
    10_000
}
fn default_data_threads() -> usize {
    5
}
fn default_prefetch() -> usize {
    4
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Bouncing,
            data_root: default_data_root(),
            num_blocks: default_num_blocks(),
            train_size: default_train_size(),
            test_size: default_test_size(),
            data_threads: default_data_threads(),
            prefetch: default_prefetch(),
        }
    }
}

impl HsvgConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"smmnist"` - 64×64 grayscale, three levels, synthetic bouncing blocks
    /// - `"kth"` - 64×64 grayscale human actions from a tensor file
    /// - `"test"` - 8×8 toy model for unit tests
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "smmnist" => Ok(Self::smmnist_preset()),
            "kth" => Ok(Self::kth_preset()),
            "test" => Ok(Self::test_preset()),
            _ => Err(HsvgError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Stochastic moving blocks, the defaults of the reference training script.
    #[must_use]
    pub fn smmnist_preset() -> Self {
        Self {
            model: ModelConfig {
                channels: 1,
                image_width: 64,
                g_dim: 128,
                filters: 64,
                levels: LevelConfig::schedule(3, 4, 128, 128, 1),
                rec_criterion: RecCriterion::Mean,
            },
            training: TrainingConfig::default(),
            data: DataConfig::default(),
            log_dir: default_log_dir(),
            name: String::new(),
            seed: default_seed(),
        }
    }

    /// KTH actions: longer conditioning window and wider latents.
    #[must_use]
    pub fn kth_preset() -> Self {
        Self {
            model: ModelConfig {
                channels: 1,
                image_width: 64,
                g_dim: 128,
                filters: 64,
                levels: LevelConfig::schedule(2, 12, 128, 256, 2),
                rec_criterion: RecCriterion::Mean,
            },
            training: TrainingConfig {
                batch_size: 20,
                beta: 1e-6,
                n_past: 10,
                n_future: 10,
                n_eval: 40,
                ..Default::default()
            },
            data: DataConfig {
                dataset: DatasetKind::TensorFile,
                data_root: "data/kth".into(),
                ..Default::default()
            },
            log_dir: default_log_dir(),
            name: String::new(),
            seed: default_seed(),
        }
    }

    /// Tiny three-level model on 8×8 frames; runs in milliseconds on CPU.
    #[must_use]
    pub fn test_preset() -> Self {
        Self {
            model: ModelConfig {
                channels: 1,
                image_width: 8,
                g_dim: 16,
                filters: 4,
                levels: LevelConfig::schedule(3, 2, 16, 8, 1),
                rec_criterion: RecCriterion::Mean,
            },
            training: TrainingConfig {
                learning_rate: 1e-3,
                batch_size: 4,
                n_epochs: 1,
                epoch_size: 2,
                n_past: 2,
                n_future: 2,
                n_eval: 5,
                n_samples: 3,
                save_every: 1,
                ..Default::default()
            },
            data: DataConfig {
                num_blocks: 1,
                train_size: 16,
                test_size: 8,
                data_threads: 0,
                prefetch: 2,
                ..Default::default()
            },
            log_dir: default_log_dir(),
            name: String::new(),
            seed: 7,
        }
    }

    /// Number of hierarchy levels.
    #[must_use]
    pub fn n_level(&self) -> usize {
        self.model.levels.len()
    }

    /// Directory name for the dataset, e.g. `bouncing-2`.
    #[must_use]
    pub fn dataset_dir_name(&self) -> String {
        match self.data.dataset {
            DatasetKind::Bouncing => format!("bouncing-{}", self.data.num_blocks),
            DatasetKind::TensorFile => Path::new(&self.data.data_root)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("tensor_file")
                .to_string(),
        }
    }

    /// Identifier of the model inside the dataset directory.
    #[must_use]
    pub fn model_id(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        let z_dim = self.model.levels.last().map_or(0, |l| l.z_dim);
        format!(
            "dcgan-z_dim={}-g_dim={}-n_level={}",
            z_dim,
            self.model.g_dim,
            self.n_level()
        )
    }

    /// `<log_dir>/<dataset>/<model_id>`, where checkpoints and samples live.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
            .join(self.dataset_dir_name())
            .join(self.model_id())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        if model.levels.is_empty() {
            return Err(HsvgError::Config("model.levels must not be empty".into()));
        }
        for (i, level) in model.levels.iter().enumerate() {
            if level.z_dim == 0 || level.out_dim == 0 || level.rnn_size == 0 || level.rnn_layers == 0
            {
                return Err(HsvgError::Config(format!(
                    "model.levels[{i}]: z_dim, out_dim, rnn_size and rnn_layers must be > 0"
                )));
            }
        }
        if model.channels == 0 || model.g_dim == 0 || model.filters == 0 {
            return Err(HsvgError::Config(
                "model.channels, model.g_dim and model.filters must be > 0".into(),
            ));
        }
        if model.image_width < 8 || !model.image_width.is_power_of_two() {
            return Err(HsvgError::Config(format!(
                "model.image_width must be a power of two >= 8, got {}",
                model.image_width
            )));
        }

        let training = &self.training;
        if training.n_past < 2 {
            return Err(HsvgError::Config(
                "training.n_past must be >= 2 (one warm-up frame plus one conditioning frame)".into(),
            ));
        }
        if training.n_future == 0 {
            return Err(HsvgError::Config("training.n_future must be >= 1".into()));
        }
        if training.n_eval < training.n_past {
            return Err(HsvgError::Config(format!(
                "training.n_eval ({}) must be >= training.n_past ({})",
                training.n_eval, training.n_past
            )));
        }
        if training.batch_size == 0 || training.epoch_size == 0 {
            return Err(HsvgError::Config(
                "training.batch_size and training.epoch_size must be > 0".into(),
            ));
        }
        if training.n_samples == 0 || training.save_every == 0 {
            return Err(HsvgError::Config(
                "training.n_samples and training.save_every must be > 0".into(),
            ));
        }
        if !(training.learning_rate > 0.0) {
            return Err(HsvgError::Config("training.learning_rate must be > 0".into()));
        }
        if !(training.lr_decay > 0.0 && training.lr_decay <= 1.0) {
            return Err(HsvgError::Config("training.lr_decay must be in (0, 1]".into()));
        }
        if !(training.beta >= 0.0) {
            return Err(HsvgError::Config("training.beta must be >= 0".into()));
        }

        if self.data.dataset == DatasetKind::TensorFile && self.data.data_root.is_empty() {
            return Err(HsvgError::Config(
                "data.data_root is required for tensor_file datasets".into(),
            ));
        }
        if self.data.prefetch == 0 {
            return Err(HsvgError::Config("data.prefetch must be > 0".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_presets() {
        assert!(HsvgConfig::from_preset("smmnist").is_ok());
        assert!(HsvgConfig::from_preset("kth").is_ok());
        assert!(HsvgConfig::from_preset("test").is_ok());
        assert!(HsvgConfig::from_preset("bair").is_err());
    }

    #[test]
    fn test_presets_validate() {
        for preset in ["smmnist", "kth", "test"] {
            let config = HsvgConfig::from_preset(preset).unwrap();
            assert!(config.validate().is_ok(), "{preset} should validate");
        }
    }

    #[test]
    fn test_config_serialization() {
        let config = HsvgConfig::smmnist_preset();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: HsvgConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.model.levels, restored.model.levels);
        assert_eq!(restored.training.optimizer, OptimizerKind::Adam);
    }

    #[test]
    fn test_schedule_shrinks_with_level() {
        let levels = LevelConfig::schedule(4, 3, 64, 32, 2);
        let z: Vec<usize> = levels.iter().map(|l| l.z_dim).collect();
        let out: Vec<usize> = levels.iter().map(|l| l.out_dim).collect();
        assert_eq!(z, vec![12, 9, 6, 3]);
        assert_eq!(out, vec![32, 24, 16, 8]);
        assert!(levels.iter().all(|l| l.rnn_size == 32 && l.rnn_layers == 2));
    }

    #[test]
    fn test_optimizer_parsing() {
        assert_eq!("adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("RMSprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!(matches!(
            "adagrad".parse::<OptimizerKind>(),
            Err(HsvgError::UnknownOptimizer(name)) if name == "adagrad"
        ));
    }

    #[test]
    fn test_unknown_optimizer_in_yaml_is_rejected() {
        let mut config = HsvgConfig::test_preset();
        config.training.optimizer = OptimizerKind::Sgd;
        let yaml = serde_yaml::to_string(&config)
            .unwrap()
            .replace("optimizer: sgd", "optimizer: adagrad");
        let err = serde_yaml::from_str::<HsvgConfig>(&yaml).unwrap_err();
        assert!(err.to_string().contains("adagrad"));
    }

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
model:
  image_width: 32
  levels:
    - {{ z_dim: 8, out_dim: 32, rnn_size: 64 }}
    - {{ z_dim: 4, out_dim: 16, rnn_size: 64 }}
training:
  optimizer: rmsprop
  n_future: 3
"#
        )
        .unwrap();

        let config = HsvgConfig::from_file(file.path()).unwrap();
        assert_eq!(config.model.image_width, 32);
        assert_eq!(config.n_level(), 2);
        assert_eq!(config.model.levels[0].rnn_layers, 1);
        assert_eq!(config.training.optimizer, OptimizerKind::RmsProp);
        assert_eq!(config.training.n_past, 5);
        assert_eq!(config.training.seq_len(), 8);
        assert_eq!(config.seed, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_width() {
        let mut config = HsvgConfig::test_preset();
        config.model.image_width = 48;
        assert!(config.validate().is_err());
        config.model.image_width = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_short_windows() {
        let mut config = HsvgConfig::test_preset();
        config.training.n_past = 1;
        assert!(config.validate().is_err());

        let mut config = HsvgConfig::test_preset();
        config.training.n_future = 0;
        assert!(config.validate().is_err());

        let mut config = HsvgConfig::test_preset();
        config.training.n_eval = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_levels() {
        let mut config = HsvgConfig::test_preset();
        config.model.levels.clear();
        assert!(config.validate().is_err());

        let mut config = HsvgConfig::test_preset();
        config.model.levels[1].z_dim = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_lr_decay() {
        let mut config = HsvgConfig::test_preset();
        config.training.lr_decay = 1.5;
        assert!(config.validate().is_err());
        config.training.lr_decay = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_dir_layout() {
        let mut config = HsvgConfig::smmnist_preset();
        config.log_dir = "/tmp/logs".into();
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("/tmp/logs/bouncing-2/dcgan-z_dim=4-g_dim=128-n_level=3")
        );

        config.name = "ablation".into();
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("/tmp/logs/bouncing-2/ablation")
        );
    }

    #[test]
    fn test_window_arithmetic() {
        let training = TrainingConfig::default();
        assert_eq!(training.seq_len(), 15);
        assert_eq!(training.predicted_steps(), 13);
        assert_eq!(training.frames_needed(), 30);
    }

    #[test]
    fn test_shipped_configs_validate() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs");
        for name in ["smmnist.yaml", "kth.yaml", "tiny.yaml"] {
            let config = HsvgConfig::from_file(dir.join(name)).unwrap();
            assert!(config.validate().is_ok(), "{name} should validate");
        }
        let smmnist = HsvgConfig::from_file(dir.join("smmnist.yaml")).unwrap();
        assert_eq!(smmnist.model.levels, HsvgConfig::smmnist_preset().model.levels);
    }

    #[test]
    fn test_to_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = HsvgConfig::kth_preset();
        config.to_file(&path).unwrap();
        let restored = HsvgConfig::from_file(&path).unwrap();
        assert_eq!(restored.data.dataset, DatasetKind::TensorFile);
        assert_eq!(restored.training.n_eval, 40);
        assert_eq!(restored.model.levels.len(), 2);
    }
}
