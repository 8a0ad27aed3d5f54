//! Command-line surface.
//!
//! `hsvg train` loads a YAML file (or a preset) and applies any override
//! flags on top of it before validating.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{HsvgConfig, LevelConfig, OptimizerKind};
use crate::error::Result;

/// HSVG command line.
#[derive(Debug, Parser)]
#[command(name = "hsvg")]
#[command(about = "Hierarchical stochastic video prediction training")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Start or resume training
    Train {
        /// Path to configuration file; the preset is used when omitted
        config: Option<PathBuf>,
        /// Preset to start from without a configuration file (smmnist, kth, test)
        #[arg(long, default_value = "smmnist")]
        preset: String,
        /// Overrides applied on top of the configuration
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Preset (smmnist, kth, test)
        #[arg(long, default_value = "smmnist")]
        preset: String,
    },
}

/// Per-field overrides for `hsvg train`.
#[derive(Debug, Default, Clone, Args)]
pub struct Overrides {
    /// Learning rate
    #[arg(long)]
    pub lr: Option<f64>,
    /// Momentum term for Adam
    #[arg(long)]
    pub beta1: Option<f64>,
    /// Batch size
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Number of epochs to train for
    #[arg(long)]
    pub n_epochs: Option<usize>,
    /// Steps per epoch
    #[arg(long)]
    pub epoch_size: Option<usize>,
    /// Random seed
    #[arg(long)]
    pub seed: Option<u64>,
    /// Frame width and height
    #[arg(long)]
    pub image_width: Option<usize>,
    /// Image channels
    #[arg(long)]
    pub channels: Option<usize>,
    /// Encoder output size
    #[arg(long)]
    pub g_dim: Option<usize>,
    /// Number of hierarchy levels
    #[arg(long)]
    pub n_level: Option<usize>,
    /// Latent size of the coarsest level; level i gets z_dim * (n_level - i)
    #[arg(long)]
    pub z_dim: Option<usize>,
    /// LSTM width of every level
    #[arg(long)]
    pub rnn_size: Option<usize>,
    /// Stacked LSTM cells per recurrent module
    #[arg(long)]
    pub rnn_layers: Option<usize>,
    /// Weight on the KL term
    #[arg(long)]
    pub beta: Option<f64>,
    /// Optimizer (adam, rmsprop, sgd)
    #[arg(long)]
    pub optimizer: Option<String>,
    /// Frames to condition on
    #[arg(long)]
    pub n_past: Option<usize>,
    /// Frames to predict during training
    #[arg(long)]
    pub n_future: Option<usize>,
    /// Frames to roll out during evaluation
    #[arg(long)]
    pub n_eval: Option<usize>,
    /// Rollouts per evaluation
    #[arg(long)]
    pub n_samples: Option<usize>,
    /// Base directory for logs and checkpoints
    #[arg(long)]
    pub log_dir: Option<String>,
    /// Run name replacing the derived model id
    #[arg(long)]
    pub name: Option<String>,
    /// Root directory for on-disk data
    #[arg(long)]
    pub data_root: Option<String>,
    /// Loader worker threads
    #[arg(long)]
    pub data_threads: Option<usize>,
    /// Moving objects per synthetic sequence
    #[arg(long)]
    pub num_blocks: Option<usize>,
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

impl Overrides {
    /// Apply every given flag to `config`.
    ///
    /// Any of `g_dim`, `n_level`, `z_dim`, `rnn_size` or `rnn_layers`
    /// regenerates the level schedule from the resulting values.
    ///
    /// # Errors
    ///
    /// Returns [`crate::HsvgError::UnknownOptimizer`] for an unknown optimizer name.
    pub fn apply(&self, config: &mut HsvgConfig) -> Result<()> {
        let training = &mut config.training;
        set(&mut training.learning_rate, self.lr);
        set(&mut training.beta1, self.beta1);
        set(&mut training.batch_size, self.batch_size);
        set(&mut training.n_epochs, self.n_epochs);
        set(&mut training.epoch_size, self.epoch_size);
        set(&mut training.beta, self.beta);
        set(&mut training.n_past, self.n_past);
        set(&mut training.n_future, self.n_future);
        set(&mut training.n_eval, self.n_eval);
        set(&mut training.n_samples, self.n_samples);
        if let Some(name) = &self.optimizer {
            training.optimizer = name.parse::<OptimizerKind>()?;
        }

        set(&mut config.seed, self.seed);
        set(&mut config.log_dir, self.log_dir.clone());
        set(&mut config.name, self.name.clone());
        set(&mut config.data.data_root, self.data_root.clone());
        set(&mut config.data.data_threads, self.data_threads);
        set(&mut config.data.num_blocks, self.num_blocks);

        let model = &mut config.model;
        set(&mut model.image_width, self.image_width);
        set(&mut model.channels, self.channels);

        let reschedule = self.g_dim.is_some()
            || self.n_level.is_some()
            || self.z_dim.is_some()
            || self.rnn_size.is_some()
            || self.rnn_layers.is_some();
        if reschedule {
            set(&mut model.g_dim, self.g_dim);
            let finest = model.levels.first();
            let n_level = self.n_level.unwrap_or(model.levels.len());
            let z_dim = self
                .z_dim
                .or_else(|| model.levels.last().map(|l| l.z_dim))
                .unwrap_or(1);
            let rnn_size = self
                .rnn_size
                .or_else(|| finest.map(|l| l.rnn_size))
                .unwrap_or(256);
            let rnn_layers = self
                .rnn_layers
                .or_else(|| finest.map(|l| l.rnn_layers))
                .unwrap_or(1);
            model.levels = LevelConfig::schedule(n_level, z_dim, model.g_dim, rnn_size, rnn_layers);
        }
        Ok(())
    }
}

impl Commands {
    /// Resolve the configuration for `train`: file or preset, then overrides.
    pub fn train_config(
        config: Option<&PathBuf>,
        preset: &str,
        overrides: &Overrides,
    ) -> Result<HsvgConfig> {
        let mut resolved = match config {
            Some(path) => HsvgConfig::from_file(path)?,
            None => HsvgConfig::from_preset(preset)?,
        };
        overrides.apply(&mut resolved)?;
        resolved.validate()?;
        Ok(resolved)
    }
}
