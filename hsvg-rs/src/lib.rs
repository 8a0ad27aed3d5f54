//! # hsvg-rs
//!
//! Hierarchical stochastic video prediction (HSVG) in pure Rust.
//!
//! A stack of recurrent latent levels sits between a convolutional frame
//! encoder and a skip-aware decoder. Each level keeps a learned Gaussian
//! prior and posterior; the coarsest level runs first and feeds its output
//! down to the finer ones. Training maximizes an evidence lower bound over
//! short clips (reconstruction loss plus `beta`-weighted KL); evaluation
//! conditions on a few observed frames and samples the rest from the prior.
//!
//! ## Features
//!
//! - **YAML Configuration** - whole runs, including the per-level schedule
//! - **Adam / RMSprop / SGD** - with checkpointable moment state
//! - **Resumable** - epoch checkpoints in safetensors, latest one wins
//! - **Prefetching loader** - worker threads feeding a bounded queue
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a sample configuration
//! hsvg init config.yaml --preset smmnist
//!
//! # Train, overriding a few fields
//! hsvg train config.yaml --n-future 5 --optimizer rmsprop
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use hsvg_rs::{HsvgConfig, Trainer};
//!
//! # fn main() -> hsvg_rs::Result<()> {
//! let config = HsvgConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Driving the model directly
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use hsvg_rs::{HsvgConfig, HsvgModel, StepMode};
//! use hsvg_rs::noise::SeededNoise;
//!
//! # fn main() -> hsvg_rs::Result<()> {
//! let config = HsvgConfig::from_preset("test")?;
//! let mut model = HsvgModel::new(&config.model, &Device::Cpu, Box::new(SeededNoise::new(0)))?;
//! let x0 = Tensor::zeros((2, 1, 8, 8), candle_core::DType::F32, &Device::Cpu)?;
//! model.init_states(&x0)?;
//! let out = model.step(&x0, true, StepMode::Reconstruction)?;
//! assert_eq!(out.x_out.dims(), &[2, 1, 8, 8]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod hierarchy;
pub mod latent;
pub mod loader;
pub mod model;
pub mod network;
pub mod noise;
pub mod optimizer;
pub mod rollout;
pub mod scheduler;
pub mod summary;
pub mod trainer;

pub use config::{HsvgConfig, TrainingConfig};
pub use error::{HsvgError, Result};
pub use model::{HsvgModel, StepMode};
pub use trainer::Trainer;
