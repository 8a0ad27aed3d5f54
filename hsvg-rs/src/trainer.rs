//! Training loop and evaluation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::config::HsvgConfig;
use crate::dataset::{load_dataset, Split};
use crate::error::{HsvgError, Result};
use crate::loader::{InfiniteBatches, LoaderConfig};
use crate::model::{HsvgModel, StepMode};
use crate::noise::SeededNoise;
use crate::optimizer::{HsvgOptimizer, OptimizerConfig};
use crate::rollout::{
    reconstruction_sequence, rollout, select_display, write_reconstruction, write_samples,
    PlotSink, TensorDumpSink,
};
use crate::scheduler::{LRScheduler, SchedulerType};
use crate::summary::{ScalarWriter, KLD_LOSS_TAG, REC_LOSS_TAG};

/// Reconstruction and KL loss of one step, or averaged over a sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    /// Reconstruction loss.
    pub rec: f64,
    /// KL loss (before the `beta` weight).
    pub kld: f64,
}

/// Mean losses of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    /// Epoch index.
    pub epoch: usize,
    /// Mean reconstruction loss over the epoch's steps.
    pub rec: f64,
    /// Mean KL loss over the epoch's steps.
    pub kld: f64,
    /// Training sequences seen once this epoch finished.
    pub sequences_seen: usize,
}

/// Files written by one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalOutput {
    /// Sample grid.
    pub samples: PathBuf,
    /// Per-time sample frames.
    pub frames: PathBuf,
    /// Reconstruction grid.
    pub reconstruction: PathBuf,
}

struct Unrolled {
    total_rec: Tensor,
    total_kld: Tensor,
    steps: Vec<StepLosses>,
}

/// Training session: model, optimizer, schedule, checkpoints and logs.
///
/// # Example
///
/// ```no_run
/// use hsvg_rs::{HsvgConfig, Trainer};
///
/// # fn main() -> hsvg_rs::Result<()> {
/// let config = HsvgConfig::from_file("configs/smmnist.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let history = trainer.train()?;
/// println!("trained {} epochs", history.len());
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: HsvgConfig,
    device: Device,
    model: HsvgModel,
    optimizer: HsvgOptimizer,
    scheduler: LRScheduler,
    checkpoints: CheckpointManager,
    summary: ScalarWriter,
    sink: Box<dyn PlotSink>,
    display_rng: ChaCha8Rng,
    /// Next epoch to run.
    epoch: usize,
    global_step: u64,
}

impl Trainer {
    /// Create a trainer on the preferred device.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the run directory
    /// cannot be created.
    pub fn new(config: HsvgConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device();
        Self::with_device(config, device)
    }

    /// Create a trainer on an explicit device.
    pub fn with_device(config: HsvgConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let run_dir = config.checkpoint_dir();
        for sub in ["gen", "plots", "train_log"] {
            std::fs::create_dir_all(run_dir.join(sub))?;
        }
        let checkpoints = CheckpointManager::new(&run_dir)?;

        let model = HsvgModel::new(
            &config.model,
            &device,
            Box::new(SeededNoise::new(config.seed)),
        )?;
        let optimizer = OptimizerConfig::from_training(&config.training).build();
        let scheduler = LRScheduler::new(
            SchedulerType::Exponential {
                gamma: config.training.lr_decay,
            },
            config.training.learning_rate,
        );

        Ok(Self {
            display_rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            device,
            model,
            optimizer,
            scheduler,
            checkpoints,
            summary: ScalarWriter::new(),
            sink: Box::new(TensorDumpSink),
            epoch: 0,
            global_step: 0,
        })
    }

    /// Replace the destination of sample grids.
    pub fn set_plot_sink(&mut self, sink: Box<dyn PlotSink>) {
        self.sink = sink;
    }

    /// Configuration of this run.
    #[must_use]
    pub fn config(&self) -> &HsvgConfig {
        &self.config
    }

    /// Device the model lives on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &HsvgModel {
        &self.model
    }

    /// Mutable access to the model, e.g. to swap its noise source.
    pub fn model_mut(&mut self) -> &mut HsvgModel {
        &mut self.model
    }

    /// The optimizer.
    #[must_use]
    pub fn optimizer(&self) -> &HsvgOptimizer {
        &self.optimizer
    }

    /// Next epoch [`Trainer::train`] will run.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Training steps taken, including those before a resume.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Recorded scalars.
    #[must_use]
    pub fn summary(&self) -> &ScalarWriter {
        &self.summary
    }

    /// Run directory (`<log_dir>/<dataset>/<model_id>`).
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        self.checkpoints.dir()
    }

    /// Restore the most recent checkpoint in the run directory, if any.
    ///
    /// # Errors
    ///
    /// A checkpoint that exists but cannot be read is fatal.
    pub fn resume(&mut self) -> Result<Option<CheckpointRecord>> {
        let Some(path) = self.checkpoints.latest_checkpoint()? else {
            tracing::info!("No matching checkpoint file found");
            self.epoch = 0;
            return Ok(None);
        };
        let record = self
            .checkpoints
            .load(&path, &self.model.var_map, &mut self.optimizer)?;
        self.epoch = record.resume_epoch();
        self.scheduler.set_step(self.epoch);
        self.global_step = (self.epoch * self.config.training.epoch_size) as u64;
        tracing::info!(
            "Found checkpoint file {} (epoch {}, lr {:.3e})",
            path.display(),
            record.epoch,
            record.learning_rate
        );
        Ok(Some(record))
    }

    /// Save a checkpoint for the last completed epoch.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf> {
        self.checkpoints
            .save(epoch, &self.model.var_map, &self.optimizer)
    }

    /// Unroll the model over one batch without updating the parameters.
    ///
    /// Returns the losses of every accumulated step (`t = 2..n_past+n_future`).
    pub fn step_losses(&mut self, x: &[Tensor]) -> Result<Vec<StepLosses>> {
        Ok(self.unroll(x)?.steps)
    }

    /// One optimization step on a batch of `T` frame tensors.
    ///
    /// The hierarchy is initialized from frame 0 and warmed up on frame 1;
    /// frames `2..n_past+n_future` contribute to the losses. Returns the
    /// losses averaged over those `n_past + n_future - 2` steps.
    ///
    /// # Errors
    ///
    /// [`HsvgError::SequenceTooShort`] for batches with at most two frames or
    /// fewer than `n_past + n_future`; [`HsvgError::Training`] when the loss
    /// is not finite.
    pub fn train_step(&mut self, x: &[Tensor]) -> Result<StepLosses> {
        let unrolled = self.unroll(x)?;
        let beta = self.config.training.beta;
        let loss = (&unrolled.total_rec + (&unrolled.total_kld * beta)?)?;

        let loss_value = scalar(&loss)?;
        if !loss_value.is_finite() {
            return Err(HsvgError::Training(format!(
                "non-finite loss {loss_value} at step {}",
                self.global_step
            )));
        }
        self.optimizer.backward_step(&self.model.var_map, &loss)?;

        let denom = self.config.training.predicted_steps() as f64;
        Ok(StepLosses {
            rec: scalar(&unrolled.total_rec)? / denom,
            kld: scalar(&unrolled.total_kld)? / denom,
        })
    }

    fn unroll(&mut self, x: &[Tensor]) -> Result<Unrolled> {
        let seq_len = self.config.training.seq_len();
        let n_past = self.config.training.n_past;
        if x.len() <= 2 || x.len() < seq_len {
            return Err(HsvgError::SequenceTooShort {
                required: seq_len.max(3),
                actual: x.len(),
            });
        }

        self.model.init_states(&x[0])?;
        self.model.step(&x[1], true, StepMode::Reconstruction)?;

        let mut rec_terms = Vec::with_capacity(seq_len - 2);
        let mut kld_terms = Vec::with_capacity(seq_len - 2);
        let mut steps = Vec::with_capacity(seq_len - 2);
        for (i, x_i) in x.iter().enumerate().take(seq_len).skip(2) {
            let out = self
                .model
                .step(x_i, i < n_past, StepMode::Reconstruction)?;
            steps.push(StepLosses {
                rec: scalar(&out.rec)?,
                kld: scalar(&out.kld)?,
            });
            rec_terms.push(out.rec);
            kld_terms.push(out.kld);
        }

        Ok(Unrolled {
            total_rec: Tensor::stack(&rec_terms, 0)?.sum_all()?,
            total_kld: Tensor::stack(&kld_terms, 0)?.sum_all()?,
            steps,
        })
    }

    /// Run the full training loop, resuming from the latest checkpoint.
    ///
    /// Every epoch takes `epoch_size` steps from an endless training stream,
    /// decays the learning rate, writes sample and reconstruction dumps for
    /// one test batch and, every `save_every` epochs, a checkpoint. Scalars
    /// are exported to `train_log/train_summary.json` at the end.
    pub fn train(&mut self) -> Result<Vec<EpochStats>> {
        self.resume()?;

        let n_epochs = self.config.training.n_epochs;
        tracing::info!("Starting training");
        tracing::info!("  Run directory: {}", self.run_dir().display());
        tracing::info!(
            "  Levels: {}, trainable params: {}",
            self.config.n_level(),
            self.model.trainable_param_count()
        );
        tracing::info!(
            "  Optimizer: {} (lr {:.3e}), epochs {}..{}",
            self.optimizer.kind(),
            self.optimizer.learning_rate(),
            self.epoch,
            n_epochs
        );

        let shared = Arc::new(self.config.clone());
        let mut train_batches = InfiniteBatches::new(
            load_dataset(&self.config, Split::Train)?,
            Arc::clone(&shared),
            LoaderConfig::train(&self.config),
            self.device.clone(),
        )?;
        let mut test_batches = InfiniteBatches::new(
            load_dataset(&self.config, Split::Test)?,
            shared,
            LoaderConfig::test(&self.config),
            self.device.clone(),
        )?;

        let mut history = Vec::new();
        for epoch in self.epoch..n_epochs {
            let stats = self.train_epoch(epoch, &mut train_batches)?;
            self.scheduler.step(&mut self.optimizer);
            tracing::info!(
                "[{:02}] rec loss: {:.5} | kld loss: {:.5} ({})",
                epoch,
                stats.rec,
                stats.kld,
                stats.sequences_seen
            );
            history.push(stats);

            let x = test_batches.next_batch()?;
            self.evaluate(epoch, &x)?;

            if (epoch + 1) % self.config.training.save_every == 0 {
                self.save_checkpoint(epoch)?;
            }
            self.epoch = epoch + 1;
        }

        self.summary
            .export_json(self.run_dir().join("train_log").join("train_summary.json"))?;
        tracing::info!("Training complete");
        Ok(history)
    }

    fn train_epoch(&mut self, epoch: usize, batches: &mut InfiniteBatches) -> Result<EpochStats> {
        let epoch_size = self.config.training.epoch_size;
        let pb = ProgressBar::new(epoch_size as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_prefix(format!("[Epoch {epoch:04}]"));

        let mut epoch_rec = 0.0;
        let mut epoch_kld = 0.0;
        for i in 0..epoch_size {
            let x = batches.next_batch()?;
            let losses = self.train_step(&x)?;
            epoch_rec += losses.rec;
            epoch_kld += losses.kld;

            let step = (i + epoch_size * epoch) as u64;
            self.summary.add_scalar(REC_LOSS_TAG, losses.rec, step);
            self.summary.add_scalar(KLD_LOSS_TAG, losses.kld, step);
            self.global_step = step + 1;

            tracing::debug!(step, rec = losses.rec, kld = losses.kld, "train step");
            pb.set_message(format!("REC Loss: {:.5}, KLD Loss: {:.5}", losses.rec, losses.kld));
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(EpochStats {
            epoch,
            rec: epoch_rec / epoch_size as f64,
            kld: epoch_kld / epoch_size as f64,
            sequences_seen: (epoch + 1) * epoch_size * self.config.training.batch_size,
        })
    }

    /// Roll out `n_samples` predictions and a posterior reconstruction for a
    /// test batch and write them to `gen/`.
    pub fn evaluate(&mut self, epoch: usize, x: &[Tensor]) -> Result<EvalOutput> {
        let training = &self.config.training;
        let (n_samples, n_past, n_eval, seq_len) = (
            training.n_samples,
            training.n_past,
            training.n_eval,
            training.seq_len(),
        );
        let gen_dir = self.run_dir().join("gen");

        let samples = rollout(&mut self.model, x, n_samples, n_past, n_eval)?;
        let display = select_display(&x[..n_eval], &samples, &mut self.display_rng)?;
        let (samples, frames) =
            write_samples(self.sink.as_mut(), &gen_dir, epoch, x, &samples, &display)?;

        let rec = reconstruction_sequence(&mut self.model, x, n_past, seq_len)?;
        let reconstruction = write_reconstruction(self.sink.as_mut(), &gen_dir, epoch, &rec)?;

        tracing::debug!(epoch, "wrote evaluation samples to {}", gen_dir.display());
        Ok(EvalOutput {
            samples,
            frames,
            reconstruction,
        })
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?))
}

/// Pick the training device: CUDA when compiled in and available, CPU otherwise.
///
/// `HSVG_FORCE_CPU=1` forces the CPU; `HSVG_CUDA_DEVICE` selects the GPU ordinal.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var("HSVG_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("HSVG_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu {
        tracing::warn!("CPU mode forced via HSVG_FORCE_CPU");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::warn!("CUDA feature disabled; training on CPU. Enable with --features cuda.");
        return Device::Cpu;
    }
    match Device::cuda_if_available(cuda_device) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", cuda_device);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}
