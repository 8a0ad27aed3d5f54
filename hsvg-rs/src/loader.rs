//! Multi-threaded batch loading.
//!
//! [`EpochLoader`] makes one pass over a dataset. Worker threads pull batch
//! jobs from a shared queue, gather and normalize the clips, and push the
//! result into a bounded channel; when the channel is full the workers block,
//! and when it is empty the consumer blocks. Batches are handed out in order
//! regardless of which worker finished first.
//!
//! [`InfiniteBatches`] chains passes forever: when a pass is exhausted it
//! starts the next one with a fresh shuffle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::HsvgConfig;
use crate::dataset::{normalize_data, FrameDataset, SequenceBatch};
use crate::error::{HsvgError, Result};

/// Frames of one batch: `T` tensors of shape `[batch, channels, width, width]`.
pub type FrameBatch = Vec<Tensor>;

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Clips per batch; a trailing partial batch is dropped.
    pub batch_size: usize,
    /// Worker threads; 0 loads on the calling thread.
    pub workers: usize,
    /// Capacity of the prepared-batch queue.
    pub prefetch: usize,
    /// Shuffle clip order every pass.
    pub shuffle: bool,
    /// Base seed for shuffling; pass `p` uses `seed + p`.
    pub seed: u64,
}

impl LoaderConfig {
    /// Training loader: shuffled, with the configured worker count.
    #[must_use]
    pub fn train(config: &HsvgConfig) -> Self {
        Self {
            batch_size: config.training.batch_size,
            workers: config.data.data_threads,
            prefetch: config.data.prefetch,
            shuffle: true,
            seed: config.seed,
        }
    }

    /// Test loader: fixed order.
    #[must_use]
    pub fn test(config: &HsvgConfig) -> Self {
        Self {
            shuffle: false,
            ..Self::train(config)
        }
    }
}

type Job = (usize, Vec<usize>);
type Prepared = (usize, Result<FrameBatch>);

/// One pass over a dataset.
pub struct EpochLoader {
    dataset: Arc<dyn FrameDataset>,
    config: Arc<HsvgConfig>,
    device: Device,
    /// Jobs not yet taken; only used when loading inline.
    inline_jobs: VecDeque<Job>,
    receiver: Option<Receiver<Prepared>>,
    /// Batches that arrived ahead of their turn.
    pending: BTreeMap<usize, Result<FrameBatch>>,
    next_index: usize,
    num_batches: usize,
    workers: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl EpochLoader {
    /// Start pass number `pass` over `dataset`.
    pub fn new(
        dataset: Arc<dyn FrameDataset>,
        config: Arc<HsvgConfig>,
        loader: &LoaderConfig,
        pass: u64,
        device: Device,
    ) -> Result<Self> {
        if loader.batch_size == 0 {
            return Err(HsvgError::Config("batch size must be > 0".into()));
        }
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if loader.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(loader.seed.wrapping_add(pass));
            order.shuffle(&mut rng);
        }
        let jobs: VecDeque<Job> = order
            .chunks_exact(loader.batch_size)
            .map(<[usize]>::to_vec)
            .enumerate()
            .collect();
        let num_batches = jobs.len();

        let mut epoch = Self {
            dataset,
            config,
            device,
            inline_jobs: VecDeque::new(),
            receiver: None,
            pending: BTreeMap::new(),
            next_index: 0,
            num_batches,
            workers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        };

        if loader.workers > 0 {
            epoch.start_workers(jobs, loader.workers, loader.prefetch.max(1));
        } else {
            epoch.inline_jobs = jobs;
        }
        Ok(epoch)
    }

    /// Batches in this pass.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn start_workers(&mut self, jobs: VecDeque<Job>, workers: usize, prefetch: usize) {
        let jobs = Arc::new(Mutex::new(jobs));
        let (sender, receiver) = sync_channel::<Prepared>(prefetch);

        for _ in 0..workers {
            let jobs = Arc::clone(&jobs);
            let sender = sender.clone();
            let stop_flag = Arc::clone(&self.stop_flag);
            let dataset = Arc::clone(&self.dataset);
            let config = Arc::clone(&self.config);
            let device = self.device.clone();

            let handle = thread::spawn(move || loop {
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let job = match jobs.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(_) => None,
                };
                let Some((index, indices)) = job else {
                    break;
                };
                let batch = prepare(dataset.as_ref(), &config, &indices, &device);
                // The receiver is gone once the loader is dropped.
                if sender.send((index, batch)).is_err() {
                    break;
                }
            });
            self.workers.push(handle);
        }
        self.receiver = Some(receiver);
    }

    fn next_batch(&mut self) -> Option<Result<FrameBatch>> {
        if self.next_index >= self.num_batches {
            return None;
        }
        let Some(receiver) = self.receiver.as_ref() else {
            let (_, indices) = self.inline_jobs.pop_front()?;
            self.next_index += 1;
            return Some(prepare(
                self.dataset.as_ref(),
                &self.config,
                &indices,
                &self.device,
            ));
        };

        while !self.pending.contains_key(&self.next_index) {
            match receiver.recv() {
                Ok((index, batch)) => {
                    self.pending.insert(index, batch);
                }
                Err(_) => {
                    return Some(Err(HsvgError::Dataset(
                        "loader workers stopped before the pass completed".into(),
                    )));
                }
            }
        }
        let batch = self.pending.remove(&self.next_index);
        self.next_index += 1;
        batch
    }
}

fn prepare(
    dataset: &dyn FrameDataset,
    config: &HsvgConfig,
    indices: &[usize],
    device: &Device,
) -> Result<FrameBatch> {
    let raw = SequenceBatch::gather(dataset, indices)?;
    normalize_data(config, &raw, device)
}

impl Iterator for EpochLoader {
    type Item = Result<FrameBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}

impl Drop for EpochLoader {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        // Unblock workers waiting on a full channel.
        self.receiver.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Endless stream of batches, restarting the dataset whenever a pass ends.
pub struct InfiniteBatches {
    dataset: Arc<dyn FrameDataset>,
    config: Arc<HsvgConfig>,
    loader: LoaderConfig,
    device: Device,
    pass: u64,
    current: Option<EpochLoader>,
}

impl InfiniteBatches {
    /// Wrap `dataset`; the first pass starts on the first call to `next`.
    pub fn new(
        dataset: Arc<dyn FrameDataset>,
        config: Arc<HsvgConfig>,
        loader: LoaderConfig,
        device: Device,
    ) -> Result<Self> {
        if loader.batch_size == 0 || dataset.len() < loader.batch_size {
            return Err(HsvgError::Dataset(format!(
                "dataset has {} clips, fewer than one batch of {}",
                dataset.len(),
                loader.batch_size
            )));
        }
        Ok(Self {
            dataset,
            config,
            loader,
            device,
            pass: 0,
            current: None,
        })
    }

    /// Completed passes over the dataset.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.pass
    }

    /// Next batch, blocking until one is ready.
    pub fn next_batch(&mut self) -> Result<FrameBatch> {
        loop {
            let epoch = match self.current.as_mut() {
                Some(epoch) => epoch,
                None => self.current.insert(EpochLoader::new(
                    Arc::clone(&self.dataset),
                    Arc::clone(&self.config),
                    &self.loader,
                    self.pass,
                    self.device.clone(),
                )?),
            };
            match epoch.next() {
                Some(batch) => return batch,
                None => {
                    tracing::debug!(pass = self.pass, "dataset exhausted, restarting");
                    self.current = None;
                    self.pass += 1;
                }
            }
        }
    }
}

impl Iterator for InfiniteBatches {
    type Item = Result<FrameBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
