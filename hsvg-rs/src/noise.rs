//! Standard-normal noise for the reparameterization trick.
//!
//! Candle's CPU backend cannot be reseeded, so latent noise is drawn on the
//! host from a [`NoiseSource`] and uploaded as a tensor. Swapping the source
//! makes sampling reproducible (seeded), degenerate (constant) or fully
//! scripted for tests.

use std::collections::VecDeque;

use candle_core::{Device, Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::Result;

/// Produces `eps ~ N(0, 1)` samples.
pub trait NoiseSource: Send {
    /// Fill a fresh buffer with `n` standard-normal draws.
    fn sample(&mut self, n: usize) -> Vec<f32>;

    /// Draw a tensor of the given shape on `device`.
    fn tensor(&mut self, shape: &Shape, device: &Device) -> Result<Tensor> {
        let values = self.sample(shape.elem_count());
        Ok(Tensor::from_vec(values, shape.clone(), device)?)
    }
}

/// ChaCha-backed Gaussian noise, reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: ChaCha8Rng,
}

impl SeededNoise {
    /// Create a new source seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl NoiseSource for SeededNoise {
    fn sample(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.rng.sample(StandardNormal)).collect()
    }
}

/// Returns the same value for every draw. `ConstantNoise(0.0)` makes every
/// latent collapse to its mean.
#[derive(Debug, Clone, Copy)]
pub struct ConstantNoise(pub f32);

impl NoiseSource for ConstantNoise {
    fn sample(&mut self, n: usize) -> Vec<f32> {
        vec![self.0; n]
    }
}

/// Replays a queue of per-call fill values, then falls back to a default.
///
/// Each call to [`NoiseSource::sample`] pops one value and fills the whole
/// buffer with it, which lets a test pin the noise of individual latent draws.
#[derive(Debug, Clone)]
pub struct ScriptedNoise {
    script: VecDeque<f32>,
    fallback: f32,
}

impl ScriptedNoise {
    /// Create a source that replays `script` and then returns `fallback`.
    pub fn new(script: impl IntoIterator<Item = f32>, fallback: f32) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
        }
    }

    /// Values not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl NoiseSource for ScriptedNoise {
    fn sample(&mut self, n: usize) -> Vec<f32> {
        let value = self.script.pop_front().unwrap_or(self.fallback);
        vec![value; n]
    }
}
