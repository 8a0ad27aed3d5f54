//! Recurrent Gaussian latent modules.
//!
//! Each hierarchy level owns two [`GaussianLstm`]s: a posterior that sees the
//! encoding of the current ground-truth frame and a prior that only sees the
//! past. Both summarize their input with a stack of LSTM cells and emit a
//! diagonal Gaussian from which `z` is drawn with the reparameterization trick:
//!
//! ```text
//! z = mu + exp(0.5 * logvar) * eps,   eps ~ N(0, I)
//! ```
//!
//! The noise comes from a [`NoiseSource`] so the draw stays a differentiable
//! function of `mu` and `logvar`.

use candle_core::{Module, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, Linear, LSTMConfig, VarBuilder, LSTM, RNN};

use crate::error::{HsvgError, Result};
use crate::noise::NoiseSource;

/// A stack of LSTM cells advanced one timestep at a time.
#[derive(Debug, Clone)]
pub struct LstmStack {
    cells: Vec<LSTM>,
    hidden: usize,
}

impl LstmStack {
    /// Build `layers` cells; the first reads `input_dim`, the rest read `hidden`.
    pub fn new(input_dim: usize, hidden: usize, layers: usize, vb: VarBuilder) -> Result<Self> {
        let mut cells = Vec::with_capacity(layers);
        for i in 0..layers {
            let in_dim = if i == 0 { input_dim } else { hidden };
            cells.push(candle_nn::lstm(
                in_dim,
                hidden,
                LSTMConfig::default(),
                vb.pp(format!("cell{i}")),
            )?);
        }
        Ok(Self { cells, hidden })
    }

    /// Hidden width of every cell.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    /// All-zero memory for a batch.
    pub fn zero_state(&self, batch: usize) -> Result<Vec<LSTMState>> {
        self.cells
            .iter()
            .map(|cell| cell.zero_state(batch).map_err(HsvgError::from))
            .collect()
    }

    /// Advance every cell once; returns the top cell's hidden state and the new memory.
    pub fn step(&self, input: &Tensor, state: &[LSTMState]) -> Result<(Tensor, Vec<LSTMState>)> {
        if state.len() != self.cells.len() {
            return Err(HsvgError::Model(format!(
                "LSTM stack has {} cells but {} states were given",
                self.cells.len(),
                state.len()
            )));
        }
        let mut x = input.clone();
        let mut next = Vec::with_capacity(self.cells.len());
        for (cell, s) in self.cells.iter().zip(state) {
            let new_state = cell.step(&x, s)?;
            x = new_state.h().clone();
            next.push(new_state);
        }
        Ok((x, next))
    }
}

/// Parameters and sample of a diagonal Gaussian.
#[derive(Debug, Clone)]
pub struct GaussianSample {
    /// Reparameterized draw.
    pub z: Tensor,
    /// Mean.
    pub mu: Tensor,
    /// Log-variance.
    pub logvar: Tensor,
}

/// Embed → LSTM stack → (mu, logvar) heads.
#[derive(Debug, Clone)]
pub struct GaussianLstm {
    embed: Linear,
    rnn: LstmStack,
    mu_head: Linear,
    logvar_head: Linear,
    z_dim: usize,
}

impl GaussianLstm {
    /// Create a module reading `input_dim` features and emitting `z_dim` latents.
    pub fn new(
        input_dim: usize,
        z_dim: usize,
        rnn_size: usize,
        rnn_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            embed: linear(input_dim, rnn_size, vb.pp("embed"))?,
            rnn: LstmStack::new(rnn_size, rnn_size, rnn_layers, vb.pp("lstm"))?,
            mu_head: linear(rnn_size, z_dim, vb.pp("mu"))?,
            logvar_head: linear(rnn_size, z_dim, vb.pp("logvar"))?,
            z_dim,
        })
    }

    /// Latent dimensionality.
    #[must_use]
    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    /// Fresh recurrent memory for a batch.
    pub fn zero_state(&self, batch: usize) -> Result<Vec<LSTMState>> {
        self.rnn.zero_state(batch)
    }

    /// Summarize `input` and draw `z` from the resulting Gaussian.
    pub fn infer(
        &self,
        input: &Tensor,
        state: &[LSTMState],
        noise: &mut dyn NoiseSource,
    ) -> Result<(GaussianSample, Vec<LSTMState>)> {
        let embedded = self.embed.forward(input)?;
        let (hidden, next) = self.rnn.step(&embedded, state)?;
        let mu = self.mu_head.forward(&hidden)?;
        let logvar = self.logvar_head.forward(&hidden)?;
        let z = reparameterize(&mu, &logvar, noise)?;
        Ok((GaussianSample { z, mu, logvar }, next))
    }
}

/// `mu + exp(0.5 * logvar) * eps` with `eps` drawn from `noise`.
pub fn reparameterize(mu: &Tensor, logvar: &Tensor, noise: &mut dyn NoiseSource) -> Result<Tensor> {
    let std = (logvar * 0.5)?.exp()?;
    let eps = noise.tensor(mu.shape(), mu.device())?;
    Ok((mu + (std * eps)?)?)
}

/// Closed-form `KL(N(mu1, σ1²) || N(mu2, σ2²))`, summed over every element and
/// divided by `batch_size`:
///
/// ```text
/// log(σ2/σ1) + (σ1² + (mu1 - mu2)²) / (2 σ2²) - 1/2
/// ```
///
/// Returns a scalar tensor that stays attached to the graph.
pub fn kl_criterion(
    mu1: &Tensor,
    logvar1: &Tensor,
    mu2: &Tensor,
    logvar2: &Tensor,
    batch_size: usize,
) -> Result<Tensor> {
    if batch_size == 0 {
        return Err(HsvgError::Model("kl_criterion: batch_size must be > 0".into()));
    }
    let log_ratio = ((logvar2 - logvar1)? * 0.5)?;
    let numerator = (logvar1.exp()? + (mu1 - mu2)?.sqr()?)?;
    let denominator = (logvar2.exp()? * 2.0)?;
    let kld = ((log_ratio + (numerator / denominator)?)? - 0.5)?;
    Ok((kld.sum_all()? / batch_size as f64)?)
}
