//! The stack of stochastic recurrent levels.
//!
//! Level 0 is the finest and feeds the decoder; level `L-1` is the coarsest.
//! Every timestep the levels are advanced top-down, so each level reads the
//! output of the level above it as a top-down conditioning signal:
//!
//! ```text
//! level L-1:  [ctx] ─────────────────────► out_{L-1}
//! level L-2:  [ctx, out_{L-1}] ──────────► out_{L-2}
//!   ...
//! level 0:    [ctx, out_1] ──────────────► out_0 ──► decoder
//! ```
//!
//! Each level owns a posterior and a prior [`GaussianLstm`], a predictor LSTM
//! stack and an output projection. The recurrent memories live in
//! [`LevelState`] and are reset by [`Hierarchy::init_states`].

use candle_core::{Module, Tensor};
use candle_nn::rnn::LSTMState;
use candle_nn::{linear, Linear, VarBuilder};

use crate::config::LevelConfig;
use crate::error::{HsvgError, Result};
use crate::latent::{kl_criterion, GaussianLstm, GaussianSample, LstmStack};
use crate::noise::NoiseSource;

/// Which latent branches run on a level step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelMode {
    /// Posterior only (reconstruction from ground truth).
    Posterior,
    /// Prior only (free-running generation).
    Prior,
    /// Both branches run so their divergence can be measured; `z` comes from
    /// the posterior when `use_posterior` is set, from the prior otherwise.
    Both {
        /// Drive the predictor with the posterior sample.
        use_posterior: bool,
    },
}

impl LevelMode {
    fn needs_target(self) -> bool {
        !matches!(self, LevelMode::Prior)
    }
}

/// Inputs to a single level step.
#[derive(Debug, Clone, Copy)]
pub struct LevelInput<'a> {
    /// Encoding of the current ground-truth frame, required by the posterior.
    pub target: Option<&'a Tensor>,
    /// Encoding of the previous (true or generated) frame.
    pub context: &'a Tensor,
    /// Output of the level above, absent for the top level.
    pub topdown: Option<&'a Tensor>,
}

/// Result of advancing one level.
#[derive(Debug, Clone)]
pub struct LevelStep {
    /// Top-down signal for the level below, or the decoder input at level 0.
    pub output: Tensor,
    /// Latent that drove the predictor.
    pub z: Tensor,
    /// Posterior parameters, when the posterior ran.
    pub posterior: Option<GaussianSample>,
    /// Prior parameters, when the prior ran.
    pub prior: Option<GaussianSample>,
    /// Whether `z` was drawn from the posterior.
    pub from_posterior: bool,
}

impl LevelStep {
    /// Mean of the distribution `z` was drawn from.
    #[must_use]
    pub fn mu(&self) -> Option<&Tensor> {
        self.chosen().map(|s| &s.mu)
    }

    /// Log-variance of the distribution `z` was drawn from.
    #[must_use]
    pub fn logvar(&self) -> Option<&Tensor> {
        self.chosen().map(|s| &s.logvar)
    }

    fn chosen(&self) -> Option<&GaussianSample> {
        if self.from_posterior {
            self.posterior.as_ref()
        } else {
            self.prior.as_ref()
        }
    }

    /// `KL(posterior || prior)` per example, when both branches ran.
    pub fn kl(&self, batch_size: usize) -> Result<Option<Tensor>> {
        match (&self.posterior, &self.prior) {
            (Some(q), Some(p)) => Ok(Some(kl_criterion(
                &q.mu, &q.logvar, &p.mu, &p.logvar, batch_size,
            )?)),
            _ => Ok(None),
        }
    }
}

/// Recurrent memory of one level for the current sequence.
#[derive(Debug, Clone)]
pub struct LevelState {
    posterior: Vec<LSTMState>,
    prior: Vec<LSTMState>,
    predictor: Vec<LSTMState>,
    /// Most recent step, kept for inspection.
    pub latest: Option<LevelStep>,
}

/// Parameters of one level.
#[derive(Debug, Clone)]
pub struct Level {
    posterior: GaussianLstm,
    prior: GaussianLstm,
    predictor: LstmStack,
    output: Linear,
    dims: LevelConfig,
}

impl Level {
    /// Build a level reading `context_dim` features and `topdown_dim` features
    /// from the level above (0 for the top level).
    pub fn new(
        dims: &LevelConfig,
        context_dim: usize,
        topdown_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conditioned = context_dim + topdown_dim;
        Ok(Self {
            posterior: GaussianLstm::new(
                conditioned,
                dims.z_dim,
                dims.rnn_size,
                dims.rnn_layers,
                vb.pp("posterior"),
            )?,
            prior: GaussianLstm::new(
                conditioned,
                dims.z_dim,
                dims.rnn_size,
                dims.rnn_layers,
                vb.pp("prior"),
            )?,
            predictor: LstmStack::new(
                conditioned + dims.z_dim,
                dims.rnn_size,
                dims.rnn_layers,
                vb.pp("predictor"),
            )?,
            output: linear(dims.rnn_size, dims.out_dim, vb.pp("output"))?,
            dims: dims.clone(),
        })
    }

    /// Dimensions this level was built with.
    #[must_use]
    pub fn dims(&self) -> &LevelConfig {
        &self.dims
    }

    fn zero_state(&self, batch: usize) -> Result<LevelState> {
        Ok(LevelState {
            posterior: self.posterior.zero_state(batch)?,
            prior: self.prior.zero_state(batch)?,
            predictor: self.predictor.zero_state(batch)?,
            latest: None,
        })
    }
}

/// All levels plus their per-sequence state.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    levels: Vec<Level>,
    states: Option<Vec<LevelState>>,
}

impl Hierarchy {
    /// Build the hierarchy described by `levels` on top of `context_dim`-wide
    /// frame encodings.
    pub fn new(levels: &[LevelConfig], context_dim: usize, vb: VarBuilder) -> Result<Self> {
        if levels.is_empty() {
            return Err(HsvgError::Model("hierarchy needs at least one level".into()));
        }
        let built = levels
            .iter()
            .enumerate()
            .map(|(i, dims)| {
                let topdown_dim = levels.get(i + 1).map_or(0, |above| above.out_dim);
                Level::new(dims, context_dim, topdown_dim, vb.pp(format!("level{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            levels: built,
            states: None,
        })
    }

    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always false; a hierarchy has at least one level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Output width of level 0.
    #[must_use]
    pub fn output_dim(&self) -> usize {
        self.levels[0].dims.out_dim
    }

    /// Level parameters, finest first.
    #[must_use]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Per-level state of the current sequence.
    #[must_use]
    pub fn states(&self) -> Option<&[LevelState]> {
        self.states.as_deref()
    }

    /// Whether [`Hierarchy::init_states`] has been called.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.states.is_some()
    }

    /// Reset every recurrent memory for a new batch of sequences.
    pub fn init_states(&mut self, batch: usize) -> Result<()> {
        let states = self
            .levels
            .iter()
            .map(|level| level.zero_state(batch))
            .collect::<Result<Vec<_>>>()?;
        self.states = Some(states);
        Ok(())
    }

    /// Drop the per-sequence state.
    pub fn clear_states(&mut self) {
        self.states = None;
    }

    /// Advance one level.
    ///
    /// # Errors
    ///
    /// Fails with [`HsvgError::NotInitialized`] before `init_states`, and with
    /// [`HsvgError::Model`] if the posterior is requested without a target.
    pub fn step_level(
        &mut self,
        level: usize,
        input: LevelInput<'_>,
        mode: LevelMode,
        noise: &mut dyn NoiseSource,
    ) -> Result<LevelStep> {
        let states = self.states.as_mut().ok_or(HsvgError::NotInitialized)?;
        let (params, state) = self
            .levels
            .get(level)
            .zip(states.get_mut(level))
            .ok_or_else(|| HsvgError::Model(format!("no hierarchy level {level}")))?;

        let with_topdown = |x: &Tensor| -> Result<Tensor> {
            match input.topdown {
                Some(td) => Ok(Tensor::cat(&[x, td], 1)?),
                None => Ok(x.clone()),
            }
        };

        let posterior = if mode.needs_target() {
            let target = input.target.ok_or_else(|| {
                HsvgError::Model(format!("level {level}: posterior needs the current frame"))
            })?;
            let (sample, next) =
                params
                    .posterior
                    .infer(&with_topdown(target)?, &state.posterior, noise)?;
            state.posterior = next;
            Some(sample)
        } else {
            None
        };

        let conditioned = with_topdown(input.context)?;
        let prior = if mode == LevelMode::Posterior {
            None
        } else {
            let (sample, next) = params.prior.infer(&conditioned, &state.prior, noise)?;
            state.prior = next;
            Some(sample)
        };

        let (z, from_posterior) = match (mode, &posterior, &prior) {
            (LevelMode::Posterior | LevelMode::Both { use_posterior: true }, Some(q), _) => {
                (q.z.clone(), true)
            }
            (_, _, Some(p)) => (p.z.clone(), false),
            _ => return Err(HsvgError::Model(format!("level {level}: no latent sampled"))),
        };

        let (hidden, next) = params
            .predictor
            .step(&Tensor::cat(&[&conditioned, &z], 1)?, &state.predictor)?;
        state.predictor = next;
        let output = params.output.forward(&hidden)?.tanh()?;

        let step = LevelStep {
            output,
            z,
            posterior,
            prior,
            from_posterior,
        };
        state.latest = Some(step.clone());
        Ok(step)
    }

    /// Advance every level top-down. The result is indexed by level, finest
    /// first.
    pub fn step_all(
        &mut self,
        target: Option<&Tensor>,
        context: &Tensor,
        mode: LevelMode,
        noise: &mut dyn NoiseSource,
    ) -> Result<Vec<LevelStep>> {
        let mut steps: Vec<LevelStep> = Vec::with_capacity(self.levels.len());
        for level in (0..self.levels.len()).rev() {
            let topdown = steps.last().map(|above| above.output.clone());
            let input = LevelInput {
                target,
                context,
                topdown: topdown.as_ref(),
            };
            steps.push(self.step_level(level, input, mode, noise)?);
        }
        steps.reverse();
        Ok(steps)
    }
}
