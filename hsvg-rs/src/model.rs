//! The HSVG network: frame encoder, latent hierarchy and skip-aware decoder.
//!
//! [`HsvgModel`] holds the parameters together with the per-sequence state
//! (the hierarchy memories, the previous frame encoding and the current skip
//! features). A rollout always starts with [`HsvgModel::init_states`] on the
//! first frame; after that the model is advanced one frame at a time with
//! [`HsvgModel::step`], [`HsvgModel::reconstruction`] or
//! [`HsvgModel::inference`].

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::config::{ModelConfig, RecCriterion};
use crate::error::{HsvgError, Result};
use crate::hierarchy::{Hierarchy, LevelMode, LevelStep};
use crate::network::{FrameDecoder, FrameEncoder};
use crate::noise::NoiseSource;

/// Where the next step's context encoding comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Teacher forcing: the context becomes the encoding of the true frame.
    Reconstruction,
    /// Autoregressive: the context becomes the encoding of the model's output.
    Inference,
}

/// Output of [`HsvgModel::step`].
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Decoded frame, `[batch, channels, width, width]`.
    pub x_out: Tensor,
    /// Reconstruction loss against the true frame (scalar).
    pub rec: Tensor,
    /// KL divergence summed over levels, per example (scalar).
    pub kld: Tensor,
}

/// Output of [`HsvgModel::reconstruction`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Per-level outputs, finest first. Pass to [`HsvgModel::decoding`].
    pub hs: Vec<Tensor>,
    /// Encoder skip features of the reconstructed frame.
    pub feats: Vec<Tensor>,
    /// Posterior samples per level.
    pub zs: Vec<Tensor>,
    /// Posterior means per level.
    pub mus: Vec<Tensor>,
    /// Posterior log-variances per level.
    pub logvars: Vec<Tensor>,
}

struct SequenceContext {
    h_prev: Tensor,
    skips: Vec<Tensor>,
}

/// Hierarchical stochastic video prediction network.
pub struct HsvgModel {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    hierarchy: Hierarchy,
    to_decoder: Linear,
    rec_criterion: RecCriterion,
    context: Option<SequenceContext>,
    noise: Box<dyn NoiseSource>,
    /// Every trainable parameter, keyed by path.
    pub var_map: VarMap,
    device: Device,
}

impl HsvgModel {
    /// Build a freshly initialized model on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(config: &ModelConfig, device: &Device, noise: Box<dyn NoiseSource>) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let encoder = FrameEncoder::new(
            config.channels,
            config.image_width,
            config.filters,
            config.g_dim,
            vb.pp("encoder"),
        )?;
        let decoder = FrameDecoder::new(
            config.channels,
            config.image_width,
            config.filters,
            config.g_dim,
            vb.pp("decoder"),
        )?;
        let hierarchy = Hierarchy::new(&config.levels, config.g_dim, vb.pp("hierarchy"))?;
        let to_decoder = linear(hierarchy.output_dim(), config.g_dim, vb.pp("to_decoder"))?;

        tracing::debug!(
            levels = hierarchy.len(),
            params = var_map.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "built HSVG model"
        );

        Ok(Self {
            encoder,
            decoder,
            hierarchy,
            to_decoder,
            rec_criterion: config.rec_criterion,
            context: None,
            noise,
            var_map,
            device: device.clone(),
        })
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of trainable scalars.
    #[must_use]
    pub fn trainable_param_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// The latent hierarchy and its current per-level state.
    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Replace the latent noise source.
    pub fn set_noise(&mut self, noise: Box<dyn NoiseSource>) {
        self.noise = noise;
    }

    /// Whether a sequence is in progress.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.context.is_some() && self.hierarchy.is_initialized()
    }

    /// Reset all recurrent memories and seed the context and skips with the
    /// encoding of the first frame `x0`.
    pub fn init_states(&mut self, x0: &Tensor) -> Result<()> {
        let batch = x0.dim(0)?;
        self.hierarchy.init_states(batch)?;
        let encoded = self.encoder.forward(x0)?;
        self.context = Some(SequenceContext {
            h_prev: encoded.h,
            skips: encoded.skips,
        });
        Ok(())
    }

    /// End the current sequence: drop the context, skips and level memories.
    pub fn reset(&mut self) {
        self.hierarchy.clear_states();
        self.context = None;
    }

    /// Encoder skip features currently used by the decoder.
    pub fn skips(&self) -> Result<&[Tensor]> {
        Ok(&self.context()?.skips)
    }

    /// Overwrite the decoder skip features, e.g. with `feats` from
    /// [`HsvgModel::reconstruction`].
    pub fn set_skips(&mut self, feats: Vec<Tensor>) -> Result<()> {
        let expected = self.encoder.num_skips();
        if feats.len() != expected {
            return Err(HsvgError::Model(format!(
                "expected {expected} skip maps, got {}",
                feats.len()
            )));
        }
        self.context_mut()?.skips = feats;
        Ok(())
    }

    /// Advance the model by one frame.
    ///
    /// Both latent branches run so the KL term can be computed. With
    /// `update_skips` the predictor is driven by the posterior and the skips
    /// are replaced by the features of `x_t` after decoding; otherwise the
    /// prior drives the predictor and the skips are kept.
    ///
    /// # Errors
    ///
    /// Returns [`HsvgError::NotInitialized`] before [`HsvgModel::init_states`].
    pub fn step(&mut self, x_t: &Tensor, update_skips: bool, mode: StepMode) -> Result<StepOutput> {
        let h_prev = self.context()?.h_prev.clone();
        let batch = x_t.dim(0)?;
        let encoded = self.encoder.forward(x_t)?;

        let steps = self.hierarchy.step_all(
            Some(&encoded.h),
            &h_prev,
            LevelMode::Both {
                use_posterior: update_skips,
            },
            self.noise.as_mut(),
        )?;

        let x_out = self.decode_output(&steps[0].output)?;
        let rec = self.rec_loss(&x_out, x_t)?;
        let kld = total_kl(&steps, batch, x_t.device())?;

        let next_context = match mode {
            StepMode::Reconstruction => encoded.h,
            StepMode::Inference => self.encoder.forward(&x_out)?.h,
        };
        let context = self.context_mut()?;
        context.h_prev = next_context;
        if update_skips {
            context.skips = encoded.skips;
        }

        Ok(StepOutput { x_out, rec, kld })
    }

    /// Posterior-only pass over the true frame `x_t`.
    ///
    /// The context advances to the encoding of `x_t`; the skips are left
    /// untouched so the caller decides whether to adopt `feats`.
    pub fn reconstruction(&mut self, x_t: &Tensor) -> Result<Reconstruction> {
        let h_prev = self.context()?.h_prev.clone();
        let encoded = self.encoder.forward(x_t)?;
        let steps = self.hierarchy.step_all(
            Some(&encoded.h),
            &h_prev,
            LevelMode::Posterior,
            self.noise.as_mut(),
        )?;
        self.context_mut()?.h_prev = encoded.h;

        let mut rec = Reconstruction {
            hs: Vec::with_capacity(steps.len()),
            feats: encoded.skips,
            zs: Vec::with_capacity(steps.len()),
            mus: Vec::with_capacity(steps.len()),
            logvars: Vec::with_capacity(steps.len()),
        };
        for step in steps {
            let posterior = step
                .posterior
                .ok_or_else(|| HsvgError::Model("posterior did not run".into()))?;
            rec.hs.push(step.output);
            rec.zs.push(step.z);
            rec.mus.push(posterior.mu);
            rec.logvars.push(posterior.logvar);
        }
        Ok(rec)
    }

    /// Decode per-level outputs (finest first) with the current skips.
    pub fn decoding(&self, hs: &[Tensor]) -> Result<Tensor> {
        let finest = hs
            .first()
            .ok_or_else(|| HsvgError::Model("decoding needs at least one level output".into()))?;
        self.decode_output(finest)
    }

    /// Prior-only generation of the next frame from the current context.
    ///
    /// The generated frame is re-encoded and becomes the next context; the
    /// skips stay those of the last observed frame.
    pub fn inference(&mut self) -> Result<Tensor> {
        let h_prev = self.context()?.h_prev.clone();
        let steps =
            self.hierarchy
                .step_all(None, &h_prev, LevelMode::Prior, self.noise.as_mut())?;
        let x_pred = self.decode_output(&steps[0].output)?;
        self.context_mut()?.h_prev = self.encoder.forward(&x_pred)?.h;
        Ok(x_pred)
    }

    /// Squared error between `x_out` and `x_t`, reduced per the configured criterion.
    pub fn rec_loss(&self, x_out: &Tensor, x_t: &Tensor) -> Result<Tensor> {
        if x_out.dims() != x_t.dims() {
            return Err(HsvgError::Model(format!(
                "reconstruction shape {:?} does not match frame shape {:?}",
                x_out.dims(),
                x_t.dims()
            )));
        }
        let sq = (x_out - x_t)?.sqr()?;
        let reduced = match self.rec_criterion {
            RecCriterion::Mean => sq.mean_all()?,
            RecCriterion::Sum => sq.sum_all()?,
        };
        Ok(reduced)
    }

    fn decode_output(&self, finest: &Tensor) -> Result<Tensor> {
        let g = self.to_decoder.forward(finest)?.tanh()?;
        self.decoder.forward(&g, &self.context()?.skips)
    }

    fn context(&self) -> Result<&SequenceContext> {
        self.context.as_ref().ok_or(HsvgError::NotInitialized)
    }

    fn context_mut(&mut self) -> Result<&mut SequenceContext> {
        self.context.as_mut().ok_or(HsvgError::NotInitialized)
    }
}

fn total_kl(steps: &[LevelStep], batch: usize, device: &Device) -> Result<Tensor> {
    let mut terms = Vec::with_capacity(steps.len());
    for step in steps {
        if let Some(kl) = step.kl(batch)? {
            terms.push(kl);
        }
    }
    if terms.is_empty() {
        return Ok(Tensor::zeros((), DType::F32, device)?);
    }
    Ok(Tensor::stack(&terms, 0)?.sum_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HsvgConfig;
    use crate::noise::{ConstantNoise, ScriptedNoise};

    fn toy_model(noise: Box<dyn NoiseSource>) -> HsvgModel {
        let config = HsvgConfig::test_preset();
        HsvgModel::new(&config.model, &Device::Cpu, noise).unwrap()
    }

    fn frame(value: f32) -> Tensor {
        Tensor::full(value, (2, 1, 8, 8), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_step_before_init_fails() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        let err = model
            .step(&frame(0.5), true, StepMode::Reconstruction)
            .unwrap_err();
        assert!(matches!(err, HsvgError::NotInitialized));
        assert!(matches!(model.inference(), Err(HsvgError::NotInitialized)));
        assert!(matches!(
            model.reconstruction(&frame(0.5)),
            Err(HsvgError::NotInitialized)
        ));
    }

    #[test]
    fn test_step_outputs() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        model.init_states(&frame(0.1)).unwrap();
        let out = model.step(&frame(0.2), true, StepMode::Reconstruction).unwrap();
        assert_eq!(out.x_out.dims(), &[2, 1, 8, 8]);
        assert!(scalar(&out.rec) >= 0.0);
        assert!(scalar(&out.kld).is_finite());
        assert!(model.is_initialized());
    }

    #[test]
    fn test_step_is_deterministic_with_fixed_noise() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        let run = |model: &mut HsvgModel| {
            model.init_states(&frame(0.1)).unwrap();
            model.step(&frame(0.2), true, StepMode::Reconstruction).unwrap();
            let out = model.step(&frame(0.3), false, StepMode::Reconstruction).unwrap();
            (
                scalar(&out.rec),
                scalar(&out.kld),
                out.x_out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            )
        };
        let first = run(&mut model);
        let second = run(&mut model);
        assert_eq!(first, second);
    }

    #[test]
    fn test_update_skips_replaces_skips_after_decoding() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        model.init_states(&frame(0.1)).unwrap();
        let before = model.skips().unwrap()[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();

        model.step(&frame(0.9), false, StepMode::Reconstruction).unwrap();
        let kept = model.skips().unwrap()[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(before, kept);

        model.step(&frame(0.9), true, StepMode::Reconstruction).unwrap();
        let replaced = model.skips().unwrap()[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(before, replaced);
    }

    #[test]
    fn test_reconstruction_returns_posterior_features() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        model.init_states(&frame(0.1)).unwrap();
        let rec = model.reconstruction(&frame(0.4)).unwrap();
        assert_eq!(rec.hs.len(), 3);
        assert_eq!(rec.zs.len(), 3);
        assert_eq!(rec.feats.len(), 1);
        // With zero noise the posterior sample is its mean.
        let diff = (&rec.zs[2] - &rec.mus[2]).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(scalar(&diff) < 1e-6);

        model.set_skips(rec.feats).unwrap();
        let x = model.decoding(&rec.hs).unwrap();
        assert_eq!(x.dims(), &[2, 1, 8, 8]);
        assert!(model.set_skips(Vec::new()).is_err());
    }

    #[test]
    fn test_inference_consumes_prior_noise_only() {
        // Three levels, prior only: one draw per level.
        let mut model = toy_model(Box::new(ScriptedNoise::new([0.0; 3], 0.0)));
        model.init_states(&frame(0.1)).unwrap();
        let x = model.inference().unwrap();
        assert_eq!(x.dims(), &[2, 1, 8, 8]);
        let values = x.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_inference_mode_feeds_back_the_generated_frame() {
        let mut model = toy_model(Box::new(ConstantNoise(0.0)));
        model.init_states(&frame(0.1)).unwrap();
        let out = model.step(&frame(0.6), false, StepMode::Inference).unwrap();

        let context = model.context().unwrap().h_prev.to_vec2::<f32>().unwrap();
        let generated = model.encoder.forward(&out.x_out).unwrap().h.to_vec2::<f32>().unwrap();
        let observed = model.encoder.forward(&frame(0.6)).unwrap().h.to_vec2::<f32>().unwrap();
        assert_eq!(context, generated);
        assert_ne!(context, observed);

        model.step(&frame(0.6), false, StepMode::Reconstruction).unwrap();
        let context = model.context().unwrap().h_prev.to_vec2::<f32>().unwrap();
        assert_eq!(context, observed);
    }

    #[test]
    fn test_rec_loss_criteria() {
        let model = toy_model(Box::new(ConstantNoise(0.0)));
        let a = frame(0.5);
        let b = frame(0.0);
        assert!((scalar(&model.rec_loss(&a, &b).unwrap()) - 0.25).abs() < 1e-6);

        let mut config = HsvgConfig::test_preset();
        config.model.rec_criterion = RecCriterion::Sum;
        let summed = HsvgModel::new(&config.model, &Device::Cpu, Box::new(ConstantNoise(0.0))).unwrap();
        assert!((scalar(&summed.rec_loss(&a, &b).unwrap()) - 0.25 * 128.0).abs() < 1e-3);

        assert!(model.rec_loss(&a, &Tensor::zeros((1, 1, 8, 8), DType::F32, &Device::Cpu).unwrap()).is_err());
    }
}
