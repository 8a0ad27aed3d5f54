//! End-to-end training, checkpointing and rollout tests on the CPU.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use hsvg_rs::checkpoint::CheckpointManager;
use hsvg_rs::dataset::{normalize_data, BouncingBlocks, ClipShape, FrameDataset, SequenceBatch};
use hsvg_rs::noise::{ConstantNoise, ScriptedNoise, SeededNoise};
use hsvg_rs::rollout::rollout;
use hsvg_rs::{HsvgConfig, HsvgError, HsvgModel, StepMode, Trainer};
use tempfile::TempDir;

/// 10 grayscale 64×64 clips of 8 frames, conditioned on 5 and predicting 3.
fn e2e_config(dir: &TempDir) -> HsvgConfig {
    let mut config = HsvgConfig::test_preset();
    config.model.image_width = 64;
    config.training.batch_size = 10;
    config.training.n_past = 5;
    config.training.n_future = 3;
    config.training.n_eval = 8;
    config.log_dir = dir.path().to_string_lossy().into_owned();
    config
}

fn load_batch(config: &HsvgConfig) -> Vec<Tensor> {
    let shape = ClipShape {
        frames: config.training.frames_needed(),
        channels: config.model.channels,
        width: config.model.image_width,
    };
    let dataset: Arc<dyn FrameDataset> =
        Arc::new(BouncingBlocks::new(config.training.batch_size, shape, 2, 3));
    let indices: Vec<usize> = (0..config.training.batch_size).collect();
    let raw = SequenceBatch::gather(dataset.as_ref(), &indices).unwrap();
    normalize_data(config, &raw, &Device::Cpu).unwrap()
}

fn params(model: &HsvgModel) -> Vec<(String, Vec<f32>)> {
    let data = model.var_map.data().lock().unwrap();
    let mut all: Vec<_> = data
        .iter()
        .map(|(name, var)| {
            (
                name.clone(),
                var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            )
        })
        .collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn test_train_step_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = e2e_config(&dir);
    let x = load_batch(&config);
    assert_eq!(x.len(), 8);
    assert_eq!(x[0].dims(), &[10, 1, 64, 64]);

    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();
    let before = params(trainer.model());
    let losses = trainer.train_step(&x).unwrap();

    assert!(losses.rec.is_finite() && losses.rec >= 0.0);
    assert!(losses.kld.is_finite() && losses.kld >= 0.0);
    assert_ne!(before, params(trainer.model()));
}

#[test]
fn test_train_step_rejects_two_frames() {
    let dir = TempDir::new().unwrap();
    let config = e2e_config(&dir);
    let x = load_batch(&config);
    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();

    let err = trainer.train_step(&x[..2]).unwrap_err();
    assert!(matches!(err, HsvgError::SequenceTooShort { actual: 2, .. }));
}

#[test]
fn test_noise_only_changes_the_stochastic_branch() {
    let dir = TempDir::new().unwrap();
    let config = e2e_config(&dir);
    let x = load_batch(&config);
    let n_past = config.training.n_past;
    // Each step draws a posterior and a prior sample per level.
    let draws_per_step = 2 * config.n_level();
    // Warm-up step plus the accumulated steps still inside the window.
    let shared = draws_per_step * (n_past - 1);

    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();
    let mut run = |future: f32| {
        let script: Vec<f32> = (0..shared).map(|i| (i % 5) as f32 * 0.1).collect();
        trainer
            .model_mut()
            .set_noise(Box::new(ScriptedNoise::new(script, future)));
        trainer.step_losses(&x).unwrap()
    };
    let a = run(0.0);
    let b = run(2.5);

    let observed = n_past - 2;
    assert_eq!(a.len(), 6);
    assert_eq!(a[..observed], b[..observed]);
    assert_ne!(
        a[observed..].iter().map(|s| s.rec).collect::<Vec<_>>(),
        b[observed..].iter().map(|s| s.rec).collect::<Vec<_>>()
    );
}

#[test]
fn test_checkpoint_resume_continues_identically() {
    let dir = TempDir::new().unwrap();
    let mut config = HsvgConfig::test_preset();
    config.log_dir = dir.path().to_string_lossy().into_owned();
    config.training.n_epochs = 10;
    let x = load_batch(&config);

    let mut original = Trainer::with_device(config.clone(), Device::Cpu).unwrap();
    original.model_mut().set_noise(Box::new(ConstantNoise(0.0)));
    original.train_step(&x).unwrap();
    original.train_step(&x).unwrap();
    let path = original.save_checkpoint(3).unwrap();
    assert!(path.ends_with("hsvgnet_ep0003.safetensors"));

    let mut resumed = Trainer::with_device(config.clone(), Device::Cpu).unwrap();
    resumed.model_mut().set_noise(Box::new(ConstantNoise(0.0)));
    let record = resumed.resume().unwrap().unwrap();
    assert_eq!(record.epoch, 3);
    assert_eq!(resumed.epoch(), 4);
    assert_eq!(record.step_count, 2);
    assert_eq!(params(original.model()), params(resumed.model()));

    let a = original.train_step(&x).unwrap();
    let b = resumed.train_step(&x).unwrap();
    assert_eq!(a, b);
    assert_eq!(params(original.model()), params(resumed.model()));

    let manager = CheckpointManager::new(original.run_dir()).unwrap();
    assert_eq!(manager.checkpoint_epochs().unwrap(), vec![3]);
}

#[test]
fn test_fresh_run_without_checkpoint_starts_at_zero() {
    let dir = TempDir::new().unwrap();
    let mut config = HsvgConfig::test_preset();
    config.log_dir = dir.path().to_string_lossy().into_owned();
    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();
    assert!(trainer.resume().unwrap().is_none());
    assert_eq!(trainer.epoch(), 0);
}

#[test]
fn test_corrupt_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut config = HsvgConfig::test_preset();
    config.log_dir = dir.path().to_string_lossy().into_owned();
    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();
    std::fs::write(
        trainer.run_dir().join("hsvgnet_ep0009.safetensors"),
        b"not a checkpoint",
    )
    .unwrap();
    assert!(matches!(trainer.resume(), Err(HsvgError::Checkpoint(_))));
}

#[test]
fn test_rollout_is_deterministic_with_fixed_noise() {
    // Three levels, two conditioning frames, two predicted frames.
    let config = HsvgConfig::test_preset();
    assert_eq!(config.n_level(), 3);
    let (n_past, n_eval) = (2, 4);
    let x = load_batch(&config);
    let mut model = HsvgModel::new(&config.model, &Device::Cpu, Box::new(SeededNoise::new(0))).unwrap();

    let mut sample = |model: &mut HsvgModel| {
        model.set_noise(Box::new(SeededNoise::new(42)));
        rollout(model, &x, 2, n_past, n_eval).unwrap()
    };
    let first = sample(&mut model);
    let second = sample(&mut model);

    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.len(), n_eval);
        for t in 0..n_eval {
            assert_eq!(values(&a[t]), values(&b[t]));
        }
        for t in 0..n_past {
            assert_eq!(values(&a[t]), values(&x[t]));
        }
    }
    // Samples within one rollout use different noise.
    assert_ne!(values(&first[0][3]), values(&first[1][3]));
}

#[test]
fn test_rollout_matches_hand_chained_prediction() {
    // Three levels, two conditioning frames, two predicted frames. Zero noise
    // makes every latent its mean.
    let config = HsvgConfig::test_preset();
    let (n_past, n_eval) = (2, 4);
    let x = load_batch(&config);
    let mut model =
        HsvgModel::new(&config.model, &Device::Cpu, Box::new(ConstantNoise(0.0))).unwrap();
    let rolled = rollout(&mut model, &x, 1, n_past, n_eval).unwrap().remove(0);

    // Condition on x[1] through the posterior and keep its skips.
    model.init_states(&x[0]).unwrap();
    let rec = model.reconstruction(&x[1]).unwrap();
    model.set_skips(rec.feats).unwrap();
    let conditioned_skips = values(&model.skips().unwrap()[0]);

    // Prior-driven steps that feed the generated frame back as context.
    let mut expected = Vec::new();
    for x_t in &x[n_past..n_eval] {
        let out = model.step(x_t, false, StepMode::Inference).unwrap();
        expected.push(out.x_out);
    }
    assert_eq!(values(&model.skips().unwrap()[0]), conditioned_skips);

    for (t, frame) in expected.iter().enumerate() {
        assert_eq!(values(&rolled[n_past + t]), values(frame));
        assert_ne!(values(&rolled[n_past + t]), values(&x[n_past + t]));
    }
}
