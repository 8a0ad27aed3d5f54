//! Evaluation rollouts and sample dumps.
//!
//! A rollout conditions the model on the first `n_past` true frames and then
//! lets it run autoregressively up to `n_eval` frames. Several stochastic
//! samples are drawn per batch; for display, each example keeps its
//! closest-to-truth sample plus a few random ones.
//!
//! Sequences are time-major: `sequence[t]` is a `[batch, channels, width, width]`
//! tensor. Nothing computed here feeds back into training.

use std::path::{Path, PathBuf};

use candle_core::{IndexOp, Tensor};
use rand::Rng;

use crate::error::{HsvgError, Result};
use crate::model::HsvgModel;

/// Frames of one generated or observed sequence, time-major.
pub type Sequence = Vec<Tensor>;

/// Random samples shown next to the best one.
pub const RANDOM_PICKS: usize = 4;
/// Maximum number of examples written per dump.
pub const MAX_DISPLAY_ROWS: usize = 10;

fn check_len(x: &[Tensor], required: usize) -> Result<()> {
    if x.len() < required {
        return Err(HsvgError::SequenceTooShort {
            required,
            actual: x.len(),
        });
    }
    Ok(())
}

/// Draw `n_samples` rollouts of `n_eval` frames each.
///
/// Inside the conditioning window (`t < n_past`) the model runs a
/// posterior reconstruction of the true frame, adopts its skip features and
/// records the true frame; afterwards it predicts from the prior and records
/// its own output.
pub fn rollout(
    model: &mut HsvgModel,
    x: &[Tensor],
    n_samples: usize,
    n_past: usize,
    n_eval: usize,
) -> Result<Vec<Sequence>> {
    check_len(x, n_eval.max(1))?;
    let mut samples = Vec::with_capacity(n_samples);
    for _ in 0..n_samples {
        model.init_states(&x[0])?;
        let mut seq = Vec::with_capacity(n_eval);
        seq.push(x[0].clone());
        for (t, x_t) in x.iter().enumerate().take(n_eval).skip(1) {
            if t < n_past {
                let rec = model.reconstruction(x_t)?;
                model.set_skips(rec.feats)?;
                seq.push(x_t.clone());
            } else {
                seq.push(model.inference()?.detach());
            }
        }
        samples.push(seq);
    }
    model.reset();
    tracing::debug!(n_samples, n_eval, "rollout finished");
    Ok(samples)
}

/// Posterior-only reconstruction over the first `seq_len` frames.
///
/// Frames inside the conditioning window are copied from `x`; after it, each
/// frame is `decoding(reconstruction(x_t))` with the skips of the last
/// conditioning frame.
pub fn reconstruction_sequence(
    model: &mut HsvgModel,
    x: &[Tensor],
    n_past: usize,
    seq_len: usize,
) -> Result<Sequence> {
    check_len(x, seq_len.max(1))?;
    model.init_states(&x[0])?;
    let mut seq = Vec::with_capacity(seq_len);
    seq.push(x[0].clone());
    for (t, x_t) in x.iter().enumerate().take(seq_len).skip(1) {
        let rec = model.reconstruction(x_t)?;
        if t < n_past {
            model.set_skips(rec.feats)?;
            seq.push(x_t.clone());
        } else {
            seq.push(model.decoding(&rec.hs)?.detach());
        }
    }
    model.reset();
    Ok(seq)
}

/// Cumulative squared error of `sample` against `truth` over every evaluated
/// frame, one value per example.
pub fn sequence_errors(truth: &[Tensor], sample: &[Tensor]) -> Result<Vec<f32>> {
    let steps = sample.len().min(truth.len());
    let mut total: Option<Tensor> = None;
    for t in 0..steps {
        let err = (&truth[t] - &sample[t])?.sqr()?.flatten_from(1)?.sum(1)?;
        total = Some(match total {
            Some(acc) => (acc + err)?,
            None => err,
        });
    }
    match total {
        Some(t) => Ok(t.to_vec1::<f32>()?),
        None => Err(HsvgError::Model("cannot score an empty sequence".into())),
    }
}

/// Index of the sample closest to the truth for each example; ties keep the
/// earliest sample.
pub fn best_samples(truth: &[Tensor], samples: &[Sequence]) -> Result<Vec<usize>> {
    let mut best: Vec<(usize, f32)> = Vec::new();
    for (s, sample) in samples.iter().enumerate() {
        let errors = sequence_errors(truth, sample)?;
        if best.is_empty() {
            best = errors.iter().map(|&e| (s, e)).collect();
            continue;
        }
        for (slot, &err) in best.iter_mut().zip(&errors) {
            if err < slot.1 {
                *slot = (s, err);
            }
        }
    }
    Ok(best.into_iter().map(|(s, _)| s).collect())
}

/// Samples chosen for one displayed example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    /// Example index inside the batch.
    pub example: usize,
    /// Sample indices; the first is the best-of-N.
    pub picks: Vec<usize>,
}

/// Pick the best sample plus [`RANDOM_PICKS`] random ones for up to
/// [`MAX_DISPLAY_ROWS`] examples.
pub fn select_display<R: Rng>(
    truth: &[Tensor],
    samples: &[Sequence],
    rng: &mut R,
) -> Result<Vec<DisplayRow>> {
    if samples.is_empty() {
        return Err(HsvgError::Model("no samples to select from".into()));
    }
    let best = best_samples(truth, samples)?;
    let rows = best.len().min(MAX_DISPLAY_ROWS);
    Ok(best
        .into_iter()
        .take(rows)
        .enumerate()
        .map(|(example, best)| {
            let mut picks = Vec::with_capacity(RANDOM_PICKS + 1);
            picks.push(best);
            picks.extend((0..RANDOM_PICKS).map(|_| rng.random_range(0..samples.len())));
            DisplayRow { example, picks }
        })
        .collect())
}

/// Destination for sample grids.
///
/// Frames are `[channels, width, width]` tensors.
pub trait PlotSink {
    /// Store a still grid, `rows[r][c]`.
    fn save_grid(&mut self, rows: &[Vec<Tensor>], path: &Path) -> Result<()>;

    /// Store an animation, one `rows[r][c]` grid per time step.
    fn save_animation(&mut self, frames: &[Vec<Vec<Tensor>>], path: &Path) -> Result<()>;
}

/// Writes grids as safetensors files (`grid`: `[rows, cols, C, W, W]`,
/// `frames`: `[T, rows, cols, C, W, W]`).
#[derive(Debug, Default, Clone, Copy)]
pub struct TensorDumpSink;

fn stack_grid(rows: &[Vec<Tensor>]) -> Result<Tensor> {
    let stacked = rows
        .iter()
        .map(|row| Tensor::stack(row, 0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&stacked, 0)?)
}

impl PlotSink for TensorDumpSink {
    fn save_grid(&mut self, rows: &[Vec<Tensor>], path: &Path) -> Result<()> {
        let grid = stack_grid(rows)?;
        grid.save_safetensors("grid", path)?;
        Ok(())
    }

    fn save_animation(&mut self, frames: &[Vec<Vec<Tensor>>], path: &Path) -> Result<()> {
        let grids = frames
            .iter()
            .map(|rows| stack_grid(rows))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&grids, 0)?.save_safetensors("frames", path)?;
        Ok(())
    }
}

/// Write the sample grid and animation for `epoch` into `gen_dir`.
///
/// The grid holds, per displayed example, the true row followed by one row
/// per pick. Animation frame `t` holds `[truth, picks...]` per example.
/// Returns the written paths.
pub fn write_samples(
    sink: &mut dyn PlotSink,
    gen_dir: &Path,
    epoch: usize,
    truth: &[Tensor],
    samples: &[Sequence],
    display: &[DisplayRow],
) -> Result<(PathBuf, PathBuf)> {
    let steps = samples.first().map_or(0, Vec::len);
    let mut grid = Vec::new();
    let mut frames: Vec<Vec<Vec<Tensor>>> = vec![Vec::new(); steps];

    for row in display {
        let i = row.example;
        grid.push(
            (0..steps)
                .map(|t| truth[t].i(i))
                .collect::<candle_core::Result<Vec<_>>>()?,
        );
        for &s in &row.picks {
            grid.push(
                (0..steps)
                    .map(|t| samples[s][t].i(i))
                    .collect::<candle_core::Result<Vec<_>>>()?,
            );
        }
        for (t, frame) in frames.iter_mut().enumerate() {
            let mut cols = Vec::with_capacity(row.picks.len() + 1);
            cols.push(truth[t].i(i)?);
            for &s in &row.picks {
                cols.push(samples[s][t].i(i)?);
            }
            frame.push(cols);
        }
    }

    let grid_path = gen_dir.join(format!("sample_{epoch}.safetensors"));
    let anim_path = gen_dir.join(format!("sample_{epoch}_frames.safetensors"));
    sink.save_grid(&grid, &grid_path)?;
    sink.save_animation(&frames, &anim_path)?;
    Ok((grid_path, anim_path))
}

/// Write the reconstruction grid for `epoch` into `gen_dir`, one row per
/// example (at most [`MAX_DISPLAY_ROWS`]).
pub fn write_reconstruction(
    sink: &mut dyn PlotSink,
    gen_dir: &Path,
    epoch: usize,
    seq: &[Tensor],
) -> Result<PathBuf> {
    let batch = seq.first().map_or(Ok(0), |t| t.dim(0))?;
    let rows = (0..batch.min(MAX_DISPLAY_ROWS))
        .map(|i| seq.iter().map(|frame| frame.i(i)).collect())
        .collect::<candle_core::Result<Vec<Vec<Tensor>>>>()?;
    let path = gen_dir.join(format!("rec_{epoch}.safetensors"));
    sink.save_grid(&rows, &path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HsvgConfig;
    use crate::noise::{ConstantNoise, SeededNoise};
    use candle_core::Device;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn frames(n: usize, batch: usize) -> Vec<Tensor> {
        (0..n)
            .map(|t| Tensor::full(t as f32 / n as f32, (batch, 1, 8, 8), &Device::Cpu).unwrap())
            .collect()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn toy(seed: u64) -> HsvgModel {
        let config = HsvgConfig::test_preset();
        HsvgModel::new(&config.model, &Device::Cpu, Box::new(SeededNoise::new(seed))).unwrap()
    }

    #[test]
    fn test_rollout_shape_and_conditioning() {
        let x = frames(5, 2);
        let mut model = toy(1);
        let samples = rollout(&mut model, &x, 3, 2, 5).unwrap();
        assert_eq!(samples.len(), 3);
        for seq in &samples {
            assert_eq!(seq.len(), 5);
            assert_eq!(values(&seq[0]), values(&x[0]));
            assert_eq!(values(&seq[1]), values(&x[1]));
            assert_eq!(seq[4].dims(), &[2, 1, 8, 8]);
        }
        assert!(!model.is_initialized());
        assert!(matches!(model.inference(), Err(HsvgError::NotInitialized)));
    }

    #[test]
    fn test_rollout_requires_n_eval_frames() {
        let x = frames(3, 2);
        let mut model = toy(1);
        assert!(matches!(
            rollout(&mut model, &x, 1, 2, 5),
            Err(HsvgError::SequenceTooShort { required: 5, actual: 3 })
        ));
    }

    #[test]
    fn test_best_samples_picks_lowest_error() {
        let truth = frames(3, 2);
        let exact = truth.clone();
        let off: Vec<Tensor> = truth.iter().map(|t| (t + 0.5).unwrap()).collect();
        let best = best_samples(&truth, &[off.clone(), exact, off]).unwrap();
        assert_eq!(best, vec![1, 1]);

        let errors = sequence_errors(&truth, &frames(3, 2).iter().map(|t| (t + 1.0).unwrap()).collect::<Vec<_>>()).unwrap();
        assert!((errors[0] - 3.0 * 64.0).abs() < 1e-3);
    }

    #[test]
    fn test_select_display_caps_rows() {
        let truth = frames(2, 12);
        let samples = vec![truth.clone(), truth.clone()];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let display = select_display(&truth, &samples, &mut rng).unwrap();
        assert_eq!(display.len(), MAX_DISPLAY_ROWS);
        assert!(display.iter().all(|r| r.picks.len() == RANDOM_PICKS + 1 && r.picks[0] == 0));
        assert!(display.iter().flat_map(|r| &r.picks).all(|&s| s < 2));
    }

    #[test]
    fn test_reconstruction_sequence() {
        let x = frames(4, 2);
        let mut model = toy(3);
        model.set_noise(Box::new(ConstantNoise(0.0)));
        let seq = reconstruction_sequence(&mut model, &x, 2, 4).unwrap();
        assert_eq!(seq.len(), 4);
        assert_eq!(values(&seq[1]), values(&x[1]));
        assert_ne!(values(&seq[3]), values(&x[3]));
    }

    #[test]
    fn test_write_samples_layout() {
        let dir = tempfile::tempdir().unwrap();
        let x = frames(4, 3);
        let mut model = toy(5);
        let samples = rollout(&mut model, &x, 2, 2, 4).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let display = select_display(&x, &samples, &mut rng).unwrap();

        let mut sink = TensorDumpSink;
        let (grid, anim) = write_samples(&mut sink, dir.path(), 3, &x, &samples, &display).unwrap();
        assert!(grid.ends_with("sample_3.safetensors"));

        let grid = candle_core::safetensors::load(&grid, &Device::Cpu).unwrap();
        // 3 examples × (truth + 5 picks), 4 steps
        assert_eq!(grid["grid"].dims(), &[18, 4, 1, 8, 8]);
        let anim = candle_core::safetensors::load(&anim, &Device::Cpu).unwrap();
        assert_eq!(anim["frames"].dims(), &[4, 3, 6, 1, 8, 8]);

        let rec = write_reconstruction(&mut sink, dir.path(), 3, &x).unwrap();
        let rec = candle_core::safetensors::load(&rec, &Device::Cpu).unwrap();
        assert_eq!(rec["grid"].dims(), &[3, 4, 1, 8, 8]);
    }
}
