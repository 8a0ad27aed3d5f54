//! Video datasets and batch normalization.
//!
//! A [`FrameDataset`] serves fixed-length clips of raw `u8` frames laid out as
//! `(time, channels, width, width)`. Two sources are provided:
//!
//! - [`BouncingBlocks`]: procedurally generated blocks that bounce off the
//!   frame borders and pick a fresh random velocity on every bounce
//! - [`TensorFileDataset`]: pre-rendered clips stored in a safetensors file
//!
//! [`normalize_data`] turns a [`SequenceBatch`] into the `T` frame tensors the
//! model consumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{DatasetKind, HsvgConfig};
use crate::error::{HsvgError, Result};

/// Which half of a dataset to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Training sequences.
    Train,
    /// Held-out sequences used for evaluation plots.
    Test,
}

impl Split {
    fn file_stem(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

/// Geometry shared by every clip of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipShape {
    /// Frames per clip.
    pub frames: usize,
    /// Channels per frame.
    pub channels: usize,
    /// Frame height and width.
    pub width: usize,
}

impl ClipShape {
    /// Bytes in one frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.channels * self.width * self.width
    }

    /// Bytes in one clip.
    #[must_use]
    pub fn clip_len(&self) -> usize {
        self.frames * self.frame_len()
    }
}

/// Random-access collection of video clips.
pub trait FrameDataset: Send + Sync {
    /// Number of clips.
    fn len(&self) -> usize;

    /// Whether the dataset holds no clips.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Geometry of every clip.
    fn shape(&self) -> ClipShape;

    /// Raw pixels of clip `index`, `shape().clip_len()` bytes.
    fn sequence(&self, index: usize) -> Result<Vec<u8>>;
}

/// A batch of raw clips, `(batch, time, channels, width, width)` in row-major order.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    /// Pixel data.
    pub data: Vec<u8>,
    /// Number of clips.
    pub batch: usize,
    /// Geometry of each clip.
    pub shape: ClipShape,
}

impl SequenceBatch {
    /// Gather the clips at `indices` from `dataset`.
    pub fn gather(dataset: &dyn FrameDataset, indices: &[usize]) -> Result<Self> {
        let shape = dataset.shape();
        let mut data = Vec::with_capacity(indices.len() * shape.clip_len());
        for &index in indices {
            let clip = dataset.sequence(index)?;
            if clip.len() != shape.clip_len() {
                return Err(HsvgError::Dataset(format!(
                    "clip {index} has {} bytes, expected {}",
                    clip.len(),
                    shape.clip_len()
                )));
            }
            data.extend_from_slice(&clip);
        }
        Ok(Self {
            data,
            batch: indices.len(),
            shape,
        })
    }
}

/// Convert a raw batch into `T` tensors of shape `[batch, channels, width, width]`
/// with values in `[0, 1]`.
///
/// # Errors
///
/// Returns [`HsvgError::Dataset`] if the clip geometry does not match the
/// model configuration.
pub fn normalize_data(config: &HsvgConfig, batch: &SequenceBatch, device: &Device) -> Result<Vec<Tensor>> {
    let ClipShape {
        frames,
        channels,
        width,
    } = batch.shape;
    if channels != config.model.channels || width != config.model.image_width {
        return Err(HsvgError::Dataset(format!(
            "clips are {channels}×{width}×{width}, model expects {}×{}×{}",
            config.model.channels, config.model.image_width, config.model.image_width
        )));
    }
    let raw = Tensor::from_vec(
        batch.data.clone(),
        (batch.batch, frames, channels, width, width),
        device,
    )?;
    let scaled = (raw.to_dtype(DType::F32)? / 255.0)?;
    (0..frames)
        .map(|t| Ok(scaled.i((.., t))?.contiguous()?))
        .collect()
}

/// Open the dataset selected by `config` for `split`.
pub fn load_dataset(config: &HsvgConfig, split: Split) -> Result<Arc<dyn FrameDataset>> {
    let shape = ClipShape {
        frames: config.training.frames_needed(),
        channels: config.model.channels,
        width: config.model.image_width,
    };
    match config.data.dataset {
        DatasetKind::Bouncing => {
            let (len, seed) = match split {
                Split::Train => (config.data.train_size, config.seed),
                Split::Test => (config.data.test_size, config.seed ^ 0x5eed_7e57),
            };
            Ok(Arc::new(BouncingBlocks::new(
                len,
                shape,
                config.data.num_blocks,
                seed,
            )))
        }
        DatasetKind::TensorFile => {
            let path =
                PathBuf::from(&config.data.data_root).join(format!("{}.safetensors", split.file_stem()));
            Ok(Arc::new(TensorFileDataset::open(&path, shape)?))
        }
    }
}

/// Stochastic bouncing blocks.
///
/// Clip `i` is a pure function of `(seed, i)`, so any worker can render any
/// clip without coordination.
#[derive(Debug, Clone)]
pub struct BouncingBlocks {
    len: usize,
    shape: ClipShape,
    num_blocks: usize,
    block: usize,
    seed: u64,
}

impl BouncingBlocks {
    /// `len` clips of `num_blocks` blocks each.
    #[must_use]
    pub fn new(len: usize, shape: ClipShape, num_blocks: usize, seed: u64) -> Self {
        Self {
            len,
            shape,
            num_blocks,
            block: (shape.width / 4).max(2),
            seed,
        }
    }

    fn rng_for(&self, index: usize) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

struct Block {
    x: i64,
    y: i64,
    dx: i64,
    dy: i64,
}

fn random_velocity(rng: &mut ChaCha8Rng, max_speed: i64) -> i64 {
    let magnitude = rng.random_range(1..=max_speed);
    if rng.random_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

impl FrameDataset for BouncingBlocks {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ClipShape {
        self.shape
    }

    fn sequence(&self, index: usize) -> Result<Vec<u8>> {
        if index >= self.len {
            return Err(HsvgError::Dataset(format!(
                "index {index} out of range for {} clips",
                self.len
            )));
        }
        let ClipShape {
            frames,
            channels,
            width,
        } = self.shape;
        let mut rng = self.rng_for(index);
        let limit = (width - self.block) as i64;
        let max_speed = (width as i64 / 16).max(1);

        let mut blocks: Vec<Block> = (0..self.num_blocks)
            .map(|_| Block {
                x: rng.random_range(0..=limit),
                y: rng.random_range(0..=limit),
                dx: random_velocity(&mut rng, max_speed),
                dy: random_velocity(&mut rng, max_speed),
            })
            .collect();

        let frame_len = self.shape.frame_len();
        let plane = width * width;
        let mut clip = vec![0u8; frames * frame_len];
        for t in 0..frames {
            let frame = &mut clip[t * frame_len..(t + 1) * frame_len];
            for b in &blocks {
                for row in b.y as usize..b.y as usize + self.block {
                    for col in b.x as usize..b.x as usize + self.block {
                        for c in 0..channels {
                            frame[c * plane + row * width + col] = 255;
                        }
                    }
                }
            }

            for b in &mut blocks {
                b.x += b.dx;
                b.y += b.dy;
                if b.x < 0 || b.x > limit {
                    b.x = b.x.clamp(0, limit);
                    let speed = random_velocity(&mut rng, max_speed).abs();
                    b.dx = if b.x == 0 { speed } else { -speed };
                    b.dy = random_velocity(&mut rng, max_speed);
                }
                if b.y < 0 || b.y > limit {
                    b.y = b.y.clamp(0, limit);
                    let speed = random_velocity(&mut rng, max_speed).abs();
                    b.dy = if b.y == 0 { speed } else { -speed };
                    b.dx = random_velocity(&mut rng, max_speed);
                }
            }
        }
        Ok(clip)
    }
}

/// Clips loaded from a safetensors file holding a `frames` tensor of shape
/// `[N, T, C, H, W]` and dtype `u8`. Clips longer than needed are truncated.
#[derive(Debug, Clone)]
pub struct TensorFileDataset {
    data: Vec<u8>,
    len: usize,
    stored_frames: usize,
    shape: ClipShape,
}

impl TensorFileDataset {
    /// Load `path`, checking that clips match `shape`.
    pub fn open(path: &Path, shape: ClipShape) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| HsvgError::Dataset(format!("failed to read {}: {e}", path.display())))?;
        let frames = tensors.get("frames").ok_or_else(|| {
            HsvgError::Dataset(format!("{} has no `frames` tensor", path.display()))
        })?;
        if frames.dtype() != DType::U8 {
            return Err(HsvgError::Dataset(format!(
                "`frames` must be u8, found {:?}",
                frames.dtype()
            )));
        }
        let (len, stored_frames, channels, height, width) = frames.dims5()?;
        if channels != shape.channels || height != shape.width || width != shape.width {
            return Err(HsvgError::Dataset(format!(
                "stored frames are {channels}×{height}×{width}, expected {}×{}×{}",
                shape.channels, shape.width, shape.width
            )));
        }
        if stored_frames < shape.frames {
            return Err(HsvgError::Dataset(format!(
                "stored clips have {stored_frames} frames, {} are needed",
                shape.frames
            )));
        }
        tracing::info!("Loaded {} clips from {}", len, path.display());
        Ok(Self {
            data: frames.flatten_all()?.to_vec1::<u8>()?,
            len,
            stored_frames,
            shape,
        })
    }
}

impl FrameDataset for TensorFileDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn shape(&self) -> ClipShape {
        self.shape
    }

    fn sequence(&self, index: usize) -> Result<Vec<u8>> {
        if index >= self.len {
            return Err(HsvgError::Dataset(format!(
                "index {index} out of range for {} clips",
                self.len
            )));
        }
        let start = index * self.stored_frames * self.shape.frame_len();
        Ok(self.data[start..start + self.shape.clip_len()].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn small_shape() -> ClipShape {
        ClipShape {
            frames: 6,
            channels: 1,
            width: 16,
        }
    }

    #[test]
    fn test_bouncing_blocks_are_deterministic_per_index() {
        let dataset = BouncingBlocks::new(4, small_shape(), 2, 3);
        assert_eq!(dataset.sequence(1).unwrap(), dataset.sequence(1).unwrap());
        assert_ne!(dataset.sequence(1).unwrap(), dataset.sequence(2).unwrap());
        assert!(dataset.sequence(4).is_err());
    }

    #[test]
    fn test_bouncing_blocks_pixels_and_motion() {
        let shape = small_shape();
        let dataset = BouncingBlocks::new(1, shape, 1, 11);
        let clip = dataset.sequence(0).unwrap();
        assert_eq!(clip.len(), shape.clip_len());
        assert!(clip.iter().all(|&p| p == 0 || p == 255));

        let frame_len = shape.frame_len();
        for t in 0..shape.frames {
            let lit = clip[t * frame_len..(t + 1) * frame_len]
                .iter()
                .filter(|&&p| p == 255)
                .count();
            assert_eq!(lit, 16, "one 4×4 block per frame");
        }
        let first = &clip[..frame_len];
        assert!((1..shape.frames).any(|t| &clip[t * frame_len..(t + 1) * frame_len] != first));
    }

    #[test]
    fn test_normalize_data_shapes_and_range() {
        let mut config = HsvgConfig::test_preset();
        config.model.image_width = 16;
        let dataset = BouncingBlocks::new(3, small_shape(), 2, 0);
        let batch = SequenceBatch::gather(&dataset, &[0, 2]).unwrap();
        let frames = normalize_data(&config, &batch, &Device::Cpu).unwrap();

        assert_eq!(frames.len(), 6);
        for frame in &frames {
            assert_eq!(frame.dims(), &[2, 1, 16, 16]);
            let values = frame.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));
        }
    }

    #[test]
    fn test_normalize_data_rejects_wrong_geometry() {
        let config = HsvgConfig::test_preset();
        let dataset = BouncingBlocks::new(1, small_shape(), 1, 0);
        let batch = SequenceBatch::gather(&dataset, &[0]).unwrap();
        assert!(matches!(
            normalize_data(&config, &batch, &Device::Cpu),
            Err(HsvgError::Dataset(_))
        ));
    }

    #[test]
    fn test_tensor_file_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        // 3 clips of 8 frames, 1×8×8, pixel = clip index * 10 + frame.
        let mut raw = Vec::new();
        for clip in 0..3u8 {
            for frame in 0..8u8 {
                raw.extend(std::iter::repeat(clip * 10 + frame).take(64));
            }
        }
        let frames = Tensor::from_vec(raw, (3, 8, 1, 8, 8), &Device::Cpu).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("frames".to_string(), frames);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let shape = ClipShape {
            frames: 5,
            channels: 1,
            width: 8,
        };
        let dataset = TensorFileDataset::open(&path, shape).unwrap();
        assert_eq!(dataset.len(), 3);
        let clip = dataset.sequence(2).unwrap();
        assert_eq!(clip.len(), 5 * 64);
        assert_eq!(clip[0], 20);
        assert_eq!(clip[4 * 64], 24);

        let too_long = ClipShape { frames: 9, ..shape };
        assert!(TensorFileDataset::open(&path, too_long).is_err());
        assert!(TensorFileDataset::open(&dir.path().join("missing.safetensors"), shape).is_err());
    }

    #[test]
    fn test_load_dataset_bouncing_splits_differ() {
        let config = HsvgConfig::test_preset();
        let train = load_dataset(&config, Split::Train).unwrap();
        let test = load_dataset(&config, Split::Test).unwrap();
        assert_eq!(train.len(), 16);
        assert_eq!(test.len(), 8);
        assert_eq!(train.shape().frames, 5);
        assert_ne!(train.sequence(0).unwrap(), test.sequence(0).unwrap());
    }
}
