//! DCGAN-style frame encoder and decoder.
//!
//! The encoder halves the spatial size with stride-2 convolutions until the
//! map is 4×4, then collapses it into a `g_dim` vector. Every intermediate map
//! is returned as a skip connection. The decoder mirrors the encoder and
//! concatenates the matching skip before each upsampling stage.
//!
//! ```text
//! 64×64 → 32 → 16 → 8 → 4 → [g_dim]          (encoder, 4 skips)
//! [g_dim] → 4 ⊕skip₃ → 8 ⊕skip₂ → 16 ⊕skip₁ → 32 ⊕skip₀ → 64
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{
    conv2d, conv_transpose2d, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig,
    VarBuilder,
};

use crate::error::{HsvgError, Result};

const LEAKY_SLOPE: f64 = 0.2;

/// Number of stride-2 stages needed to bring `image_width` down to 4.
#[must_use]
pub fn downsampling_stages(image_width: usize) -> usize {
    (image_width.trailing_zeros() as usize).saturating_sub(2)
}

/// Channel width of each downsampling stage, capped at `8 * filters`.
fn stage_widths(filters: usize, stages: usize) -> Vec<usize> {
    (0..stages).map(|i| filters << i.min(3)).collect()
}

/// Encoder output for one frame.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Frame embedding, `[batch, g_dim]`.
    pub h: Tensor,
    /// Feature maps from every downsampling stage, finest first.
    pub skips: Vec<Tensor>,
}

/// Frame → `g_dim` embedding plus skip features.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    down: Vec<Conv2d>,
    head: Conv2d,
}

impl FrameEncoder {
    /// Build an encoder for `channels`×`image_width`² frames.
    pub fn new(
        channels: usize,
        image_width: usize,
        filters: usize,
        g_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stages = downsampling_stages(image_width);
        if stages == 0 {
            return Err(HsvgError::Model(format!(
                "image_width {image_width} is too small for the encoder"
            )));
        }
        let widths = stage_widths(filters, stages);
        let halve = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let mut down = Vec::with_capacity(stages);
        let mut in_ch = channels;
        for (i, &out_ch) in widths.iter().enumerate() {
            down.push(conv2d(in_ch, out_ch, 4, halve, vb.pp(format!("down{i}")))?);
            in_ch = out_ch;
        }
        let head = conv2d(in_ch, g_dim, 4, Conv2dConfig::default(), vb.pp("head"))?;

        Ok(Self { down, head })
    }

    /// Number of skip maps produced per frame.
    #[must_use]
    pub fn num_skips(&self) -> usize {
        self.down.len()
    }

    /// Encode a `[batch, channels, width, width]` frame.
    pub fn forward(&self, x: &Tensor) -> Result<EncodedFrame> {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut h = x.clone();
        for conv in &self.down {
            h = candle_nn::ops::leaky_relu(&conv.forward(&h)?, LEAKY_SLOPE)?;
            skips.push(h.clone());
        }
        let h = self.head.forward(&h)?.tanh()?.flatten_from(1)?;
        Ok(EncodedFrame { h, skips })
    }
}

/// `g_dim` vector plus skips → frame in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    head: ConvTranspose2d,
    /// Upsampling stages, coarsest first.
    up: Vec<ConvTranspose2d>,
    g_dim: usize,
}

impl FrameDecoder {
    /// Build the decoder matching a [`FrameEncoder`] with the same arguments.
    pub fn new(
        channels: usize,
        image_width: usize,
        filters: usize,
        g_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let stages = downsampling_stages(image_width);
        if stages == 0 {
            return Err(HsvgError::Model(format!(
                "image_width {image_width} is too small for the decoder"
            )));
        }
        let widths = stage_widths(filters, stages);
        let double = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let head = conv_transpose2d(
            g_dim,
            widths[stages - 1],
            4,
            ConvTranspose2dConfig::default(),
            vb.pp("head"),
        )?;

        let mut up = Vec::with_capacity(stages);
        for j in (0..stages).rev() {
            let out_ch = if j == 0 { channels } else { widths[j - 1] };
            up.push(conv_transpose2d(
                2 * widths[j],
                out_ch,
                4,
                double,
                vb.pp(format!("up{j}")),
            )?);
        }

        Ok(Self { head, up, g_dim })
    }

    /// Decode `g` (`[batch, g_dim]`) using `skips` as produced by the encoder.
    pub fn forward(&self, g: &Tensor, skips: &[Tensor]) -> Result<Tensor> {
        if skips.len() != self.up.len() {
            return Err(HsvgError::Model(format!(
                "decoder expects {} skip maps, got {}",
                self.up.len(),
                skips.len()
            )));
        }
        let batch = g.dim(0)?;
        let x = g.reshape((batch, self.g_dim, 1, 1))?;
        let mut d = candle_nn::ops::leaky_relu(&self.head.forward(&x)?, LEAKY_SLOPE)?;

        let last = self.up.len() - 1;
        for (k, (stage, skip)) in self.up.iter().zip(skips.iter().rev()).enumerate() {
            let y = stage.forward(&Tensor::cat(&[&d, skip], 1)?)?;
            d = if k == last {
                candle_nn::ops::sigmoid(&y)?
            } else {
                candle_nn::ops::leaky_relu(&y, LEAKY_SLOPE)?
            };
        }
        Ok(d)
    }
}
