//! Fixed 2-D sine positional encoding.
//!
//! For an `H × W` map the encoding is `2 · num_feats` channels wide: the
//! first half encodes the row, the second half the column.  Within each
//! half, even channels use `sin` and odd channels `cos` of the (optionally
//! normalised) 1-based coordinate divided by
//! `temperature^(2·⌊k/2⌋ / num_feats)`:
//!
//! ```text
//! y = (i + 1 + offset) / (H + eps) · scale      (normalize = true)
//! y = i + 1                                     (normalize = false)
//! pe[k,     i, j] = sin|cos( y / dim_t[k] )     k <  num_feats
//! pe[F + k, i, j] = sin|cos( x / dim_t[k] )     k <  num_feats
//! ```
//!
//! The encoding depends only on the map size, never on feature values, so it
//! is computed on the host and uploaded once per call.

use candle_core::{DType, Device, Tensor};
use fsd_types::Result;
use fsd_types::config::PositionalEncodingConfig;

#[derive(Debug, Clone)]
pub struct SinePositionalEncoding {
    num_feats: usize,
    temperature: f64,
    normalize: bool,
    scale: f64,
    eps: f64,
    offset: f64,
}

impl SinePositionalEncoding {
    pub fn new(cfg: &PositionalEncodingConfig) -> Self {
        Self {
            num_feats: cfg.num_feats,
            temperature: cfg.temperature,
            normalize: cfg.normalize,
            scale: cfg.scale,
            eps: cfg.eps,
            offset: cfg.offset,
        }
    }

    /// Width of the encoding (`2 · num_feats`).
    pub fn dims(&self) -> usize {
        2 * self.num_feats
    }

    /// Encode an `height × width` map as a `[2·num_feats, height, width]`
    /// tensor of the given dtype.
    pub fn encode(&self, height: usize, width: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let f = self.num_feats;
        let dim_t: Vec<f64> = (0..f)
            .map(|k| self.temperature.powf(2.0 * (k / 2) as f64 / f as f64))
            .collect();

        let ys: Vec<f64> = (0..height).map(|i| self.coordinate(i, height)).collect();
        let xs: Vec<f64> = (0..width).map(|j| self.coordinate(j, width)).collect();

        let plane = height * width;
        let mut data = vec![0f32; 2 * f * plane];
        for (k, t) in dim_t.iter().enumerate() {
            let wave = |v: f64| if k % 2 == 0 { (v / t).sin() } else { (v / t).cos() };
            let row_channel = &mut data[k * plane..(k + 1) * plane];
            for (i, y) in ys.iter().enumerate() {
                row_channel[i * width..(i + 1) * width].fill(wave(*y) as f32);
            }
            let col_channel = &mut data[(f + k) * plane..(f + k + 1) * plane];
            for i in 0..height {
                for (j, x) in xs.iter().enumerate() {
                    col_channel[i * width + j] = wave(*x) as f32;
                }
            }
        }
        Ok(Tensor::from_vec(data, (2 * f, height, width), device)?.to_dtype(dtype)?)
    }

    fn coordinate(&self, index: usize, extent: usize) -> f64 {
        let cumulative = (index + 1) as f64;
        if self.normalize {
            (cumulative + self.offset) / (extent as f64 + self.eps) * self.scale
        } else {
            cumulative
        }
    }
}
