//! Feature adapters ("necks") between the backbones and the fusion core.
//!
//! Backbones emit feature maps with their own channel counts (e.g. 2048 for
//! the image network, 512 for the BEV network).  An adapter maps a
//! `[B, C_in, H, W]` map to `[B, E, H, W]` without touching the spatial
//! layout, so every sensor can be tokenised into the same embedding space.
//!
//! - [`LinearNeck`] – learned per-pixel projection (a 1×1 convolution).
//! - [`PassThrough`] – identity for backbones that already emit `E` channels.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};
use fsd_types::config::NeckConfig;
use fsd_types::{FsdError, Result};

/// Maps one sensor's feature map to the common embedding width.
pub trait FeatureAdapter: Send + Sync {
    /// Identifier used in error messages (e.g. `"img_neck"`).
    fn name(&self) -> &str;

    /// Channel count of the adapted map.
    fn out_channels(&self) -> usize;

    /// `[B, C_in, H, W]` → `[B, out_channels, H, W]`.
    fn adapt(&self, features: &Tensor) -> Result<Tensor>;
}

/// Resolve an optional neck description into an adapter.
pub fn build_adapter(
    name: &str,
    neck: Option<&NeckConfig>,
    embed_dims: usize,
    vb: VarBuilder,
) -> Result<Box<dyn FeatureAdapter>> {
    Ok(match neck {
        Some(cfg) => Box::new(LinearNeck::new(name, cfg, vb)?),
        None => Box::new(PassThrough::new(name, embed_dims)),
    })
}

/// Per-pixel linear projection `C_in → C_out`.
#[derive(Debug, Clone)]
pub struct LinearNeck {
    name: String,
    in_channels: usize,
    out_channels: usize,
    proj: Linear,
}

impl LinearNeck {
    pub fn new(name: &str, cfg: &NeckConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            in_channels: cfg.in_channels,
            out_channels: cfg.out_channels,
            proj: linear(cfg.in_channels, cfg.out_channels, vb)?,
        })
    }
}

impl FeatureAdapter for LinearNeck {
    fn name(&self) -> &str {
        &self.name
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn adapt(&self, features: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = dims4(&self.name, features)?;
        if c != self.in_channels {
            return Err(FsdError::shape(
                self.name.clone(),
                format!("expected {} input channels, got {c}", self.in_channels),
            ));
        }
        // Channels last so the projection runs over C, then back.
        let x = features.permute((0, 2, 3, 1))?.contiguous()?;
        let x = self.proj.forward(&x)?;
        Ok(x.permute((0, 3, 1, 2))?.contiguous()?)
    }
}

/// Identity adapter; only checks the channel count.
#[derive(Debug, Clone)]
pub struct PassThrough {
    name: String,
    channels: usize,
}

impl PassThrough {
    pub fn new(name: &str, channels: usize) -> Self {
        Self {
            name: name.to_string(),
            channels,
        }
    }
}

impl FeatureAdapter for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn out_channels(&self) -> usize {
        self.channels
    }

    fn adapt(&self, features: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = dims4(&self.name, features)?;
        if c != self.channels {
            return Err(FsdError::shape(
                self.name.clone(),
                format!("no neck configured and {c} channels differ from embed_dims {}", self.channels),
            ));
        }
        Ok(features.clone())
    }
}

fn dims4(name: &str, t: &Tensor) -> Result<(usize, usize, usize, usize)> {
    t.dims4().map_err(|_| {
        FsdError::shape(name.to_string(), format!("expected [B, C, H, W], got {:?}", t.dims()))
    })
}
