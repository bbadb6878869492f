//! Attention and feed-forward blocks shared by the encoder and decoder.

use candle_core::{D, Tensor};
use candle_nn::init::DEFAULT_KAIMING_NORMAL;
use candle_nn::{Init, Linear, Module, VarBuilder, linear};
use fsd_types::{FsdError, Result};

/// Multi-head scaled dot-product attention with a packed input projection
/// (`in_proj_weight` rows are `[q; k; v]`).
///
/// Queries and keys may have different lengths, so the same block serves
/// self-attention and encoder-decoder cross-attention.
#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: Linear,
}

impl MultiheadAttention {
    pub fn new(embed_dims: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dims % num_heads != 0 {
            return Err(FsdError::config(format!(
                "embed_dims {embed_dims} is not divisible by num_heads {num_heads}"
            )));
        }
        let in_proj_weight =
            vb.get_with_hints((3 * embed_dims, embed_dims), "in_proj_weight", DEFAULT_KAIMING_NORMAL)?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dims, "in_proj_bias", Init::Const(0.0))?;
        Ok(Self {
            num_heads,
            head_dim: embed_dims / num_heads,
            in_proj_weight,
            in_proj_bias,
            out_proj: linear(embed_dims, embed_dims, vb.pp("out_proj"))?,
        })
    }

    /// `query [B, Lq, E]`, `key` / `value [B, Lk, E]` → `[B, Lq, E]`.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<Tensor> {
        let (b, lq, e) = query.dims3()?;
        let (_, lk, _) = key.dims3()?;

        let q = self.split_heads(&self.project(query, 0)?, b, lq)?;
        let k = self.split_heads(&self.project(key, 1)?, b, lk)?;
        let v = self.split_heads(&self.project(value, 2)?, b, lk)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let weights = (q.matmul(&k_t)? / scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, lq, e))?;
        Ok(self.out_proj.forward(&out)?)
    }

    fn project(&self, x: &Tensor, slot: usize) -> Result<Tensor> {
        let e = self.num_heads * self.head_dim;
        let w = self.in_proj_weight.narrow(0, slot * e, e)?;
        let bias = self.in_proj_bias.narrow(0, slot * e, e)?;
        Ok(x.broadcast_matmul(&w.t()?)?.broadcast_add(&bias)?)
    }

    /// `[B, L, E]` → `[B, heads, L, head_dim]`.
    fn split_heads(&self, x: &Tensor, b: usize, len: usize) -> Result<Tensor> {
        Ok(x
            .reshape((b, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// `Linear(E → F) → ReLU → Linear(F → E)`; the caller adds the residual.
#[derive(Debug, Clone)]
pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    pub fn new(embed_dims: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: linear(embed_dims, hidden, vb.pp("linear1"))?,
            linear2: linear(hidden, embed_dims, vb.pp("linear2"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.linear2.forward(&self.linear1.forward(x)?.relu()?)
    }
}
