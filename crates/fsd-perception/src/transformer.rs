//! Post-norm encoder/decoder stack fusing the sensor tokens.
//!
//! Encoder layer: `self_attn → norm1 → ffn → norm2`.
//! Decoder layer: `self_attn → norm1 → cross_attn → norm2 → ffn → norm3`,
//! where the query positional encoding is added to the self-attention
//! queries and keys and to the cross-attention queries.  A final
//! `decoder_norm` is applied to the decoder output.

use candle_core::Tensor;
use candle_nn::{LayerNorm, Module, VarBuilder, layer_norm};
use fsd_types::config::{ModelConfig, TransformerStackConfig};
use fsd_types::{FsdError, Result};
use tracing::{debug, instrument};

use crate::attention::{FeedForward, MultiheadAttention};
use crate::query_builder::QueryBatch;

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: MultiheadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(embed_dims: usize, cfg: &TransformerStackConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::new(embed_dims, cfg.num_heads, vb.pp("self_attn"))?,
            ffn: FeedForward::new(embed_dims, cfg.feedforward_channels, vb.clone())?,
            norm1: layer_norm(embed_dims, cfg.layer_norm_eps, vb.pp("norm1"))?,
            norm2: layer_norm(embed_dims, cfg.layer_norm_eps, vb.pp("norm2"))?,
        })
    }

    pub fn forward(&self, src: &Tensor) -> Result<Tensor> {
        let attended = self.self_attn.forward(src, src, src)?;
        let src = self.norm1.forward(&(src + attended)?)?;
        let fed = self.ffn.forward(&src)?;
        Ok(self.norm2.forward(&(src + fed)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: MultiheadAttention,
    cross_attn: MultiheadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl DecoderLayer {
    pub fn new(embed_dims: usize, cfg: &TransformerStackConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::new(embed_dims, cfg.num_heads, vb.pp("self_attn"))?,
            cross_attn: MultiheadAttention::new(embed_dims, cfg.num_heads, vb.pp("multihead_attn"))?,
            ffn: FeedForward::new(embed_dims, cfg.feedforward_channels, vb.clone())?,
            norm1: layer_norm(embed_dims, cfg.layer_norm_eps, vb.pp("norm1"))?,
            norm2: layer_norm(embed_dims, cfg.layer_norm_eps, vb.pp("norm2"))?,
            norm3: layer_norm(embed_dims, cfg.layer_norm_eps, vb.pp("norm3"))?,
        })
    }

    /// `tgt`, `query_pos [B, Q, E]`; `memory [B, S, E]`.
    pub fn forward(&self, tgt: &Tensor, memory: &Tensor, query_pos: &Tensor) -> Result<Tensor> {
        let q = (tgt + query_pos)?;
        let attended = self.self_attn.forward(&q, &q, tgt)?;
        let tgt = self.norm1.forward(&(tgt + attended)?)?;

        let q = (&tgt + query_pos)?;
        let attended = self.cross_attn.forward(&q, memory, memory)?;
        let tgt = self.norm2.forward(&(tgt + attended)?)?;

        let fed = self.ffn.forward(&tgt)?;
        Ok(self.norm3.forward(&(tgt + fed)?)?)
    }
}

/// Encoder and decoder stacks plus the final decoder norm.
#[derive(Debug, Clone)]
pub struct FusionTransformer {
    encoder: Vec<EncoderLayer>,
    decoder: Vec<DecoderLayer>,
    decoder_norm: LayerNorm,
}

impl FusionTransformer {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let e = cfg.embed_dims;
        let encoder = (0..cfg.encoder.num_layers)
            .map(|i| EncoderLayer::new(e, &cfg.encoder, vb.pp(format!("encoder.layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..cfg.decoder.num_layers)
            .map(|i| DecoderLayer::new(e, &cfg.decoder, vb.pp(format!("decoder.layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            encoder,
            decoder,
            decoder_norm: layer_norm(e, cfg.decoder.layer_norm_eps, vb.pp("decoder_norm"))?,
        })
    }

    pub fn num_encoder_layers(&self) -> usize {
        self.encoder.len()
    }

    pub fn num_decoder_layers(&self) -> usize {
        self.decoder.len()
    }

    /// `[B, S, E]` token sequence → `[B, S, E]` memory.
    pub fn encode(&self, sequence: &Tensor) -> Result<Tensor> {
        let mut memory = sequence.clone();
        for layer in &self.encoder {
            memory = layer.forward(&memory)?;
        }
        Ok(memory)
    }

    /// Run every decoder layer over the queries and normalise the result.
    pub fn decode(&self, queries: &Tensor, memory: &Tensor, query_pos: &Tensor) -> Result<Tensor> {
        if queries.dims() != query_pos.dims() {
            return Err(FsdError::shape(
                "decoder",
                format!(
                    "queries {:?} and positional encodings {:?} differ",
                    queries.dims(),
                    query_pos.dims()
                ),
            ));
        }
        let mut out = queries.clone();
        for layer in &self.decoder {
            out = layer.forward(&out, memory, query_pos)?;
        }
        Ok(self.decoder_norm.forward(&out)?)
    }

    #[instrument(skip_all)]
    pub fn forward(&self, batch: &QueryBatch) -> Result<Tensor> {
        let memory = self.encode(&batch.encoder_sequence)?;
        let decoded = self.decode(&batch.decoder_queries, &memory, &batch.decoder_positions)?;
        debug!(memory = ?memory.dims(), decoded = ?decoded.dims(), "fusion transformer done");
        Ok(decoded)
    }
}
