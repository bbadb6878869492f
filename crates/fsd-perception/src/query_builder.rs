//! Turns adapted sensor feature maps into the encoder token sequence and
//! builds the decoder's learned queries and positional encodings.
//!
//! Encoder sequence, per sensor in order (cameras by view, BEV last):
//!
//! ```text
//! dense[h·W + w] = feat[:, h, w] + sine_pe[:, h, w] + multi_view_encoding[i]
//! mean           = mean_hw(feat)                    + multi_view_mean_encoding[i]
//! ```
//!
//! Decoder positions are the sine encoding of a `√D × √D` grid (row-major)
//! for the density slots, followed by a learned table for the traffic-rule
//! and waypoint slots.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};
use fsd_types::config::ModelConfig;
use fsd_types::{FsdError, QueryLayout, Result};
use tracing::{debug, warn};

use crate::positional::SinePositionalEncoding;

/// Everything the transformer consumes for one batch.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    /// `[B, Σ(H_i·W_i + 1), E]`
    pub encoder_sequence: Tensor,
    /// `[B, num_queries, E]`
    pub decoder_queries: Tensor,
    /// `[B, num_queries, E]`
    pub decoder_positions: Tensor,
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    embed_dims: usize,
    num_sensors: usize,
    layout: QueryLayout,
    positional: SinePositionalEncoding,
    multi_view_encoding: Embedding,
    multi_view_mean_encoding: Embedding,
    query_embedding: Embedding,
    query_positional_encoding: Embedding,
}

impl QueryBuilder {
    pub fn new(cfg: &ModelConfig, layout: &QueryLayout, vb: VarBuilder) -> Result<Self> {
        let e = cfg.embed_dims;
        let table = |rows: usize, name: &str| -> Result<Embedding> {
            let weight = vb.pp(name).get_with_hints(
                (rows, e),
                "weight",
                Init::Uniform { lo: 0.0, up: 1.0 },
            )?;
            Ok(Embedding::new(weight, e))
        };
        Ok(Self {
            embed_dims: e,
            num_sensors: cfg.num_sensors,
            layout: layout.clone(),
            positional: SinePositionalEncoding::new(&cfg.positional_encoding),
            multi_view_encoding: table(cfg.num_sensors, "multi_view_encoding")?,
            multi_view_mean_encoding: table(cfg.num_sensors, "multi_view_mean_encoding")?,
            query_embedding: table(layout.num_queries(), "query_embedding")?,
            query_positional_encoding: table(
                layout.num_learned_positions(),
                "query_positional_encoding",
            )?,
        })
    }

    /// Build the encoder sequence and decoder inputs from `[B, E, H_i, W_i]`
    /// maps given in sensor order.
    pub fn build(&self, features: &[Tensor]) -> Result<QueryBatch> {
        let encoder_sequence = self.encoder_sequence(features)?;
        let (b, _, _) = encoder_sequence.dims3()?;
        let device = encoder_sequence.device();
        let dtype = encoder_sequence.dtype();
        Ok(QueryBatch {
            decoder_queries: self.decoder_queries(b)?,
            decoder_positions: self.decoder_positions(b, device, dtype)?,
            encoder_sequence,
        })
    }

    pub fn encoder_sequence(&self, features: &[Tensor]) -> Result<Tensor> {
        if features.is_empty() {
            return Err(FsdError::MissingInput("no sensor feature maps".to_string()));
        }
        if features.len() > self.num_sensors {
            return Err(FsdError::config(format!(
                "{} sensors supplied but num_sensors is {}",
                features.len(),
                self.num_sensors
            )));
        }
        if features.len() < self.num_sensors {
            warn!(
                supplied = features.len(),
                num_sensors = self.num_sensors,
                "fewer sensors than sensor encodings"
            );
        }

        let dense_table = self.multi_view_encoding.embeddings();
        let mean_table = self.multi_view_mean_encoding.embeddings();
        let mut tokens = Vec::with_capacity(2 * features.len());
        for (i, feat) in features.iter().enumerate() {
            let (b, c, h, w) = feat.dims4().map_err(|_| {
                FsdError::shape(format!("sensor {i}"), format!("expected [B, E, H, W], got {:?}", feat.dims()))
            })?;
            if c != self.embed_dims {
                return Err(FsdError::shape(
                    format!("sensor {i}"),
                    format!("{c} channels, expected embed_dims {}", self.embed_dims),
                ));
            }

            let pe = self
                .positional
                .encode(h, w, feat.device(), feat.dtype())?
                .unsqueeze(0)?;
            let dense_code = dense_table.get(i)?.reshape((1, c, 1, 1))?;
            let dense = feat
                .broadcast_add(&pe)?
                .broadcast_add(&dense_code)?
                .flatten_from(2)?
                .transpose(1, 2)?;

            let mean_code = mean_table.get(i)?.unsqueeze(0)?;
            let mean = feat
                .flatten_from(2)?
                .mean(2)?
                .broadcast_add(&mean_code)?
                .reshape((b, 1, c))?;

            tokens.push(dense);
            tokens.push(mean);
        }
        let sequence = Tensor::cat(&tokens, 1)?.contiguous()?;
        debug!(shape = ?sequence.dims(), "encoder sequence built");
        Ok(sequence)
    }

    /// The learned query table broadcast over the batch.
    pub fn decoder_queries(&self, batch: usize) -> Result<Tensor> {
        let table = self.query_embedding.embeddings();
        let (q, e) = table.dims2()?;
        Ok(table.unsqueeze(0)?.broadcast_as((batch, q, e))?.contiguous()?)
    }

    /// Sine grid encoding for the density slots, learned encodings for the rest.
    pub fn decoder_positions(&self, batch: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let side = self.layout.grid_side();
        let grid = self
            .positional
            .encode(side, side, device, dtype)?
            .reshape((self.embed_dims, side * side))?
            .t()?;
        let learned = self.query_positional_encoding.embeddings().to_dtype(dtype)?;
        let positions = Tensor::cat(&[&grid, &learned], 0)?;
        let (q, e) = positions.dims2()?;
        Ok(positions.unsqueeze(0)?.broadcast_as((batch, q, e))?.contiguous()?)
    }
}
