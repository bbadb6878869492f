//! Forward-call outputs: predictions and per-head losses.

use candle_core::Tensor;

use crate::Result;
use crate::config::LossWeights;

/// The five prediction tensors of one forward call.
#[derive(Debug, Clone)]
pub struct PredictionBundle {
    /// `[B, D, 7]`, every value in `[0, 1]`.
    pub object_density: Tensor,
    /// `[B, 2]` raw logits.
    pub junction: Tensor,
    /// `[B, 2]` raw logits.
    pub stop_sign: Tensor,
    /// `[B, 2]` raw logits.
    pub traffic_light: Tensor,
    /// `[B, W, 2]` cumulative ego waypoints.
    pub waypoints: Tensor,
}

impl PredictionBundle {
    pub fn batch_size(&self) -> usize {
        self.waypoints.dims()[0]
    }
}

/// One scalar loss per head.
///
/// The losses are deliberately kept apart; the training loop decides how to
/// combine them (see [`LossBundle::weighted_total`]).
#[derive(Debug, Clone)]
pub struct LossBundle {
    pub loss_object_density: Tensor,
    pub loss_junction: Tensor,
    pub loss_stop_sign: Tensor,
    pub loss_traffic_light: Tensor,
    pub loss_waypoints: Tensor,
}

impl LossBundle {
    /// Named view over the five losses, in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Tensor)> {
        [
            ("loss_object_density", &self.loss_object_density),
            ("loss_junction", &self.loss_junction),
            ("loss_stop_sign", &self.loss_stop_sign),
            ("loss_traffic_light", &self.loss_traffic_light),
            ("loss_waypoints", &self.loss_waypoints),
        ]
        .into_iter()
    }

    /// Weighted sum of the five losses; stays on the autograd graph.
    pub fn weighted_total(&self, weights: &LossWeights) -> Result<Tensor> {
        let terms = [
            (&self.loss_object_density, weights.object_density),
            (&self.loss_junction, weights.junction),
            (&self.loss_stop_sign, weights.stop_sign),
            (&self.loss_traffic_light, weights.traffic_light),
            (&self.loss_waypoints, weights.waypoints),
        ];
        let mut total = terms[0].0.affine(terms[0].1, 0.0)?;
        for (loss, w) in &terms[1..] {
            total = (total + loss.affine(*w, 0.0)?)?;
        }
        Ok(total)
    }

    /// Read every loss back as an `f32`, e.g. for logging.
    pub fn to_scalars(&self) -> Result<Vec<(&'static str, f32)>> {
        self.iter()
            .map(|(name, t)| Ok((name, t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)))
            .collect()
    }
}
