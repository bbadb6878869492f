//! Object density head: per-cell occupancy and box attributes.
//!
//! Each of the `D` density slots predicts 7 channels:
//! `0` occupancy, `1..=2` offset to the cell centre, `3..=4` box extent,
//! `5` heading, `6` velocity.

use candle_core::{D, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};
use fsd_types::config::{DensityHeadConfig, DensityLossWeights, RegressionLoss};
use fsd_types::{DENSITY_CHANNELS, FsdError, Result};

use crate::losses::masked_regression;

/// Target occupancy at or above which a cell counts as occupied.
pub const OCCUPANCY_THRESHOLD: f64 = 0.01;

/// `Linear → ReLU → Linear → Sigmoid`.
#[derive(Debug, Clone)]
pub struct ObjectDensityHead {
    input_size: usize,
    linear1: Linear,
    linear2: Linear,
    loss: ObjectDensityLoss,
}

impl ObjectDensityHead {
    pub fn new(cfg: &DensityHeadConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_size: cfg.input_size,
            linear1: linear(cfg.input_size, cfg.hidden_size, vb.pp("mlp.0"))?,
            linear2: linear(cfg.hidden_size, cfg.output_size, vb.pp("mlp.2"))?,
            loss: ObjectDensityLoss::new(cfg.loss, cfg.loss_weights),
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// `[B, D, input_size]` → `[B, D, 7]` in `[0, 1]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.linear1.forward(x)?.relu()?;
        Ok(candle_nn::ops::sigmoid(&self.linear2.forward(&h)?)?)
    }

    pub fn loss(&self, x: &Tensor, target: &Tensor) -> Result<DensityLossTerms> {
        let pred = self.forward(x)?;
        self.loss.compute(&pred, target)
    }
}

/// Breakdown of the density loss; `total` is the weighted combination.
#[derive(Debug, Clone)]
pub struct DensityLossTerms {
    /// Occupancy error over empty cells (target 0).
    pub loss_prob_0: Tensor,
    /// Occupancy error over occupied cells (target 1).
    pub loss_prob_1: Tensor,
    /// Offset, extent and heading error over occupied cells.
    pub loss_geom: Tensor,
    /// Velocity error over occupied cells.
    pub loss_vel: Tensor,
    pub total: Tensor,
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectDensityLoss {
    kernel: RegressionLoss,
    weights: DensityLossWeights,
}

impl ObjectDensityLoss {
    pub fn new(kernel: RegressionLoss, weights: DensityLossWeights) -> Self {
        Self { kernel, weights }
    }

    /// `pred`, `target`: `[B, D, 7]`.
    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Result<DensityLossTerms> {
        if pred.dims() != target.dims() || pred.dim(D::Minus1)? != DENSITY_CHANNELS {
            return Err(FsdError::shape(
                "object density loss",
                format!("pred {:?} vs target {:?}", pred.dims(), target.dims()),
            ));
        }
        let target = target.to_dtype(pred.dtype())?;

        let target_occ = target.narrow(D::Minus1, 0, 1)?;
        let occupied = target_occ.ge(OCCUPANCY_THRESHOLD)?.to_dtype(pred.dtype())?;
        let empty = occupied.affine(-1.0, 1.0)?;

        let pred_occ = pred.narrow(D::Minus1, 0, 1)?;
        let loss_prob_0 = masked_regression(&self.kernel, &pred_occ, &pred_occ.zeros_like()?, &empty)?;
        let loss_prob_1 = masked_regression(&self.kernel, &pred_occ, &pred_occ.ones_like()?, &occupied)?;

        let loss_geom = masked_regression(
            &self.kernel,
            &pred.narrow(D::Minus1, 1, 5)?,
            &target.narrow(D::Minus1, 1, 5)?,
            &occupied,
        )?;
        let loss_vel = masked_regression(
            &self.kernel,
            &pred.narrow(D::Minus1, 6, 1)?,
            &target.narrow(D::Minus1, 6, 1)?,
            &occupied,
        )?;

        let prob = ((&loss_prob_0 + &loss_prob_1)? * 0.5)?;
        let total = ((prob.affine(self.weights.prob, 0.0)? + loss_geom.affine(self.weights.geom, 0.0)?)?
            + loss_vel.affine(self.weights.vel, 0.0)?)?;

        Ok(DensityLossTerms {
            loss_prob_0,
            loss_prob_1,
            loss_geom,
            loss_vel,
            total,
        })
    }
}
