//! Loss kernels.
//!
//! Every reduction over a selection goes through [`masked_mean`], which
//! divides by `max(count, 1)`: an empty selection contributes exactly 0
//! instead of NaN, without data-dependent branching.

use candle_core::{D, Tensor};
use fsd_types::config::{ClassificationLoss, MaskedSmoothL1Config, RegressionLoss};
use fsd_types::{FsdError, Result};

/// `|d| < β ? 0.5·d²/β : |d| - 0.5·β`, element-wise.  `β = 0` is plain L1.
pub fn smooth_l1(pred: &Tensor, target: &Tensor, beta: f64) -> Result<Tensor> {
    let diff = (pred - target)?.abs()?;
    if beta <= 0.0 {
        return Ok(diff);
    }
    let quadratic = (diff.sqr()? * (0.5 / beta))?;
    let linear = (&diff - 0.5 * beta)?;
    Ok(diff.lt(beta)?.where_cond(&quadratic, &linear)?)
}

/// Element-wise loss of the configured regression kernel, without the
/// kernel weight.
pub fn regression_elementwise(kind: &RegressionLoss, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    Ok(match kind {
        RegressionLoss::L1 { .. } => (pred - target)?.abs()?,
        RegressionLoss::SmoothL1 { beta, .. } => smooth_l1(pred, target, *beta)?,
        RegressionLoss::Mse { .. } => (pred - target)?.sqr()?,
    })
}

fn regression_weight(kind: &RegressionLoss) -> f64 {
    match kind {
        RegressionLoss::L1 { loss_weight }
        | RegressionLoss::SmoothL1 { loss_weight, .. }
        | RegressionLoss::Mse { loss_weight } => *loss_weight,
    }
}

/// `Σ(values · mask) / max(Σ mask, 1)` as a scalar tensor.
///
/// `mask` must broadcast to `values` and hold 0/1 in the values' dtype.
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = mask.broadcast_as(values.shape())?;
    let total = values.mul(&mask)?.sum_all()?;
    let count = mask.sum_all()?.maximum(1.0)?;
    Ok(total.div(&count)?)
}

/// Mean of the configured regression kernel over the elements selected by
/// `mask`, times the kernel weight.
pub fn masked_regression(
    kind: &RegressionLoss,
    pred: &Tensor,
    target: &Tensor,
    mask: &Tensor,
) -> Result<Tensor> {
    let values = regression_elementwise(kind, pred, target)?;
    Ok(masked_mean(&values, mask)?.affine(regression_weight(kind), 0.0)?)
}

/// Binary cross-entropy on raw logits with an independent sigmoid per
/// element, in the stable `max(x, 0) - x·t + ln(1 + e^{-|x|})` form.
pub fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = ((logits.relu()? - logits.mul(target)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// Cross-entropy between `softmax(logits)` over the last axis and a (soft)
/// target distribution, averaged over every leading position.
pub fn softmax_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    Ok(log_probs.mul(target)?.sum(D::Minus1)?.neg()?.mean_all()?)
}

/// Apply the configured classification kernel and its weight.
pub fn classification(kind: &ClassificationLoss, logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    if logits.dims() != target.dims() {
        return Err(FsdError::shape(
            "classification loss",
            format!("logits {:?} vs target {:?}", logits.dims(), target.dims()),
        ));
    }
    let target = target.to_dtype(logits.dtype())?;
    let (loss, weight) = match kind {
        ClassificationLoss::SigmoidBce { loss_weight } => (bce_with_logits(logits, &target)?, *loss_weight),
        ClassificationLoss::SoftmaxCrossEntropy { loss_weight } => {
            (softmax_cross_entropy(logits, &target)?, *loss_weight)
        }
    };
    Ok(loss.affine(weight, 0.0)?)
}

/// Smooth-L1 scaled by an optional per-element `weight`, restricted to
/// elements where `mask` is 1, summed and divided by the number of
/// included elements.
pub fn masked_smooth_l1(
    cfg: &MaskedSmoothL1Config,
    pred: &Tensor,
    target: &Tensor,
    weight: Option<&Tensor>,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    if pred.dims() != target.dims() {
        return Err(FsdError::shape(
            "masked smooth-l1",
            format!("pred {:?} vs target {:?}", pred.dims(), target.dims()),
        ));
    }
    let mut values = smooth_l1(pred, target, cfg.beta)?;
    if let Some(weight) = weight {
        values = values.broadcast_mul(weight)?;
    }
    let mask = match mask {
        Some(mask) => mask.to_dtype(pred.dtype())?,
        None => Tensor::ones_like(pred)?,
    };
    Ok(masked_mean(&values, &mask)?.affine(cfg.loss_weight, 0.0)?)
}
