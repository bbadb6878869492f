//! Two-way classifier over the traffic-rule slots (junction, stop sign,
//! traffic light).  Raw logits, no activation.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};
use fsd_types::config::{ClassificationLoss, TrafficRuleHeadConfig};
use fsd_types::Result;

use crate::losses::classification;

#[derive(Debug, Clone)]
pub struct TrafficRuleHead {
    input_size: usize,
    linear: Linear,
    loss: ClassificationLoss,
}

impl TrafficRuleHead {
    pub fn new(cfg: &TrafficRuleHeadConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            input_size: cfg.input_size,
            linear: linear(cfg.input_size, cfg.output_size, vb.pp("linear"))?,
            loss: cfg.loss,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// `[B, T, E]` → `[B, T, 2]` logits.
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        Ok(self.linear.forward(hidden_states)?)
    }

    /// `target`: `[B, T, 2]`.
    pub fn loss(&self, hidden_states: &Tensor, target: &Tensor) -> Result<Tensor> {
        let logits = self.forward(hidden_states)?;
        classification(&self.loss, &logits, target)
    }
}
