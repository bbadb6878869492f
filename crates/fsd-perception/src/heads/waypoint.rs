//! Recurrent waypoint head.
//!
//! The goal point is lifted to the GRU width and used as the initial hidden
//! state of every GRU layer.  The GRU runs over the waypoint decoder slots,
//! each step emits a 2-D displacement, and the cumulative sum of the
//! displacements gives the ego waypoints.

use candle_core::{D, Tensor};
use candle_nn::rnn::{GRU, GRUConfig, GRUState, RNN, gru};
use candle_nn::{Linear, Module, VarBuilder, linear};
use fsd_types::config::{MaskedSmoothL1Config, WaypointHeadConfig};
use fsd_types::{FsdError, Result};
use tracing::debug;

use crate::losses::masked_smooth_l1;

#[derive(Debug, Clone)]
pub struct WaypointHead {
    num_waypoints: usize,
    input_size: usize,
    linear1: Linear,
    layers: Vec<GRU>,
    linear2: Linear,
    loss: MaskedSmoothL1Config,
    /// `[1, W, 1]`
    waypoints_weights: Option<Tensor>,
}

impl WaypointHead {
    pub fn new(cfg: &WaypointHeadConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.num_layers == 0 {
            return Err(FsdError::config("waypoint head needs at least one GRU layer"));
        }
        let waypoints_weights = match &cfg.waypoints_weights {
            Some(w) if w.len() != cfg.num_waypoints => {
                return Err(FsdError::config(format!(
                    "{} waypoint weights for {} waypoints",
                    w.len(),
                    cfg.num_waypoints
                )));
            }
            Some(w) => Some(
                Tensor::from_vec(w.clone(), (1, cfg.num_waypoints, 1), vb.device())?
                    .to_dtype(vb.dtype())?,
            ),
            None => None,
        };

        let layers = (0..cfg.num_layers)
            .map(|l| {
                let input = if l == 0 { cfg.input_size } else { cfg.hidden_size };
                gru_layer(l, input, cfg.hidden_size, &vb)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            num_waypoints: cfg.num_waypoints,
            input_size: cfg.input_size,
            linear1: linear(2, cfg.hidden_size, vb.pp("linear1"))?,
            layers,
            linear2: linear(cfg.hidden_size, 2, vb.pp("linear2"))?,
            loss: cfg.loss,
            waypoints_weights,
        })
    }

    pub fn num_waypoints(&self) -> usize {
        self.num_waypoints
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// `hidden_states [B, W, E]`, `goal_points [B, 2]` → `[B, W, 2]`.
    pub fn forward(&self, hidden_states: &Tensor, goal_points: &Tensor) -> Result<Tensor> {
        let (b, steps, _) = hidden_states.dims3().map_err(|_| {
            FsdError::shape(
                "waypoint head",
                format!("hidden states must be [B, W, E], got {:?}", hidden_states.dims()),
            )
        })?;
        if steps != self.num_waypoints {
            return Err(FsdError::shape(
                "waypoint head",
                format!(
                    "number of waypoints {steps} must be equal to the number of waypoints {}",
                    self.num_waypoints
                ),
            ));
        }
        match goal_points.dims() {
            [gb, 2] if *gb == b => {}
            dims => {
                return Err(FsdError::shape(
                    "waypoint head",
                    format!("goal points must be [{b}, 2], got {dims:?}"),
                ));
            }
        }

        let init = self.linear1.forward(goal_points)?;
        let mut x = hidden_states.clone();
        for layer in &self.layers {
            let states = layer.seq_init(&x, &GRUState { h: init.clone() })?;
            // `[B, W, hidden]`; the GRU's own `states_to_tensor` concatenates steps.
            let steps = states.into_iter().map(|s| s.h).collect::<Vec<_>>();
            x = Tensor::stack(&steps, 1)?;
        }
        let displacement = self.linear2.forward(&x)?;
        debug!(shape = ?displacement.dims(), "waypoint displacements");
        Ok(displacement.cumsum(1)?)
    }

    /// `target [B, W, 2]`; `mask` is `[B, W]` or `[B, W, 2]` (1 = supervised).
    pub fn loss(
        &self,
        hidden_states: &Tensor,
        goal_points: &Tensor,
        target: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let pred = self.forward(hidden_states, goal_points)?;
        let target = target.to_dtype(pred.dtype())?;
        let mask = match mask {
            None => None,
            Some(m) if m.rank() == 2 => Some(m.unsqueeze(D::Minus1)?),
            Some(m) if m.rank() == 3 && m.dim(D::Minus1)? == 2 => Some(m.clone()),
            Some(m) => {
                return Err(FsdError::shape(
                    "waypoint mask",
                    format!("expected [B, W] or [B, W, 2], got {:?}", m.dims()),
                ));
            }
        };
        masked_smooth_l1(
            &self.loss,
            &pred,
            &target,
            self.waypoints_weights.as_ref(),
            mask.as_ref(),
        )
    }
}

/// One layer of the GRU stack, stored under the multi-layer names
/// `gru.weight_ih_l{l}`, `gru.bias_hh_l{l}`, ...
fn gru_layer(l: usize, input: usize, hidden: usize, vb: &VarBuilder) -> candle_core::Result<GRU> {
    let suffix = format!("_l{l}");
    let vb = vb
        .pp("gru")
        .rename_f(move |name: &str| name.replace("_l0", &suffix))
        .root();
    gru(input, hidden, GRUConfig::default(), vb)
}
