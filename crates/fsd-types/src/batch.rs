//! Per-call inputs and supervision targets.
//!
//! [`SensorInputs`] carries the backbone feature maps (one per camera view
//! plus the BEV map), [`BatchInputs`] adds the goal point and ego velocity,
//! and [`GroundTruthTargets`] stacks the per-sample labels delivered by the
//! dataset layer into batch tensors.

use candle_core::{D, DType, Tensor};

use crate::{FsdError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Backbone feature maps of one batch.
///
/// Camera views may have different spatial sizes (and, before the neck,
/// channel counts differ from the BEV map).  Sensor order is fixed: cameras
/// in view order, BEV last.
#[derive(Debug, Clone)]
pub struct SensorInputs {
    /// One `[B, C, H, W]` map per camera view.
    pub cameras: Vec<Tensor>,
    /// `[B, C, H, W]` bird's-eye-view point-cloud map.
    pub bev: Tensor,
}

impl SensorInputs {
    pub fn new(cameras: Vec<Tensor>, bev: Tensor) -> Result<Self> {
        let batch = bev.dims4().map_err(|_| {
            FsdError::shape("bev features", format!("expected [B, C, H, W], got {:?}", bev.dims()))
        })?.0;
        for (idx, cam) in cameras.iter().enumerate() {
            let (b, ..) = cam.dims4().map_err(|_| {
                FsdError::shape(
                    format!("camera view {idx}"),
                    format!("expected [B, C, H, W], got {:?}", cam.dims()),
                )
            })?;
            if b != batch {
                return Err(FsdError::shape(
                    format!("camera view {idx}"),
                    format!("batch {b} differs from bev batch {batch}"),
                ));
            }
        }
        Ok(Self { cameras, bev })
    }

    /// Split a stacked `[B, N, C, H, W]` camera tensor into `N` views.
    pub fn from_stacked_views(views: &Tensor, bev: Tensor) -> Result<Self> {
        let (_, n, ..) = views.dims5().map_err(|_| {
            FsdError::shape(
                "stacked camera views",
                format!("expected [B, N, C, H, W], got {:?}", views.dims()),
            )
        })?;
        let cameras = (0..n)
            .map(|i| views.narrow(1, i, 1)?.squeeze(1))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Self::new(cameras, bev)
    }

    /// Camera views plus the BEV map.
    pub fn num_sensors(&self) -> usize {
        self.cameras.len() + 1
    }

    pub fn batch_size(&self) -> usize {
        self.bev.dims()[0]
    }
}

/// Everything a forward call consumes besides the learned parameters.
#[derive(Debug, Clone)]
pub struct BatchInputs {
    pub sensors: SensorInputs,
    /// `[B, 2]` goal point from the global route planner.
    pub goal_points: Tensor,
    /// `[B, 1]` ego speed.
    pub ego_velocity: Tensor,
}

impl BatchInputs {
    /// Bundle sensor features with the goal and ego speed.
    ///
    /// `ego_velocity` may be `[B]` or `[B, 1]`; it is stored as `[B, 1]`.
    pub fn new(sensors: SensorInputs, goal_points: Tensor, ego_velocity: Tensor) -> Result<Self> {
        let batch = sensors.batch_size();
        match goal_points.dims() {
            [b, 2] if *b == batch => {}
            dims => {
                return Err(FsdError::shape(
                    "goal_points",
                    format!("expected [{batch}, 2], got {dims:?}"),
                ));
            }
        }
        let ego_dims = ego_velocity.dims().to_vec();
        let ego_velocity = match ego_dims.as_slice() {
            [b] if *b == batch => ego_velocity.unsqueeze(1)?,
            [b, 1] if *b == batch => ego_velocity,
            dims => {
                return Err(FsdError::shape(
                    "ego_velocity",
                    format!("expected [{batch}] or [{batch}, 1], got {dims:?}"),
                ));
            }
        };
        Ok(Self {
            sensors,
            goal_points,
            ego_velocity,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.sensors.batch_size()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Targets
// ─────────────────────────────────────────────────────────────────────────────

/// Labels of a single sample as produced by the dataset layer.
#[derive(Debug, Clone)]
pub struct SampleTargets {
    /// `[H, W, 7]` density grid.
    pub density: Tensor,
    /// Two-channel label, `[2]` (or any shape with a trailing 2).
    pub is_at_junction: Tensor,
    pub affected_by_lights: Tensor,
    pub affected_by_stop_sign: Tensor,
    /// `[W + 1, K]` ego trajectory with `K ≥ 2`; row 0 is the current pose.
    pub trajectory: Tensor,
    /// `[W + 1]` per-step validity of `trajectory`.
    pub trajectory_mask: Option<Tensor>,
}

/// Batched supervision aligned with the model outputs.
#[derive(Debug, Clone)]
pub struct GroundTruthTargets {
    /// `[B, D, 7]`
    pub density: Tensor,
    /// `[B, T, 2]`
    pub junction: Tensor,
    /// `[B, T, 2]`
    pub stop_sign: Tensor,
    /// `[B, T, 2]`
    pub traffic_light: Tensor,
    /// `[B, W, 2]`
    pub waypoints: Tensor,
    /// `[B, W]` validity of each future step.
    pub waypoint_mask: Option<Tensor>,
}

impl GroundTruthTargets {
    /// Stack per-sample labels into batch tensors.
    ///
    /// The density grid is flattened row-major to `[H·W, 7]`, every rule
    /// label is reshaped to `[…, 2]`, and the first (current) trajectory step
    /// is dropped from both the waypoints and their mask.
    pub fn from_samples(samples: &[SampleTargets]) -> Result<Self> {
        if samples.is_empty() {
            return Err(FsdError::MissingInput("no ground-truth samples".to_string()));
        }
        if samples.iter().any(|s| s.trajectory_mask.is_some())
            && samples.iter().any(|s| s.trajectory_mask.is_none())
        {
            return Err(FsdError::MissingInput(
                "trajectory_mask must be present for every sample or for none".to_string(),
            ));
        }

        let density = stack(samples.iter().map(|s| &s.density))?;
        let (b, h, w, c) = density.dims4().map_err(|_| {
            FsdError::shape("gt density", format!("expected [H, W, C] per sample, got {:?}", density.dims()))
        })?;
        let density = density.reshape((b, h * w, c))?;

        let junction = pairs(stack(samples.iter().map(|s| &s.is_at_junction))?)?;
        let traffic_light = pairs(stack(samples.iter().map(|s| &s.affected_by_lights))?)?;
        let stop_sign = pairs(stack(samples.iter().map(|s| &s.affected_by_stop_sign))?)?;

        let trajectory = stack(samples.iter().map(|s| &s.trajectory))?;
        let (_, steps, coords) = trajectory.dims3().map_err(|_| {
            FsdError::shape("gt trajectory", format!("expected [W + 1, K] per sample, got {:?}", trajectory.dims()))
        })?;
        if steps < 2 || coords < 2 {
            return Err(FsdError::shape(
                "gt trajectory",
                format!("need at least 2 steps and 2 coordinates, got [{steps}, {coords}]"),
            ));
        }
        let waypoints = trajectory.narrow(D::Minus1, 0, 2)?.narrow(1, 1, steps - 1)?;

        let waypoint_mask = match samples[0].trajectory_mask {
            Some(_) => {
                let masks = stack(samples.iter().filter_map(|s| s.trajectory_mask.as_ref()))?;
                let mask_steps = masks.dims().get(1).copied().unwrap_or(0);
                if masks.rank() != 2 || mask_steps != steps {
                    return Err(FsdError::shape(
                        "gt trajectory mask",
                        format!("expected [{steps}] per sample, got {:?}", masks.dims()),
                    ));
                }
                Some(masks.narrow(1, 1, steps - 1)?.to_dtype(DType::F32)?)
            }
            None => None,
        };

        Ok(Self {
            density,
            junction,
            stop_sign,
            traffic_light,
            waypoints,
            waypoint_mask,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.density.dims()[0]
    }
}

fn stack<'a>(tensors: impl Iterator<Item = &'a Tensor>) -> Result<Tensor> {
    let tensors: Vec<&Tensor> = tensors.collect();
    Ok(Tensor::stack(&tensors, 0)?)
}

/// Reshape `[B, …]` to `[B, N, 2]`.
fn pairs(t: Tensor) -> Result<Tensor> {
    let b = t.dims()[0];
    let per_sample = t.elem_count() / b.max(1);
    if per_sample == 0 || per_sample % 2 != 0 {
        return Err(FsdError::shape(
            "gt traffic-rule label",
            format!("expected a two-channel label, got {:?}", t.dims()),
        ));
    }
    Ok(t.reshape((b, per_sample / 2, 2))?)
}
