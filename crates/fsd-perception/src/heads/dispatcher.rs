//! Routes decoder slots to the heads.
//!
//! ```text
//! hidden [B, Q, E]
//!   ├─ density slots      ++ ego velocity × 32 → object density head
//!   ├─ traffic-rule slots                      → junction / stop sign / traffic light
//!   └─ waypoint slots     +  goal point        → waypoint head
//! ```

use candle_core::{D, Tensor};
use fsd_types::{
    EGO_VELOCITY_CHANNELS, FsdError, GroundTruthTargets, LossBundle, PredictionBundle, QueryLayout,
    Result,
};
use tracing::{debug, instrument};

use super::factory::HeadSet;

#[derive(Debug, Clone)]
pub struct HeadDispatcher {
    layout: QueryLayout,
    heads: HeadSet,
}

/// The three slot groups of one decoder output.
struct Slots {
    density: Tensor,
    traffic_rule: Tensor,
    waypoints: Tensor,
}

impl HeadDispatcher {
    /// Wire `heads` to `layout`, checking every head width against the
    /// embedding size and the waypoint count against the slot count.
    pub fn new(layout: QueryLayout, embed_dims: usize, heads: HeadSet) -> Result<Self> {
        let density_in = embed_dims + EGO_VELOCITY_CHANNELS;
        if heads.object_density.input_size() != density_in {
            return Err(FsdError::config(format!(
                "object_density_head input_size {} must equal {density_in}",
                heads.object_density.input_size()
            )));
        }
        for (slot, head) in [
            ("junction_head", &heads.junction),
            ("stop_sign_head", &heads.stop_sign),
            ("traffic_light_head", &heads.traffic_light),
        ] {
            if head.input_size() != embed_dims {
                return Err(FsdError::config(format!(
                    "{slot} input_size {} must equal embed_dims {embed_dims}",
                    head.input_size()
                )));
            }
        }
        if heads.waypoints.num_waypoints() != layout.num_waypoints() {
            return Err(FsdError::config(format!(
                "waypoints_head num_waypoints {} must be equal to num_waypoints_queries {}",
                heads.waypoints.num_waypoints(),
                layout.num_waypoints()
            )));
        }
        if heads.waypoints.input_size() != embed_dims {
            return Err(FsdError::config(format!(
                "waypoints_head input_size {} must equal embed_dims {embed_dims}",
                heads.waypoints.input_size()
            )));
        }
        Ok(Self { layout, heads })
    }

    pub fn layout(&self) -> &QueryLayout {
        &self.layout
    }

    pub fn heads(&self) -> &HeadSet {
        &self.heads
    }

    #[instrument(skip_all)]
    pub fn forward(&self, hidden: &Tensor, goal_points: &Tensor, ego_velocity: &Tensor) -> Result<PredictionBundle> {
        let slots = self.split(hidden, ego_velocity)?;
        // [B, T, 2] → [B, T·2]
        let rule = |logits: Tensor| -> Result<Tensor> { Ok(logits.flatten_from(1)?) };

        Ok(PredictionBundle {
            object_density: self.heads.object_density.forward(&slots.density)?,
            junction: rule(self.heads.junction.forward(&slots.traffic_rule)?)?,
            stop_sign: rule(self.heads.stop_sign.forward(&slots.traffic_rule)?)?,
            traffic_light: rule(self.heads.traffic_light.forward(&slots.traffic_rule)?)?,
            waypoints: self.heads.waypoints.forward(&slots.waypoints, goal_points)?,
        })
    }

    #[instrument(skip_all)]
    pub fn loss(
        &self,
        hidden: &Tensor,
        goal_points: &Tensor,
        ego_velocity: &Tensor,
        targets: &GroundTruthTargets,
    ) -> Result<LossBundle> {
        let b = hidden.dim(0)?;
        if targets.batch_size() != b {
            return Err(FsdError::shape(
                "ground truth",
                format!("batch {} differs from decoder batch {b}", targets.batch_size()),
            ));
        }
        let slots = self.split(hidden, ego_velocity)?;
        let density = self.heads.object_density.loss(&slots.density, &targets.density)?;
        debug!("object density loss terms computed");

        Ok(LossBundle {
            loss_object_density: density.total,
            loss_junction: self.heads.junction.loss(&slots.traffic_rule, &targets.junction)?,
            loss_stop_sign: self.heads.stop_sign.loss(&slots.traffic_rule, &targets.stop_sign)?,
            loss_traffic_light: self
                .heads
                .traffic_light
                .loss(&slots.traffic_rule, &targets.traffic_light)?,
            loss_waypoints: self.heads.waypoints.loss(
                &slots.waypoints,
                goal_points,
                &targets.waypoints,
                targets.waypoint_mask.as_ref(),
            )?,
        })
    }

    fn split(&self, hidden: &Tensor, ego_velocity: &Tensor) -> Result<Slots> {
        let (b, q, _) = hidden.dims3()?;
        if q != self.layout.num_queries() {
            return Err(FsdError::config(format!(
                "number of queries {q} must be equal to the number of queries {}",
                self.layout.num_queries()
            )));
        }
        let range = |r: std::ops::Range<usize>| hidden.narrow(1, r.start, r.len());

        let d = self.layout.num_density();
        let ego = ego_velocity
            .to_dtype(hidden.dtype())?
            .reshape((b, 1, 1))?
            .broadcast_as((b, d, EGO_VELOCITY_CHANNELS))?;
        let density = Tensor::cat(&[&range(self.layout.density())?, &ego], D::Minus1)?;

        Ok(Slots {
            density,
            traffic_rule: range(self.layout.traffic_rule())?,
            waypoints: range(self.layout.waypoints())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heads::factory::HeadFactory;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use fsd_types::config::{DensityHeadConfig, HeadConfig, HeadsConfig, TrafficRuleHeadConfig, WaypointHeadConfig};

    const E: usize = 8;

    fn heads_config() -> HeadsConfig {
        let traffic = HeadConfig::TrafficRule(TrafficRuleHeadConfig {
            input_size: E,
            ..TrafficRuleHeadConfig::default()
        });
        HeadsConfig {
            num_object_density_queries: 4,
            num_traffic_rule_queries: 1,
            num_waypoints_queries: 3,
            object_density_head: HeadConfig::ObjectDensity(DensityHeadConfig {
                input_size: E + EGO_VELOCITY_CHANNELS,
                hidden_size: 5,
                ..DensityHeadConfig::default()
            }),
            junction_head: traffic.clone(),
            stop_sign_head: traffic.clone(),
            traffic_light_head: traffic,
            waypoints_head: HeadConfig::Waypoint(WaypointHeadConfig {
                num_waypoints: 3,
                input_size: E,
                hidden_size: 4,
                waypoints_weights: None,
                ..WaypointHeadConfig::default()
            }),
        }
    }

    fn dispatcher(varmap: &VarMap) -> HeadDispatcher {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let heads = HeadFactory::build_all(&heads_config(), vb).unwrap();
        HeadDispatcher::new(QueryLayout::new(8, 4, 1, 3).unwrap(), E, heads).unwrap()
    }

    fn inputs(b: usize) -> (Tensor, Tensor, Tensor) {
        (
            Tensor::randn(0f32, 1.0, (b, 8, E), &Device::Cpu).unwrap(),
            Tensor::randn(0f32, 1.0, (b, 2), &Device::Cpu).unwrap(),
            Tensor::ones((b, 1), DType::F32, &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn predictions_have_documented_shapes() {
        let varmap = VarMap::new();
        let d = dispatcher(&varmap);
        let (hidden, goal, ego) = inputs(2);
        let out = d.forward(&hidden, &goal, &ego).unwrap();
        assert_eq!(out.object_density.dims(), &[2, 4, 7]);
        assert_eq!(out.junction.dims(), &[2, 2]);
        assert_eq!(out.stop_sign.dims(), &[2, 2]);
        assert_eq!(out.traffic_light.dims(), &[2, 2]);
        assert_eq!(out.waypoints.dims(), &[2, 3, 2]);
    }

    #[test]
    fn wrong_query_count_is_rejected() {
        let varmap = VarMap::new();
        let d = dispatcher(&varmap);
        let hidden = Tensor::zeros((1, 9, E), DType::F32, &Device::Cpu).unwrap();
        let (_, goal, ego) = inputs(1);
        let err = d.forward(&hidden, &goal, &ego).unwrap_err();
        assert!(matches!(err, FsdError::Config(_)));
    }

    #[test]
    fn waypoint_count_must_match_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let heads = HeadFactory::build_all(&heads_config(), vb).unwrap();
        let layout = QueryLayout::new(9, 4, 1, 4).unwrap();
        assert!(HeadDispatcher::new(layout, E, heads).is_err());
    }

    #[test]
    fn losses_are_finite_scalars() {
        let varmap = VarMap::new();
        let d = dispatcher(&varmap);
        let (hidden, goal, ego) = inputs(2);
        let pair = |v: [f32; 2]| Tensor::new(&[[v], [v]], &Device::Cpu).unwrap();
        let targets = GroundTruthTargets {
            density: Tensor::zeros((2, 4, 7), DType::F32, &Device::Cpu).unwrap(),
            junction: pair([1.0, 0.0]),
            stop_sign: pair([0.0, 1.0]),
            traffic_light: pair([1.0, 0.0]),
            waypoints: Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu).unwrap(),
            waypoint_mask: Some(Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap()),
        };
        let losses = d.loss(&hidden, &goal, &ego, &targets).unwrap();
        for (name, value) in losses.to_scalars().unwrap() {
            assert!(value.is_finite(), "{name} = {value}");
            assert!(value >= 0.0, "{name} = {value}");
        }
    }

    #[test]
    fn loss_batch_must_match() {
        let varmap = VarMap::new();
        let d = dispatcher(&varmap);
        let (hidden, goal, ego) = inputs(2);
        let targets = GroundTruthTargets {
            density: Tensor::zeros((1, 4, 7), DType::F32, &Device::Cpu).unwrap(),
            junction: Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap(),
            stop_sign: Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap(),
            traffic_light: Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap(),
            waypoints: Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu).unwrap(),
            waypoint_mask: None,
        };
        assert!(d.loss(&hidden, &goal, &ego, &targets).is_err());
    }
}
