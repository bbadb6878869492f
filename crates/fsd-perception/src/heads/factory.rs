//! Builds prediction heads from their tagged configuration.
//!
//! Each output slot (`object_density_head`, `junction_head`, …) names the
//! head kind it needs.  [`HeadFactory::build_all`] resolves every slot once
//! at construction; a head configured with the wrong kind for its slot is a
//! configuration error, never a runtime surprise.

use candle_nn::VarBuilder;
use fsd_types::config::{HeadConfig, HeadsConfig};
use fsd_types::{FsdError, Result};
use tracing::info;

use super::density::ObjectDensityHead;
use super::traffic_rule::TrafficRuleHead;
use super::waypoint::WaypointHead;

/// A constructed head of any kind.
#[derive(Debug, Clone)]
pub enum Head {
    ObjectDensity(ObjectDensityHead),
    TrafficRule(TrafficRuleHead),
    Waypoint(WaypointHead),
}

impl Head {
    pub fn kind(&self) -> &'static str {
        match self {
            Head::ObjectDensity(_) => "object_density",
            Head::TrafficRule(_) => "traffic_rule",
            Head::Waypoint(_) => "waypoint",
        }
    }

    fn into_object_density(self, slot: &str) -> Result<ObjectDensityHead> {
        match self {
            Head::ObjectDensity(h) => Ok(h),
            other => Err(other.mismatch(slot, "object_density")),
        }
    }

    fn into_traffic_rule(self, slot: &str) -> Result<TrafficRuleHead> {
        match self {
            Head::TrafficRule(h) => Ok(h),
            other => Err(other.mismatch(slot, "traffic_rule")),
        }
    }

    fn into_waypoint(self, slot: &str) -> Result<WaypointHead> {
        match self {
            Head::Waypoint(h) => Ok(h),
            other => Err(other.mismatch(slot, "waypoint")),
        }
    }

    fn mismatch(&self, slot: &str, expected: &str) -> FsdError {
        FsdError::config(format!(
            "{slot} must be a `{expected}` head, found `{}`",
            self.kind()
        ))
    }
}

/// The five heads wired to their output slots.
#[derive(Debug, Clone)]
pub struct HeadSet {
    pub object_density: ObjectDensityHead,
    pub junction: TrafficRuleHead,
    pub stop_sign: TrafficRuleHead,
    pub traffic_light: TrafficRuleHead,
    pub waypoints: WaypointHead,
}

pub struct HeadFactory;

impl HeadFactory {
    /// Build one head; parameters live under `vb`.
    pub fn build(slot: &str, cfg: &HeadConfig, vb: VarBuilder) -> Result<Head> {
        info!(slot, kind = cfg.kind(), "building head");
        Ok(match cfg {
            HeadConfig::ObjectDensity(c) => Head::ObjectDensity(ObjectDensityHead::new(c, vb)?),
            HeadConfig::TrafficRule(c) => Head::TrafficRule(TrafficRuleHead::new(c, vb)?),
            HeadConfig::Waypoint(c) => Head::Waypoint(WaypointHead::new(c, vb)?),
        })
    }

    /// Resolve every output slot, each under its own parameter prefix.
    pub fn build_all(cfg: &HeadsConfig, vb: VarBuilder) -> Result<HeadSet> {
        let build = |slot: &str, head: &HeadConfig| Self::build(slot, head, vb.pp(slot));
        Ok(HeadSet {
            object_density: build("object_density_head", &cfg.object_density_head)?
                .into_object_density("object_density_head")?,
            junction: build("junction_head", &cfg.junction_head)?.into_traffic_rule("junction_head")?,
            stop_sign: build("stop_sign_head", &cfg.stop_sign_head)?.into_traffic_rule("stop_sign_head")?,
            traffic_light: build("traffic_light_head", &cfg.traffic_light_head)?
                .into_traffic_rule("traffic_light_head")?,
            waypoints: build("waypoints_head", &cfg.waypoints_head)?.into_waypoint("waypoints_head")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use fsd_types::config::{TrafficRuleHeadConfig, WaypointHeadConfig};

    #[test]
    fn default_heads_resolve_to_their_slots() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let set = HeadFactory::build_all(&HeadsConfig::default(), vb).unwrap();
        assert_eq!(set.object_density.input_size(), 288);
        assert_eq!(set.waypoints.num_waypoints(), 10);

        let data = varmap.data().lock().unwrap();
        for name in [
            "object_density_head.mlp.0.weight",
            "junction_head.linear.weight",
            "stop_sign_head.linear.bias",
            "traffic_light_head.linear.weight",
            "waypoints_head.linear1.weight",
            "waypoints_head.linear2.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn slot_kind_mismatch_is_a_config_error() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = HeadsConfig {
            waypoints_head: HeadConfig::TrafficRule(TrafficRuleHeadConfig::default()),
            ..HeadsConfig::default()
        };
        let err = HeadFactory::build_all(&cfg, vb).unwrap_err();
        assert!(matches!(err, FsdError::Config(_)));
        assert!(err.to_string().contains("waypoints_head"));
    }

    #[test]
    fn single_build_reports_kind() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = HeadFactory::build("wp", &HeadConfig::Waypoint(WaypointHeadConfig::default()), vb).unwrap();
        assert_eq!(head.kind(), "waypoint");
    }
}
