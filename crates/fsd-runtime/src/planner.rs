//! [`Planner`] – owns the parameters and the model, and turns batched
//! predictions into per-sample [`EgoPlan`]s.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use fsd_perception::{ForwardMode, InterFuser, ModelOutput};
use fsd_types::config::load_or_default;
use fsd_types::{
    BatchInputs, DENSITY_CHANNELS, FsdConfig, FsdError, GroundTruthTargets, LossBundle,
    PredictionBundle, QueryLayout, Result,
};
use tracing::{debug, info, instrument};

/// One sample's density grid, `side × side` cells of 7 channels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGrid {
    pub side: usize,
    pub values: Vec<[f32; DENSITY_CHANNELS]>,
}

impl DensityGrid {
    pub fn cell(&self, row: usize, col: usize) -> Option<&[f32; DENSITY_CHANNELS]> {
        if row >= self.side || col >= self.side {
            return None;
        }
        self.values.get(row * self.side + col)
    }

    /// `(row, col, cell)` for every cell whose occupancy reaches `threshold`.
    /// Values past `side × side` are not part of the grid and are skipped.
    pub fn occupied(&self, threshold: f32) -> impl Iterator<Item = (usize, usize, &[f32; DENSITY_CHANNELS])> {
        let side = self.side;
        self.values
            .iter()
            .take(side * side)
            .enumerate()
            .filter(move |(_, cell)| cell[0] >= threshold)
            .map(move |(i, cell)| (i / side, i % side, cell))
    }
}

/// Planner output for one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct EgoPlan {
    /// Future ego positions, one per waypoint step.
    pub trajectory: Vec<[f32; 2]>,
    /// Raw two-way logits, one pair per traffic-rule query.
    pub traffic_light: Vec<[f32; 2]>,
    pub stop_sign: Vec<[f32; 2]>,
    pub at_junction: Vec<[f32; 2]>,
    pub density: DensityGrid,
}

pub struct Planner {
    config: FsdConfig,
    device: Device,
    varmap: VarMap,
    model: InterFuser,
}

impl Planner {
    /// Build the model on `device` and load `config.weights_path` when set.
    pub fn new(config: FsdConfig, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = InterFuser::new(&config.model, vb)?;
        let mut planner = Self {
            config,
            device,
            varmap,
            model,
        };
        if let Some(path) = planner.config.weights_path.clone() {
            planner.load_weights(&path)?;
        }
        info!(
            parameters = planner.varmap.all_vars().len(),
            "planner ready"
        );
        Ok(planner)
    }

    /// Read the TOML config at `path` (defaults when the file is absent) and
    /// build the planner from it.
    pub fn from_config_file(path: &Path, device: Device) -> Result<Self> {
        let config = load_or_default(path)?;
        debug!(path = %path.display(), "planner config resolved");
        Self::new(config, device)
    }

    pub fn config(&self) -> &FsdConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store, e.g. for an external optimiser.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn model(&self) -> &InterFuser {
        &self.model
    }

    /// Overwrite every parameter from a safetensors file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(FsdError::MissingInput(format!(
                "weights file {} does not exist",
                path.display()
            )));
        }
        self.varmap.load(path)?;
        info!(path = %path.display(), "weights loaded");
        Ok(())
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        self.varmap.save(path)?;
        info!(path = %path.display(), "weights saved");
        Ok(())
    }

    pub fn predict(&self, inputs: &BatchInputs) -> Result<PredictionBundle> {
        match self.model.forward(inputs, None, ForwardMode::Predict)? {
            ModelOutput::Predictions(p) => Ok(p),
            _ => Err(FsdError::shape("planner", "model returned a non-prediction output")),
        }
    }

    /// Predict and split the batch into per-sample plans.
    #[instrument(skip_all, fields(batch = inputs.batch_size()))]
    pub fn plan(&self, inputs: &BatchInputs) -> Result<Vec<EgoPlan>> {
        let predictions = self.predict(inputs)?;
        let layout = self.model.layout();
        let plans = (0..predictions.batch_size())
            .map(|i| ego_plan(&predictions, i, layout))
            .collect::<Result<Vec<_>>>()?;
        debug!(plans = plans.len(), "plans assembled");
        Ok(plans)
    }

    pub fn losses(&self, inputs: &BatchInputs, targets: &GroundTruthTargets) -> Result<LossBundle> {
        match self.model.forward(inputs, Some(targets), ForwardMode::Loss)? {
            ModelOutput::Losses(l) => Ok(l),
            _ => Err(FsdError::shape("planner", "model returned a non-loss output")),
        }
    }

    /// Losses combined with `config.loss_weights`; differentiable through
    /// the `VarMap` parameters.
    pub fn training_objective(&self, inputs: &BatchInputs, targets: &GroundTruthTargets) -> Result<Tensor> {
        let losses = self.losses(inputs, targets)?;
        for (name, value) in losses.to_scalars()? {
            debug!(loss = name, value, "head loss");
        }
        losses.weighted_total(&self.config.loss_weights)
    }
}

fn ego_plan(p: &PredictionBundle, i: usize, layout: &QueryLayout) -> Result<EgoPlan> {
    let side = layout.grid_side();
    let row = |t: &Tensor| -> Result<Tensor> { Ok(t.get(i)?.to_dtype(DType::F32)?) };
    // `[T·2]` per sample, query-major.
    let rule = |t: &Tensor| -> Result<Vec<[f32; 2]>> {
        let v = row(t)?.to_vec1::<f32>()?;
        if v.len() != 2 * layout.num_traffic_rule() {
            return Err(FsdError::shape(
                "traffic-rule logits",
                format!("expected {} values, got {}", 2 * layout.num_traffic_rule(), v.len()),
            ));
        }
        v.chunks_exact(2).map(pair).collect()
    };

    let trajectory = row(&p.waypoints)?
        .to_vec2::<f32>()?
        .into_iter()
        .map(|v| pair(&v))
        .collect::<Result<Vec<_>>>()?;

    let values = row(&p.object_density)?
        .to_vec2::<f32>()?
        .into_iter()
        .map(|v| {
            <[f32; DENSITY_CHANNELS]>::try_from(v.as_slice()).map_err(|_| {
                FsdError::shape("density cell", format!("expected {DENSITY_CHANNELS} channels, got {}", v.len()))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != side * side {
        return Err(FsdError::shape(
            "density grid",
            format!("{} cells do not form a {side}×{side} grid", values.len()),
        ));
    }

    Ok(EgoPlan {
        trajectory,
        traffic_light: rule(&p.traffic_light)?,
        stop_sign: rule(&p.stop_sign)?,
        at_junction: rule(&p.junction)?,
        density: DensityGrid { side, values },
    })
}

fn pair(v: &[f32]) -> Result<[f32; 2]> {
    <[f32; 2]>::try_from(v)
        .map_err(|_| FsdError::shape("prediction", format!("expected 2 values, got {}", v.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsd_types::SensorInputs;
    use fsd_types::config::{HeadConfig, ModelConfig, NeckConfig};

    /// 4 density cells (2×2), 1 rule slot, 3 waypoints, E = 8.
    fn small_config() -> FsdConfig {
        let mut model = ModelConfig::default();
        model.embed_dims = 8;
        model.num_sensors = 2;
        model.positional_encoding.num_feats = 4;
        model.num_queries = 8;
        model.img_neck = Some(NeckConfig {
            in_channels: 3,
            out_channels: 8,
        });
        model.pts_neck = None;
        for stack in [&mut model.encoder, &mut model.decoder] {
            stack.num_layers = 1;
            stack.num_heads = 2;
            stack.feedforward_channels = 16;
        }
        let heads = &mut model.heads;
        heads.num_object_density_queries = 4;
        heads.num_waypoints_queries = 3;
        if let HeadConfig::ObjectDensity(d) = &mut heads.object_density_head {
            d.input_size = 8 + fsd_types::EGO_VELOCITY_CHANNELS;
        }
        for slot in [&mut heads.junction_head, &mut heads.stop_sign_head, &mut heads.traffic_light_head] {
            if let HeadConfig::TrafficRule(t) = slot {
                t.input_size = 8;
            }
        }
        if let HeadConfig::Waypoint(w) = &mut heads.waypoints_head {
            w.num_waypoints = 3;
            w.input_size = 8;
            w.waypoints_weights = Some(vec![0.5, 0.3, 0.2]);
        }
        FsdConfig {
            model,
            ..FsdConfig::default()
        }
    }

    fn inputs(b: usize) -> BatchInputs {
        let cam = Tensor::randn(0f32, 1.0, (b, 3, 2, 2), &Device::Cpu).unwrap();
        let bev = Tensor::randn(0f32, 1.0, (b, 8, 3, 3), &Device::Cpu).unwrap();
        BatchInputs::new(
            SensorInputs::new(vec![cam], bev).unwrap(),
            Tensor::zeros((b, 2), DType::F32, &Device::Cpu).unwrap(),
            Tensor::ones((b, 1), DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    fn targets(b: usize) -> GroundTruthTargets {
        let label = Tensor::zeros((b, 1, 2), DType::F32, &Device::Cpu).unwrap();
        GroundTruthTargets {
            density: Tensor::zeros((b, 4, 7), DType::F32, &Device::Cpu).unwrap(),
            junction: label.clone(),
            stop_sign: label.clone(),
            traffic_light: label,
            waypoints: Tensor::zeros((b, 3, 2), DType::F32, &Device::Cpu).unwrap(),
            waypoint_mask: Some(Tensor::ones((b, 3), DType::F32, &Device::Cpu).unwrap()),
        }
    }

    #[test]
    fn plan_splits_batch_into_samples() {
        let planner = Planner::new(small_config(), Device::Cpu).unwrap();
        let plans = planner.plan(&inputs(2)).unwrap();
        assert_eq!(plans.len(), 2);
        for plan in &plans {
            assert_eq!(plan.trajectory.len(), 3);
            assert_eq!(plan.density.side, 2);
            assert_eq!(plan.density.values.len(), 4);
            assert!(plan.density.cell(1, 1).is_some());
            assert!(plan.density.cell(2, 0).is_none());
            assert_eq!(plan.traffic_light.len(), 1);
        }
    }

    #[test]
    fn every_traffic_rule_query_gets_a_logit_pair() {
        let mut cfg = small_config();
        cfg.model.num_queries = 10;
        cfg.model.heads.num_traffic_rule_queries = 3;
        let planner = Planner::new(cfg, Device::Cpu).unwrap();
        let plans = planner.plan(&inputs(2)).unwrap();
        for plan in &plans {
            assert_eq!(plan.at_junction.len(), 3);
            assert_eq!(plan.stop_sign.len(), 3);
            assert_eq!(plan.traffic_light.len(), 3);
        }
    }

    #[test]
    fn empty_grid_reports_no_occupied_cells() {
        let grid = DensityGrid {
            side: 0,
            values: vec![[1f32; DENSITY_CHANNELS]; 3],
        };
        assert_eq!(grid.occupied(0.5).count(), 0);
        assert!(grid.cell(0, 0).is_none());
    }

    #[test]
    fn planner_builds_from_config_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("fsd.toml");
        // An absent neck is not representable in TOML; spell out the BEV one.
        let mut cfg = small_config();
        cfg.model.pts_neck = Some(NeckConfig {
            in_channels: 8,
            out_channels: 8,
        });
        fsd_types::config::save_to(&cfg, &path).unwrap();
        let planner = Planner::from_config_file(&path, Device::Cpu).unwrap();
        assert_eq!(planner.config().model, cfg.model);
        assert_eq!(planner.model().layout().num_traffic_rule(), 1);
    }

    #[test]
    fn density_grid_lists_occupied_cells() {
        let mut values = vec![[0f32; DENSITY_CHANNELS]; 4];
        values[3][0] = 0.9;
        let grid = DensityGrid { side: 2, values };
        let occupied: Vec<_> = grid.occupied(0.5).map(|(r, c, _)| (r, c)).collect();
        assert_eq!(occupied, vec![(1, 1)]);
    }

    #[test]
    fn training_objective_is_weighted_sum() {
        let mut cfg = small_config();
        cfg.loss_weights.waypoints = 0.0;
        let planner = Planner::new(cfg, Device::Cpu).unwrap();
        let (x, y) = (inputs(1), targets(1));
        let losses = planner.losses(&x, &y).unwrap().to_scalars().unwrap();
        let expected: f32 = losses
            .iter()
            .filter(|(name, _)| *name != "loss_waypoints")
            .map(|(_, v)| v)
            .sum();
        let total = planner.training_objective(&x, &y).unwrap().to_scalar::<f32>().unwrap();
        assert!((total - expected).abs() < 1e-4, "{total} vs {expected}");
    }

    #[test]
    fn weights_roundtrip_through_safetensors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("ckpt").join("fsd.safetensors");

        let source = Planner::new(small_config(), Device::Cpu).unwrap();
        source.save_weights(&path).unwrap();

        let mut cfg = small_config();
        cfg.weights_path = Some(path.clone());
        let restored = Planner::new(cfg, Device::Cpu).unwrap();

        let x = inputs(1);
        let a = source.predict(&x).unwrap().waypoints;
        let b = restored.predict(&x).unwrap().waypoints;
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn missing_weights_file_is_reported() {
        let mut cfg = small_config();
        cfg.weights_path = Some("/nonexistent/fsd.safetensors".into());
        let err = Planner::new(cfg, Device::Cpu).err().expect("missing file");
        assert!(matches!(err, FsdError::MissingInput(_)));
    }
}
