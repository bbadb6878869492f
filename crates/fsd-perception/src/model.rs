//! [`InterFuser`] – the assembled fusion model.
//!
//! ```text
//! SensorInputs ─► necks ─► QueryBuilder ─► FusionTransformer ─► HeadDispatcher
//!                                                                ├─► PredictionBundle
//!                                                                └─► LossBundle
//! ```
//!
//! The configuration is validated before a single parameter is allocated,
//! so a structurally invalid model never touches the `VarMap`.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use fsd_types::config::ModelConfig;
use fsd_types::{
    BatchInputs, FsdError, GroundTruthTargets, LossBundle, PredictionBundle, QueryLayout, Result,
    SensorInputs,
};
use tracing::{debug, info, instrument};

use crate::adapter::{FeatureAdapter, build_adapter};
use crate::heads::{HeadDispatcher, HeadFactory};
use crate::query_builder::{QueryBatch, QueryBuilder};
use crate::transformer::FusionTransformer;

/// What a [`InterFuser::forward`] call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Raw normalised decoder output.
    Tensor,
    Predict,
    Loss,
}

#[derive(Debug, Clone)]
pub enum ModelOutput {
    /// `[B, num_queries, E]`
    Decoded(Tensor),
    Predictions(PredictionBundle),
    Losses(LossBundle),
}

pub struct InterFuser {
    layout: QueryLayout,
    img_neck: Box<dyn FeatureAdapter>,
    pts_neck: Box<dyn FeatureAdapter>,
    query_builder: QueryBuilder,
    transformer: FusionTransformer,
    dispatcher: HeadDispatcher,
}

impl InterFuser {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let layout = cfg.validate()?;
        let e = cfg.embed_dims;

        let img_neck = build_adapter("img_neck", cfg.img_neck.as_ref(), e, vb.pp("img_neck"))?;
        let pts_neck = build_adapter("pts_neck", cfg.pts_neck.as_ref(), e, vb.pp("pts_neck"))?;
        let query_builder = QueryBuilder::new(cfg, &layout, vb.clone())?;
        let transformer = FusionTransformer::new(cfg, vb.pp("transformer"))?;
        let heads = HeadFactory::build_all(&cfg.heads, vb.pp("heads"))?;
        let dispatcher = HeadDispatcher::new(layout.clone(), e, heads)?;

        info!(
            embed_dims = e,
            num_queries = layout.num_queries(),
            encoder_layers = transformer.num_encoder_layers(),
            decoder_layers = transformer.num_decoder_layers(),
            "fusion model constructed"
        );
        Ok(Self {
            layout,
            img_neck,
            pts_neck,
            query_builder,
            transformer,
            dispatcher,
        })
    }

    pub fn layout(&self) -> &QueryLayout {
        &self.layout
    }

    /// Project every sensor map to the embedding width, in sensor order.
    pub fn extract_features(&self, sensors: &SensorInputs) -> Result<Vec<Tensor>> {
        let mut features = sensors
            .cameras
            .iter()
            .map(|cam| self.img_neck.adapt(cam))
            .collect::<Result<Vec<_>>>()?;
        features.push(self.pts_neck.adapt(&sensors.bev)?);
        Ok(features)
    }

    pub fn build_queries(&self, sensors: &SensorInputs) -> Result<QueryBatch> {
        self.query_builder.build(&self.extract_features(sensors)?)
    }

    /// Encoder + decoder over one batch; `[B, num_queries, E]`.
    #[instrument(skip_all, fields(batch = inputs.batch_size()))]
    pub fn forward_transformer(&self, inputs: &BatchInputs) -> Result<Tensor> {
        let queries = self.build_queries(&inputs.sensors)?;
        let decoded = self.transformer.forward(&queries)?;
        debug!(shape = ?decoded.dims(), "decoded queries");
        Ok(decoded)
    }

    #[instrument(skip_all, fields(batch = inputs.batch_size()))]
    pub fn predict(&self, inputs: &BatchInputs) -> Result<PredictionBundle> {
        let decoded = self.forward_transformer(inputs)?;
        self.dispatcher
            .forward(&decoded, &inputs.goal_points, &inputs.ego_velocity)
    }

    #[instrument(skip_all, fields(batch = inputs.batch_size()))]
    pub fn loss(&self, inputs: &BatchInputs, targets: &GroundTruthTargets) -> Result<LossBundle> {
        let decoded = self.forward_transformer(inputs)?;
        self.dispatcher
            .loss(&decoded, &inputs.goal_points, &inputs.ego_velocity, targets)
    }

    pub fn forward(
        &self,
        inputs: &BatchInputs,
        targets: Option<&GroundTruthTargets>,
        mode: ForwardMode,
    ) -> Result<ModelOutput> {
        match mode {
            ForwardMode::Tensor => Ok(ModelOutput::Decoded(self.forward_transformer(inputs)?)),
            ForwardMode::Predict => Ok(ModelOutput::Predictions(self.predict(inputs)?)),
            ForwardMode::Loss => {
                let targets = targets.ok_or_else(|| {
                    FsdError::MissingInput("loss mode requires ground-truth targets".to_string())
                })?;
                Ok(ModelOutput::Losses(self.loss(inputs, targets)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use fsd_types::config::NeckConfig;

    const CAM_CHANNELS: usize = 16;
    const BEV_CHANNELS: usize = 8;

    /// Reference layout (411 = 400 + 1 + 10, E = 256) with shallow stacks.
    fn reference_config() -> ModelConfig {
        let mut cfg = ModelConfig::default();
        cfg.img_neck = Some(NeckConfig {
            in_channels: CAM_CHANNELS,
            out_channels: 256,
        });
        cfg.pts_neck = Some(NeckConfig {
            in_channels: BEV_CHANNELS,
            out_channels: 256,
        });
        for stack in [&mut cfg.encoder, &mut cfg.decoder] {
            stack.num_layers = 1;
            stack.feedforward_channels = 64;
        }
        cfg
    }

    fn batch(b: usize) -> BatchInputs {
        let cams = (0..4)
            .map(|_| Tensor::randn(0f32, 1.0, (b, CAM_CHANNELS, 2, 3), &Device::Cpu).unwrap())
            .collect();
        let bev = Tensor::randn(0f32, 1.0, (b, BEV_CHANNELS, 3, 3), &Device::Cpu).unwrap();
        let sensors = SensorInputs::new(cams, bev).unwrap();
        BatchInputs::new(
            sensors,
            Tensor::randn(0f32, 1.0, (b, 2), &Device::Cpu).unwrap(),
            Tensor::ones(b, DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap()
    }

    fn targets(b: usize) -> GroundTruthTargets {
        let rule = Tensor::new(&[[1f32, 0.0]], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .broadcast_as((b, 1, 2))
            .unwrap()
            .contiguous()
            .unwrap();
        GroundTruthTargets {
            density: Tensor::zeros((b, 400, 7), DType::F32, &Device::Cpu).unwrap(),
            junction: rule.clone(),
            stop_sign: rule.clone(),
            traffic_light: rule,
            waypoints: Tensor::randn(0f32, 1.0, (b, 10, 2), &Device::Cpu).unwrap(),
            waypoint_mask: None,
        }
    }

    #[test]
    fn end_to_end_reference_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = InterFuser::new(&reference_config(), vb).unwrap();
        let out = model.predict(&batch(2)).unwrap();

        assert_eq!(out.waypoints.dims(), &[2, 10, 2]);
        assert_eq!(out.object_density.dims(), &[2, 400, 7]);
        for logits in [&out.junction, &out.stop_sign, &out.traffic_light] {
            assert_eq!(logits.dims(), &[2, 2]);
        }
        let density = out.object_density.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(density.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn non_square_density_fails_before_allocation() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut cfg = reference_config();
        cfg.num_queries = 412;
        cfg.heads.num_object_density_queries = 401;
        let err = InterFuser::new(&cfg, vb).err().expect("invalid config");
        assert!(matches!(err, FsdError::Config(_)));
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn encoder_sequence_counts_every_sensor() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = InterFuser::new(&reference_config(), vb).unwrap();
        let inputs = batch(1);
        let queries = model.build_queries(&inputs.sensors).unwrap();
        // 4 cameras of 2×3, one 3×3 BEV map, plus one mean token per sensor.
        assert_eq!(queries.encoder_sequence.dims(), &[1, 4 * 6 + 9 + 5, 256]);

        let again = model.build_queries(&inputs.sensors).unwrap();
        let diff = (queries.encoder_sequence - again.encoder_sequence)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn forward_modes_select_output() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = InterFuser::new(&reference_config(), vb).unwrap();
        let inputs = batch(1);

        match model.forward(&inputs, None, ForwardMode::Tensor).unwrap() {
            ModelOutput::Decoded(t) => assert_eq!(t.dims(), &[1, 411, 256]),
            other => panic!("unexpected {other:?}"),
        }
        let err = model.forward(&inputs, None, ForwardMode::Loss).unwrap_err();
        assert!(matches!(err, FsdError::MissingInput(_)));

        match model.forward(&inputs, Some(&targets(1)), ForwardMode::Loss).unwrap() {
            ModelOutput::Losses(losses) => {
                for (name, value) in losses.to_scalars().unwrap() {
                    assert!(value.is_finite(), "{name} = {value}");
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn too_many_cameras_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut cfg = reference_config();
        cfg.num_sensors = 3;
        let model = InterFuser::new(&cfg, vb).unwrap();
        assert!(model.predict(&batch(1)).is_err());
    }
}
