//! Configuration surface – reads/writes a TOML model description.
//!
//! Every field carries a default that reproduces the reference driving
//! configuration (4 camera views + 1 BEV map, 256-wide embeddings, 411
//! decoder queries split 400 / 1 / 10), so an empty file is a valid config.
//!
//! Optional components (the image and point-cloud necks) are plain
//! `Option` fields resolved once when the model is built.  Heads are
//! described by the tagged [`HeadConfig`] sum type and checked against the
//! slot they are wired to by [`ModelConfig::validate`].

use std::f64::consts::TAU;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layout::QueryLayout;
use crate::{
    DENSITY_CHANNELS, EGO_VELOCITY_CHANNELS, FsdError, Result, TRAFFIC_RULE_CHANNELS,
};

/// Per-step waypoint loss weights of the 10-step reference horizon.
/// Monotonically decreasing, summing to ≈ 1.
pub const DEFAULT_WAYPOINT_WEIGHTS: [f32; 10] = [
    0.140_744_1,
    0.133_521_58,
    0.125_885_35,
    0.117_754_96,
    0.109_019_91,
    0.099_521_11,
    0.089_014_39,
    0.077_088_72,
    0.062_942_68,
    0.044_507_19,
];

// ─────────────────────────────────────────────────────────────────────────────
// Top level
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted planner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsdConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Relative weights used by [`LossBundle::weighted_total`][crate::LossBundle::weighted_total].
    #[serde(default)]
    pub loss_weights: LossWeights,

    /// Safetensors checkpoint loaded when the planner is constructed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_path: Option<PathBuf>,
}

/// Structure of the fusion transformer and its heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_num_queries")]
    pub num_queries: usize,

    #[serde(default = "default_embed_dims")]
    pub embed_dims: usize,

    /// Rows of the dense and mean sensor-identity tables (camera views + BEV).
    #[serde(default = "default_num_sensors")]
    pub num_sensors: usize,

    /// Projection applied to every camera view; `None` means the backbone
    /// already emits `embed_dims` channels.
    #[serde(default = "default_img_neck")]
    pub img_neck: Option<NeckConfig>,

    /// Projection applied to the BEV map.
    #[serde(default = "default_pts_neck")]
    pub pts_neck: Option<NeckConfig>,

    #[serde(default)]
    pub positional_encoding: PositionalEncodingConfig,

    #[serde(default)]
    pub encoder: TransformerStackConfig,

    #[serde(default)]
    pub decoder: TransformerStackConfig,

    #[serde(default)]
    pub heads: HeadsConfig,
}

fn default_num_queries() -> usize {
    411
}
fn default_embed_dims() -> usize {
    256
}
fn default_num_sensors() -> usize {
    5
}
fn default_img_neck() -> Option<NeckConfig> {
    Some(NeckConfig {
        in_channels: 2048,
        out_channels: default_embed_dims(),
    })
}
fn default_pts_neck() -> Option<NeckConfig> {
    Some(NeckConfig {
        in_channels: 512,
        out_channels: default_embed_dims(),
    })
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_queries: default_num_queries(),
            embed_dims: default_embed_dims(),
            num_sensors: default_num_sensors(),
            img_neck: default_img_neck(),
            pts_neck: default_pts_neck(),
            positional_encoding: PositionalEncodingConfig::default(),
            encoder: TransformerStackConfig::default(),
            decoder: TransformerStackConfig::default(),
            heads: HeadsConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Check every structural invariant up front and return the decoder
    /// query layout.
    ///
    /// This runs before any parameter is allocated, so a bad configuration
    /// never reaches tensor code.
    pub fn validate(&self) -> Result<QueryLayout> {
        let e = self.embed_dims;
        let layout = QueryLayout::new(
            self.num_queries,
            self.heads.num_object_density_queries,
            self.heads.num_traffic_rule_queries,
            self.heads.num_waypoints_queries,
        )?;

        if self.num_sensors == 0 {
            return Err(FsdError::config("num_sensors must be at least 1"));
        }
        if self.positional_encoding.num_feats * 2 != e {
            return Err(FsdError::config(format!(
                "embed_dims should be exactly 2 times num_feats, found {e} and {}",
                self.positional_encoding.num_feats
            )));
        }
        for (name, stack) in [("encoder", &self.encoder), ("decoder", &self.decoder)] {
            if stack.num_heads == 0 || e % stack.num_heads != 0 {
                return Err(FsdError::config(format!(
                    "{name}: embed_dims {e} is not divisible by num_heads {}",
                    stack.num_heads
                )));
            }
            if stack.num_layers == 0 {
                return Err(FsdError::config(format!("{name}: num_layers must be at least 1")));
            }
        }
        for (name, neck) in [("img_neck", &self.img_neck), ("pts_neck", &self.pts_neck)] {
            if let Some(neck) = neck
                && neck.out_channels != e
            {
                return Err(FsdError::config(format!(
                    "{name}: out_channels {} must equal embed_dims {e}",
                    neck.out_channels
                )));
            }
        }

        self.heads.validate(e, &layout)?;
        debug!(
            num_queries = layout.num_queries(),
            grid_side = layout.grid_side(),
            "model config validated"
        );
        Ok(layout)
    }
}

/// Per-pixel linear projection from a backbone's channel count to the
/// embedding width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeckConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

/// Fixed 2-D sine positional encoding shared by the encoder tokens and the
/// density-grid decoder slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionalEncodingConfig {
    /// Channels per axis; the encoding is `2 * num_feats` wide.
    #[serde(default = "default_num_feats")]
    pub num_feats: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_num_feats() -> usize {
    default_embed_dims() / 2
}
fn default_temperature() -> f64 {
    10_000.0
}
fn default_true() -> bool {
    true
}
fn default_scale() -> f64 {
    TAU
}
fn default_eps() -> f64 {
    1e-6
}

impl Default for PositionalEncodingConfig {
    fn default() -> Self {
        Self {
            num_feats: default_num_feats(),
            temperature: default_temperature(),
            normalize: true,
            scale: default_scale(),
            eps: default_eps(),
            offset: 0.0,
        }
    }
}

/// Depth and width of one post-norm attention stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerStackConfig {
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_feedforward_channels")]
    pub feedforward_channels: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_num_layers() -> usize {
    6
}
fn default_num_heads() -> usize {
    8
}
fn default_feedforward_channels() -> usize {
    2048
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for TransformerStackConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            feedforward_channels: default_feedforward_channels(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heads
// ─────────────────────────────────────────────────────────────────────────────

/// Query counts plus one tagged head description per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadsConfig {
    #[serde(default = "default_density_queries")]
    pub num_object_density_queries: usize,
    #[serde(default = "default_traffic_rule_queries")]
    pub num_traffic_rule_queries: usize,
    #[serde(default = "default_waypoint_queries")]
    pub num_waypoints_queries: usize,

    #[serde(default = "default_object_density_head")]
    pub object_density_head: HeadConfig,
    #[serde(default = "default_traffic_rule_head")]
    pub junction_head: HeadConfig,
    #[serde(default = "default_traffic_rule_head")]
    pub stop_sign_head: HeadConfig,
    #[serde(default = "default_traffic_rule_head")]
    pub traffic_light_head: HeadConfig,
    #[serde(default = "default_waypoints_head")]
    pub waypoints_head: HeadConfig,
}

fn default_density_queries() -> usize {
    400
}
fn default_traffic_rule_queries() -> usize {
    1
}
fn default_waypoint_queries() -> usize {
    10
}
fn default_object_density_head() -> HeadConfig {
    HeadConfig::ObjectDensity(DensityHeadConfig::default())
}
fn default_traffic_rule_head() -> HeadConfig {
    HeadConfig::TrafficRule(TrafficRuleHeadConfig::default())
}
fn default_waypoints_head() -> HeadConfig {
    HeadConfig::Waypoint(WaypointHeadConfig::default())
}

impl Default for HeadsConfig {
    fn default() -> Self {
        Self {
            num_object_density_queries: default_density_queries(),
            num_traffic_rule_queries: default_traffic_rule_queries(),
            num_waypoints_queries: default_waypoint_queries(),
            object_density_head: default_object_density_head(),
            junction_head: default_traffic_rule_head(),
            stop_sign_head: default_traffic_rule_head(),
            traffic_light_head: default_traffic_rule_head(),
            waypoints_head: default_waypoints_head(),
        }
    }
}

impl HeadsConfig {
    fn validate(&self, embed_dims: usize, layout: &QueryLayout) -> Result<()> {
        match &self.object_density_head {
            HeadConfig::ObjectDensity(cfg) => {
                let expected = embed_dims + EGO_VELOCITY_CHANNELS;
                if cfg.input_size != expected {
                    return Err(FsdError::config(format!(
                        "object_density_head: input_size {} must equal embed_dims + \
                         {EGO_VELOCITY_CHANNELS} = {expected}",
                        cfg.input_size
                    )));
                }
                if cfg.output_size != DENSITY_CHANNELS {
                    return Err(FsdError::config(format!(
                        "object_density_head: output_size must be {DENSITY_CHANNELS}, got {}",
                        cfg.output_size
                    )));
                }
            }
            other => return Err(wrong_kind("object_density_head", "object_density", other)),
        }

        for (slot, head) in [
            ("junction_head", &self.junction_head),
            ("stop_sign_head", &self.stop_sign_head),
            ("traffic_light_head", &self.traffic_light_head),
        ] {
            match head {
                HeadConfig::TrafficRule(cfg) => {
                    if cfg.input_size != embed_dims {
                        return Err(FsdError::config(format!(
                            "{slot}: input_size {} must equal embed_dims {embed_dims}",
                            cfg.input_size
                        )));
                    }
                    if cfg.output_size != TRAFFIC_RULE_CHANNELS {
                        return Err(FsdError::config(format!(
                            "{slot}: output_size must be {TRAFFIC_RULE_CHANNELS}, got {}",
                            cfg.output_size
                        )));
                    }
                }
                other => return Err(wrong_kind(slot, "traffic_rule", other)),
            }
        }

        match &self.waypoints_head {
            HeadConfig::Waypoint(cfg) => {
                if cfg.num_waypoints != layout.num_waypoints() {
                    return Err(FsdError::config(format!(
                        "waypoints_head num_waypoints {} must be equal to num_waypoints_queries {}",
                        cfg.num_waypoints,
                        layout.num_waypoints()
                    )));
                }
                if cfg.input_size != embed_dims {
                    return Err(FsdError::config(format!(
                        "waypoints_head: input_size {} must equal embed_dims {embed_dims}",
                        cfg.input_size
                    )));
                }
                if cfg.num_layers == 0 {
                    return Err(FsdError::config("waypoints_head: num_layers must be at least 1"));
                }
                if let Some(weights) = &cfg.waypoints_weights
                    && weights.len() != cfg.num_waypoints
                {
                    return Err(FsdError::config(format!(
                        "waypoints_head: {} waypoint weights for {} waypoints",
                        weights.len(),
                        cfg.num_waypoints
                    )));
                }
            }
            other => return Err(wrong_kind("waypoints_head", "waypoint", other)),
        }
        Ok(())
    }
}

fn wrong_kind(slot: &str, expected: &str, found: &HeadConfig) -> FsdError {
    FsdError::config(format!(
        "{slot} must be a `{expected}` head, found `{}`",
        found.kind()
    ))
}

/// A prediction head, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadConfig {
    ObjectDensity(DensityHeadConfig),
    TrafficRule(TrafficRuleHeadConfig),
    Waypoint(WaypointHeadConfig),
}

impl HeadConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            HeadConfig::ObjectDensity(_) => "object_density",
            HeadConfig::TrafficRule(_) => "traffic_rule",
            HeadConfig::Waypoint(_) => "waypoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityHeadConfig {
    #[serde(default = "default_density_input")]
    pub input_size: usize,
    #[serde(default = "default_head_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_density_output")]
    pub output_size: usize,
    #[serde(default)]
    pub loss: RegressionLoss,
    #[serde(default)]
    pub loss_weights: DensityLossWeights,
}

fn default_density_input() -> usize {
    default_embed_dims() + EGO_VELOCITY_CHANNELS
}
fn default_head_hidden() -> usize {
    64
}
fn default_density_output() -> usize {
    DENSITY_CHANNELS
}

impl Default for DensityHeadConfig {
    fn default() -> Self {
        Self {
            input_size: default_density_input(),
            hidden_size: default_head_hidden(),
            output_size: default_density_output(),
            loss: RegressionLoss::default(),
            loss_weights: DensityLossWeights::default(),
        }
    }
}

/// Weights of the three density-loss channel groups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityLossWeights {
    #[serde(default = "default_prob_weight")]
    pub prob: f64,
    #[serde(default = "default_geom_weight")]
    pub geom: f64,
    #[serde(default = "default_vel_weight")]
    pub vel: f64,
}

fn default_prob_weight() -> f64 {
    0.25
}
fn default_geom_weight() -> f64 {
    0.25
}
fn default_vel_weight() -> f64 {
    0.02
}

impl Default for DensityLossWeights {
    fn default() -> Self {
        Self {
            prob: default_prob_weight(),
            geom: default_geom_weight(),
            vel: default_vel_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRuleHeadConfig {
    #[serde(default = "default_embed_dims")]
    pub input_size: usize,
    #[serde(default = "default_traffic_output")]
    pub output_size: usize,
    #[serde(default)]
    pub loss: ClassificationLoss,
}

fn default_traffic_output() -> usize {
    TRAFFIC_RULE_CHANNELS
}

impl Default for TrafficRuleHeadConfig {
    fn default() -> Self {
        Self {
            input_size: default_embed_dims(),
            output_size: default_traffic_output(),
            loss: ClassificationLoss::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointHeadConfig {
    #[serde(default = "default_waypoint_queries")]
    pub num_waypoints: usize,
    #[serde(default = "default_embed_dims")]
    pub input_size: usize,
    #[serde(default = "default_head_hidden")]
    pub hidden_size: usize,
    #[serde(default = "default_gru_layers")]
    pub num_layers: usize,
    #[serde(default)]
    pub loss: MaskedSmoothL1Config,
    /// Per-step loss weights; `None` weighs every step equally.
    #[serde(default = "default_waypoint_weights")]
    pub waypoints_weights: Option<Vec<f32>>,
}

fn default_gru_layers() -> usize {
    1
}
fn default_waypoint_weights() -> Option<Vec<f32>> {
    Some(DEFAULT_WAYPOINT_WEIGHTS.to_vec())
}

impl Default for WaypointHeadConfig {
    fn default() -> Self {
        Self {
            num_waypoints: default_waypoint_queries(),
            input_size: default_embed_dims(),
            hidden_size: default_head_hidden(),
            num_layers: default_gru_layers(),
            loss: MaskedSmoothL1Config::default(),
            waypoints_weights: default_waypoint_weights(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loss kernels
// ─────────────────────────────────────────────────────────────────────────────

/// Element-wise regression kernel, mean-reduced and scaled by `loss_weight`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegressionLoss {
    L1 {
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
    SmoothL1 {
        #[serde(default = "default_beta")]
        beta: f64,
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
    Mse {
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
}

impl Default for RegressionLoss {
    fn default() -> Self {
        RegressionLoss::L1 { loss_weight: 1.0 }
    }
}

/// Two-channel classification kernel applied to raw logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassificationLoss {
    /// Independent sigmoid per channel, binary cross-entropy.
    SigmoidBce {
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
    /// Softmax across channels, cross-entropy against a (soft) one-hot target.
    SoftmaxCrossEntropy {
        #[serde(default = "default_loss_weight")]
        loss_weight: f64,
    },
}

impl Default for ClassificationLoss {
    fn default() -> Self {
        ClassificationLoss::SigmoidBce { loss_weight: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskedSmoothL1Config {
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_loss_weight")]
    pub loss_weight: f64,
}

impl Default for MaskedSmoothL1Config {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            loss_weight: default_loss_weight(),
        }
    }
}

fn default_loss_weight() -> f64 {
    1.0
}
fn default_beta() -> f64 {
    1.0
}

/// Relative weights for combining the five head losses outside the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    #[serde(default = "default_loss_weight")]
    pub object_density: f64,
    #[serde(default = "default_loss_weight")]
    pub junction: f64,
    #[serde(default = "default_loss_weight")]
    pub stop_sign: f64,
    #[serde(default = "default_loss_weight")]
    pub traffic_light: f64,
    #[serde(default = "default_loss_weight")]
    pub waypoints: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            object_density: 1.0,
            junction: 1.0,
            stop_sign: 1.0,
            traffic_light: 1.0,
            waypoints: 1.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// OTLP/HTTP collector base URL; spans are exported only when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

fn default_service_name() -> String {
    "fsd".to_string()
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Disk I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<FsdConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let mut cfg: FsdConfig = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config from `path`, falling back to the defaults (with
/// environment overrides applied) when the file is missing.
pub fn load_or_default(path: &Path) -> Result<FsdConfig> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = FsdConfig::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Save the config to `path`, creating parent directories if necessary.
pub fn save_to(cfg: &FsdConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw)?;
    Ok(())
}

/// Apply `FSD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FSD_LOG_FORMAT` (`json` / `compact`) | `telemetry.log_format` |
/// | `FSD_LOG_FILTER` | `telemetry.log_filter` |
/// | `FSD_OTLP_ENDPOINT` | `telemetry.otlp_endpoint` |
/// | `FSD_WEIGHTS_PATH` | `weights_path` |
pub fn apply_env_overrides(cfg: &mut FsdConfig) {
    if let Ok(v) = std::env::var("FSD_LOG_FORMAT") {
        match v.as_str() {
            "json" => cfg.telemetry.log_format = LogFormat::Json,
            "compact" => cfg.telemetry.log_format = LogFormat::Compact,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("FSD_LOG_FILTER") {
        cfg.telemetry.log_filter = v;
    }
    if let Ok(v) = std::env::var("FSD_OTLP_ENDPOINT") {
        cfg.telemetry.otlp_endpoint = Some(v);
    }
    if let Ok(v) = std::env::var("FSD_WEIGHTS_PATH") {
        cfg.weights_path = Some(PathBuf::from(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_to_reference_layout() {
        let layout = ModelConfig::default().validate().expect("valid");
        assert_eq!(layout.num_queries(), 411);
        assert_eq!(layout.grid_side(), 20);
        assert_eq!(layout.num_waypoints(), 10);
    }

    #[test]
    fn default_waypoint_weights_decrease_and_sum_to_one() {
        let w = DEFAULT_WAYPOINT_WEIGHTS;
        assert!(w.windows(2).all(|p| p[0] > p[1]));
        let sum: f32 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum = {sum}");
    }

    #[test]
    fn non_square_density_count_fails_validation() {
        let mut cfg = ModelConfig::default();
        cfg.num_queries = 412;
        cfg.heads.num_object_density_queries = 401;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("perfect square"));
    }

    #[test]
    fn waypoint_head_count_must_match_slots() {
        let mut cfg = ModelConfig::default();
        if let HeadConfig::Waypoint(w) = &mut cfg.heads.waypoints_head {
            w.num_waypoints = 8;
            w.waypoints_weights = None;
        }
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("num_waypoints 8"));
    }

    #[test]
    fn wrong_head_kind_in_slot_is_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.heads.junction_head = HeadConfig::Waypoint(WaypointHeadConfig::default());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("junction_head"));
        assert!(err.to_string().contains("traffic_rule"));
    }

    #[test]
    fn waypoint_weight_length_is_checked() {
        let mut cfg = ModelConfig::default();
        if let HeadConfig::Waypoint(w) = &mut cfg.heads.waypoints_head {
            w.waypoints_weights = Some(vec![0.5, 0.5]);
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sine_width_must_match_embedding() {
        let mut cfg = ModelConfig::default();
        cfg.positional_encoding.num_feats = 64;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("num_feats"));
    }

    #[test]
    fn heads_must_divide_embedding() {
        let mut cfg = ModelConfig::default();
        cfg.decoder.num_heads = 7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn neck_width_must_match_embedding() {
        let mut cfg = ModelConfig::default();
        cfg.pts_neck = Some(NeckConfig {
            in_channels: 512,
            out_channels: 128,
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pts_neck"));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: FsdConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg, FsdConfig::default());
    }

    #[test]
    fn tagged_head_config_parses() {
        let raw = r#"
            [model.heads.junction_head]
            type = "traffic_rule"
            input_size = 256

            [model.heads.junction_head.loss]
            type = "softmax_cross_entropy"
            loss_weight = 2.0
        "#;
        let cfg: FsdConfig = toml::from_str(raw).expect("parse");
        match cfg.model.heads.junction_head {
            HeadConfig::TrafficRule(t) => assert_eq!(
                t.loss,
                ClassificationLoss::SoftmaxCrossEntropy { loss_weight: 2.0 }
            ),
            other => panic!("unexpected head {other:?}"),
        }
    }

    #[test]
    fn partial_density_loss_weights_keep_defaults() {
        let raw = r#"
            [model.heads.object_density_head]
            type = "object_density"

            [model.heads.object_density_head.loss_weights]
            vel = 0.5
        "#;
        let cfg: FsdConfig = toml::from_str(raw).expect("parse");
        match cfg.model.heads.object_density_head {
            HeadConfig::ObjectDensity(d) => assert_eq!(
                d.loss_weights,
                DensityLossWeights {
                    vel: 0.5,
                    ..DensityLossWeights::default()
                }
            ),
            other => panic!("unexpected head {other:?}"),
        }
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = load_or_default(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(cfg.model, ModelConfig::default());
    }

    #[test]
    fn load_or_default_reads_existing_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        let mut cfg = FsdConfig::default();
        cfg.loss_weights.waypoints = 3.0;
        save_to(&cfg, &path).expect("save");
        let loaded = load_or_default(&path).expect("load");
        assert_eq!(loaded.loss_weights.waypoints, 3.0);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("fsd").join("config.toml");

        let cfg = FsdConfig::default();
        save_to(&cfg, &path).expect("save");

        let raw = fs::read_to_string(&path).expect("read");
        let loaded: FsdConfig = toml::from_str(&raw).expect("parse");
        assert_eq!(loaded.model, cfg.model);
        assert_eq!(loaded.loss_weights, cfg.loss_weights);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("absent.toml");
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn load_from_rejects_malformed_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "model = 3").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, FsdError::ConfigParse(_)));
    }

    #[test]
    fn apply_env_overrides_changes_weights_path() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("FSD_WEIGHTS_PATH", "/models/fsd.safetensors") };
        let mut cfg = FsdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(
            cfg.weights_path.as_deref(),
            Some(Path::new("/models/fsd.safetensors"))
        );
        unsafe { std::env::remove_var("FSD_WEIGHTS_PATH") };
    }

    #[test]
    fn apply_env_overrides_ignores_unknown_log_format() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("FSD_LOG_FORMAT", "yaml") };
        let mut cfg = FsdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.telemetry.log_format, LogFormat::Compact);
        unsafe { std::env::remove_var("FSD_LOG_FORMAT") };
    }
}
