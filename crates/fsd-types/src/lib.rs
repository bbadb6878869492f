//! `fsd-types` – shared vocabulary of the fusion planner.
//!
//! Everything that crosses a crate boundary lives here so that the fusion
//! core (`fsd-perception`) and the orchestration layer (`fsd-runtime`) agree
//! on shapes, configuration, and failure modes.
//!
//! # Modules
//!
//! - [`config`] – [`FsdConfig`][config::FsdConfig]: the TOML-backed
//!   configuration surface (query counts, embedding width, transformer depth,
//!   head and loss settings, telemetry).
//! - [`layout`] – [`QueryLayout`][layout::QueryLayout]: the fixed contiguous
//!   partition of decoder query slots into density / traffic-rule / waypoint
//!   groups.
//! - [`batch`] – [`BatchInputs`][batch::BatchInputs] and
//!   [`GroundTruthTargets`][batch::GroundTruthTargets]: what a forward call
//!   consumes.
//! - [`output`] – [`PredictionBundle`][output::PredictionBundle] and
//!   [`LossBundle`][output::LossBundle]: what a forward call produces.

use thiserror::Error;

pub mod batch;
pub mod config;
pub mod layout;
pub mod output;

pub use batch::{BatchInputs, GroundTruthTargets, SampleTargets, SensorInputs};
pub use config::{FsdConfig, HeadConfig, ModelConfig};
pub use layout::QueryLayout;
pub use output::{LossBundle, PredictionBundle};

/// Extra per-cell channels carrying the broadcast ego velocity into the
/// object density head.
pub const EGO_VELOCITY_CHANNELS: usize = 32;

/// Channels of one density-grid cell: occupancy, 2-D offset, 2-D extent,
/// heading, velocity.
pub const DENSITY_CHANNELS: usize = 7;

/// Channels of a traffic-rule prediction (two-way one-hot logits).
pub const TRAFFIC_RULE_CHANNELS: usize = 2;

/// Error type for every structural, configuration, and tensor failure.
///
/// All variants are fatal for the call that produced them: they signal a
/// misconfiguration or a caller contract violation, never a transient
/// condition.
#[derive(Error, Debug)]
pub enum FsdError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Shape Mismatch in {context}: {details}")]
    Shape { context: String, details: String },

    #[error("Missing Input: {0}")]
    MissingInput(String),

    #[error("Tensor Error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config Parse Error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config Serialization Error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl FsdError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape(context: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Shape {
            context: context.into(),
            details: details.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsdError>;
