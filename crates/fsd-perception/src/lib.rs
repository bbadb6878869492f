//! `fsd-perception` – the camera + lidar fusion core.
//!
//! Fuses multi-view image features and a bird's-eye-view point-cloud map
//! into one attention-based representation, then decodes it into an object
//! density grid, three traffic-rule flags, and future ego waypoints.
//!
//! # Modules
//!
//! - [`adapter`] – per-sensor necks projecting backbone maps to the
//!   embedding width.
//! - [`positional`] – fixed 2-D sine positional encoding.
//! - [`query_builder`] – encoder token sequence plus decoder queries and
//!   positional encodings.
//! - [`attention`] / [`transformer`] – post-norm encoder/decoder stack.
//! - [`heads`] – density, traffic-rule and waypoint heads and their
//!   dispatcher.
//! - [`losses`] – masked regression / classification kernels.
//! - [`model`] – [`InterFuser`][model::InterFuser], the assembled model.
//!
//! All parameters are created through a `candle_nn::VarBuilder`, so the
//! caller owns them in a `VarMap` and can load, save or optimise them.

pub mod adapter;
pub mod attention;
pub mod heads;
pub mod losses;
pub mod model;
pub mod positional;
pub mod query_builder;
pub mod transformer;

pub use model::{ForwardMode, InterFuser, ModelOutput};
pub use query_builder::{QueryBatch, QueryBuilder};
