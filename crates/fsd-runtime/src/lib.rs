//! `fsd-runtime` – process-level plumbing around the fusion model.
//!
//! # Modules
//!
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export, driven
//!   by [`TelemetryConfig`][fsd_types::config::TelemetryConfig].
//! - [`planner`] – [`Planner`][planner::Planner]: owns the `VarMap`, loads and
//!   saves weights, and turns batched predictions into per-sample
//!   [`EgoPlan`][planner::EgoPlan]s.

pub mod planner;
pub mod telemetry;

pub use planner::{DensityGrid, EgoPlan, Planner};
pub use telemetry::{TracerProviderGuard, init_tracing};
