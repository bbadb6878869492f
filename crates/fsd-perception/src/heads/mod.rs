//! Prediction heads and the dispatcher that feeds them.
//!
//! - [`density`] – per-cell occupancy / box attributes with the masked
//!   density loss.
//! - [`traffic_rule`] – linear two-way classifiers.
//! - [`waypoint`] – goal-conditioned GRU producing cumulative waypoints.
//! - [`factory`] – builds heads from tagged configs and wires them to slots.
//! - [`dispatcher`] – slices decoder output by [`QueryLayout`][fsd_types::QueryLayout].

pub mod density;
pub mod dispatcher;
pub mod factory;
pub mod traffic_rule;
pub mod waypoint;

pub use density::{DensityLossTerms, OCCUPANCY_THRESHOLD, ObjectDensityHead, ObjectDensityLoss};
pub use dispatcher::HeadDispatcher;
pub use factory::{Head, HeadFactory, HeadSet};
pub use traffic_rule::TrafficRuleHead;
pub use waypoint::WaypointHead;
