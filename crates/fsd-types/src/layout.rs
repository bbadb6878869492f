//! [`QueryLayout`] – positional partition of the decoder query slots.
//!
//! The decoder attends from `num_queries` learned slots.  Which prediction
//! head consumes a slot is decided purely by its index:
//!
//! ```text
//! [0, D)           density-grid slots   (D = √D × √D grid cells)
//! [D, D+T)         traffic-rule slot(s)
//! [D+T, D+T+W)     waypoint slots
//! ```
//!
//! The ranges are computed once, validated against `num_queries`, and then
//! handed to every component that slices the decoder output.  Nothing
//! downstream recomputes them.
//!
//! # Example
//!
//! ```rust
//! use fsd_types::QueryLayout;
//!
//! let layout = QueryLayout::new(411, 400, 1, 10).unwrap();
//! assert_eq!(layout.grid_side(), 20);
//! assert_eq!(layout.traffic_rule(), 400..401);
//! assert_eq!(layout.waypoints(), 401..411);
//!
//! assert!(QueryLayout::new(412, 401, 1, 10).is_err());
//! ```

use std::ops::Range;

use crate::{FsdError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLayout {
    density: Range<usize>,
    traffic_rule: Range<usize>,
    waypoints: Range<usize>,
    grid_side: usize,
}

impl QueryLayout {
    /// Build the layout for `num_queries` slots split into `num_density`,
    /// `num_traffic_rule`, and `num_waypoints` groups.
    ///
    /// # Errors
    ///
    /// Returns [`FsdError::Config`] when any group is empty, when the groups
    /// do not add up to `num_queries`, or when `num_density` is not a perfect
    /// square.
    pub fn new(
        num_queries: usize,
        num_density: usize,
        num_traffic_rule: usize,
        num_waypoints: usize,
    ) -> Result<Self> {
        if num_density == 0 || num_traffic_rule == 0 || num_waypoints == 0 {
            return Err(FsdError::config(format!(
                "every query group must be non-empty, got density={num_density}, \
                 traffic_rule={num_traffic_rule}, waypoints={num_waypoints}"
            )));
        }
        let total = num_density + num_traffic_rule + num_waypoints;
        if total != num_queries {
            return Err(FsdError::config(format!(
                "num_queries {num_queries} must equal density {num_density} + traffic_rule \
                 {num_traffic_rule} + waypoints {num_waypoints} = {total}"
            )));
        }
        let grid_side = num_density.isqrt();
        if grid_side * grid_side != num_density {
            return Err(FsdError::config(format!(
                "num_object_density_queries {num_density} is not a perfect square"
            )));
        }

        let traffic_start = num_density;
        let waypoint_start = traffic_start + num_traffic_rule;
        Ok(Self {
            density: 0..num_density,
            traffic_rule: traffic_start..waypoint_start,
            waypoints: waypoint_start..num_queries,
            grid_side,
        })
    }

    pub fn density(&self) -> Range<usize> {
        self.density.clone()
    }

    pub fn traffic_rule(&self) -> Range<usize> {
        self.traffic_rule.clone()
    }

    pub fn waypoints(&self) -> Range<usize> {
        self.waypoints.clone()
    }

    /// Side length of the square density grid (`√D`).
    pub fn grid_side(&self) -> usize {
        self.grid_side
    }

    pub fn num_queries(&self) -> usize {
        self.waypoints.end
    }

    pub fn num_density(&self) -> usize {
        self.density.len()
    }

    pub fn num_traffic_rule(&self) -> usize {
        self.traffic_rule.len()
    }

    pub fn num_waypoints(&self) -> usize {
        self.waypoints.len()
    }

    /// Number of slots that carry a learned (rather than sine) positional
    /// encoding: the traffic-rule and waypoint groups.
    pub fn num_learned_positions(&self) -> usize {
        self.traffic_rule.len() + self.waypoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_layout_ranges_are_contiguous() {
        let layout = QueryLayout::new(411, 400, 1, 10).unwrap();
        assert_eq!(layout.density(), 0..400);
        assert_eq!(layout.traffic_rule(), 400..401);
        assert_eq!(layout.waypoints(), 401..411);
        assert_eq!(layout.num_queries(), 411);
        assert_eq!(layout.num_learned_positions(), 11);
    }

    #[test]
    fn perfect_square_density_passes() {
        let layout = QueryLayout::new(411, 400, 1, 10).unwrap();
        assert_eq!(layout.grid_side(), 20);
    }

    #[test]
    fn non_square_density_is_rejected() {
        let err = QueryLayout::new(412, 401, 1, 10).unwrap_err();
        assert!(matches!(err, FsdError::Config(_)));
        assert!(err.to_string().contains("perfect square"));
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let err = QueryLayout::new(410, 400, 1, 10).unwrap_err();
        assert!(err.to_string().contains("num_queries 410"));
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(QueryLayout::new(410, 400, 0, 10).is_err());
        assert!(QueryLayout::new(401, 400, 1, 0).is_err());
    }

    #[test]
    fn multiple_traffic_slots_shift_waypoints() {
        let layout = QueryLayout::new(20, 16, 2, 2).unwrap();
        assert_eq!(layout.traffic_rule(), 16..18);
        assert_eq!(layout.waypoints(), 18..20);
        assert_eq!(layout.grid_side(), 4);
    }
}
