//! Aperture geometry and admissibility predicates.
//!
//! The K-mirror rotator surrounds the workspace: a payload stage may only be
//! extended while the carriage sits inside a circular clearance around that
//! payload's center. The configured safe radius is a conservative subset of
//! the true physical aperture (`kmirror_radius`).
//!
//! Every predicate treats an undefined coordinate as out of bounds.

use crate::axis::Axis;
use crate::position::Position;

/// The two payloads carried by the axial stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    /// Fiber bundle, extended by m4.
    Fiber,
    /// Pinhole mask, extended by m3.
    Mask,
}

impl Instrument {
    /// The axial stage that extends this payload.
    #[inline]
    pub const fn stage(self) -> Axis {
        match self {
            Instrument::Fiber => Axis::M4,
            Instrument::Mask => Axis::M3,
        }
    }
}

/// Static geometry of the PCU workspace, loaded once from the motor table.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// (m1, m2) center of the fiber aperture [mm].
    pub fiber_center: (f64, f64),
    /// (m1, m2) center of the mask aperture [mm].
    pub mask_center: (f64, f64),
    /// Conservative clearance radius per payload [mm].
    pub fiber_safe_radius: f64,
    /// Conservative clearance radius per payload [mm].
    pub mask_safe_radius: f64,
    /// True physical radius of the K-mirror clearance [mm].
    pub kmirror_radius: f64,
    /// Per-axis soft travel limits (lo, hi) [mm].
    pub motor_limits: [(f64, f64); Axis::COUNT],
    /// Per-axis in-position tolerance [mm].
    pub tolerance: [f64; Axis::COUNT],
}

impl Geometry {
    /// Aperture center for a payload.
    #[inline]
    pub fn center(&self, instrument: Instrument) -> (f64, f64) {
        match instrument {
            Instrument::Fiber => self.fiber_center,
            Instrument::Mask => self.mask_center,
        }
    }

    /// Configured safe radius for a payload.
    #[inline]
    pub fn safe_radius(&self, instrument: Instrument) -> f64 {
        match instrument {
            Instrument::Fiber => self.fiber_safe_radius,
            Instrument::Mask => self.mask_safe_radius,
        }
    }

    /// In-position tolerance for one axis.
    #[inline]
    pub fn tolerance(&self, axis: Axis) -> f64 {
        self.tolerance[axis.index()]
    }

    /// Travel limits for one axis.
    #[inline]
    pub fn limits(&self, axis: Axis) -> (f64, f64) {
        self.motor_limits[axis.index()]
    }

    fn within_disk(&self, pos: &Position, instrument: Instrument, radius: f64) -> bool {
        let (Some(x), Some(y)) = (pos.get(Axis::M1), pos.get(Axis::M2)) else {
            return false;
        };
        let (cx, cy) = self.center(instrument);
        (x - cx).powi(2) + (y - cy).powi(2) <= radius.powi(2)
    }

    /// Whether (m1, m2) lies within the configured safe aperture.
    pub fn in_hole(&self, pos: &Position, instrument: Instrument) -> bool {
        self.within_disk(pos, instrument, self.safe_radius(instrument))
    }

    /// Whether (m1, m2) lies within the true physical aperture.
    pub fn in_aperture(&self, pos: &Position, instrument: Instrument) -> bool {
        self.within_disk(pos, instrument, self.kmirror_radius)
    }

    /// Whether every defined coordinate respects its travel limits.
    pub fn in_limits(&self, pos: &Position) -> bool {
        for (axis, coord) in pos.iter() {
            if let Some(v) = coord {
                let (lo, hi) = self.limits(axis);
                if v < lo || v > hi {
                    return false;
                }
            }
        }
        true
    }

    /// Full admissibility predicate.
    ///
    /// A position is valid iff all axes are defined, every coordinate is
    /// within limits, and each extended payload sits inside its safe
    /// aperture.
    pub fn is_valid(&self, pos: &Position) -> bool {
        if !pos.is_fully_defined() || !self.in_limits(pos) {
            return false;
        }
        if pos.mask_extended() && !self.in_hole(pos, Instrument::Mask) {
            return false;
        }
        if pos.fiber_extended() && !self.in_hole(pos, Instrument::Fiber) {
            return false;
        }
        true
    }

    /// Whether a planned transition between two positions may keep the
    /// payload stages extended.
    ///
    /// Two positions are in-hole-compatible when both lie inside the same
    /// safe aperture, or when neither end extends a payload at all (a plain
    /// carriage translation). Anything else must retract both Z stages
    /// first.
    pub fn move_in_hole(&self, from: &Position, to: &Position) -> bool {
        if self.in_hole(from, Instrument::Fiber) && self.in_hole(to, Instrument::Fiber) {
            return true;
        }
        if self.in_hole(from, Instrument::Mask) && self.in_hole(to, Instrument::Mask) {
            return true;
        }
        !from.any_extended() && !to.any_extended()
    }

    /// Whether one axis reads within tolerance of a target.
    pub fn in_position(&self, axis: Axis, current: f64, target: f64) -> bool {
        (current - target).abs() <= self.tolerance(axis)
    }

    /// Whether a sampled position matches a named configuration on every
    /// axis, within per-axis tolerance.
    pub fn matches(&self, pos: &Position, config: &Position) -> bool {
        for axis in Axis::ALL {
            match (pos.get(axis), config.get(axis)) {
                (Some(cur), Some(dest)) if self.in_position(axis, cur, dest) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fiber hole at (100, 50), mask hole at (200, 50), 20 mm safe radii
    /// inside a 50 mm rotator.
    fn test_geometry() -> Geometry {
        Geometry {
            fiber_center: (100.0, 50.0),
            mask_center: (200.0, 50.0),
            fiber_safe_radius: 20.0,
            mask_safe_radius: 20.0,
            kmirror_radius: 50.0,
            motor_limits: [(-1.0, 300.0), (-1.0, 300.0), (-1.0, 40.0), (-1.0, 40.0)],
            tolerance: [0.01; 4],
        }
    }

    #[test]
    fn hole_membership() {
        let g = test_geometry();
        let at_fiber = Position::new(100.0, 50.0, 0.0, 0.0);
        assert!(g.in_hole(&at_fiber, Instrument::Fiber));
        assert!(!g.in_hole(&at_fiber, Instrument::Mask));
        // Between the safe radius and the physical aperture.
        let fringe = Position::new(130.0, 50.0, 0.0, 0.0);
        assert!(!g.in_hole(&fringe, Instrument::Fiber));
        assert!(g.in_aperture(&fringe, Instrument::Fiber));
    }

    #[test]
    fn limits_checked_per_axis() {
        let g = test_geometry();
        assert!(g.in_limits(&Position::zero()));
        assert!(!g.in_limits(&Position::new(301.0, 0.0, 0.0, 0.0)));
        assert!(!g.in_limits(&Position::new(0.0, 0.0, 45.0, 0.0)));
    }

    #[test]
    fn extended_payload_requires_hole() {
        let g = test_geometry();
        // Fiber extended at the fiber center: fine.
        assert!(g.is_valid(&Position::new(100.0, 50.0, 0.0, 10.0)));
        // Fiber extended outside the fiber hole: collision hazard.
        assert!(!g.is_valid(&Position::new(200.0, 50.0, 0.0, 10.0)));
        // Mask extended at the mask center: fine.
        assert!(g.is_valid(&Position::new(200.0, 50.0, 10.0, 0.0)));
        // Everything retracted anywhere in limits: fine.
        assert!(g.is_valid(&Position::new(200.0, 50.0, 0.0, 0.0)));
    }

    #[test]
    fn undefined_axis_is_invalid() {
        let g = test_geometry();
        let pos = Position::undefined().with(Axis::M1, 0.0);
        assert!(!g.is_valid(&pos));
    }

    #[test]
    fn move_in_hole_same_aperture() {
        let g = test_geometry();
        let a = Position::new(100.0, 50.0, 0.0, 5.0);
        let b = Position::new(105.0, 55.0, 0.0, 5.0);
        assert!(g.move_in_hole(&a, &b));
    }

    #[test]
    fn move_in_hole_across_apertures_needs_retraction() {
        let g = test_geometry();
        let fiber = Position::new(100.0, 50.0, 0.0, 5.0);
        let mask = Position::new(200.0, 50.0, 5.0, 0.0);
        assert!(!g.move_in_hole(&fiber, &mask));
    }

    #[test]
    fn move_in_hole_retracted_translation() {
        let g = test_geometry();
        let a = Position::zero();
        let b = Position::new(10.0, 10.0, 0.0, 0.0);
        assert!(g.move_in_hole(&a, &b));
        // Destination extends a payload the current position cannot reach
        // with stages out: not compatible.
        let c = Position::new(200.0, 50.0, 5.0, 0.0);
        assert!(!g.move_in_hole(&a, &c));
    }

    #[test]
    fn matches_respects_tolerance() {
        let g = test_geometry();
        let cfg = Position::new(10.0, 10.0, 0.0, 0.0);
        assert!(g.matches(&Position::new(10.005, 9.995, 0.0, 0.0), &cfg));
        assert!(!g.matches(&Position::new(10.05, 10.0, 0.0, 0.0), &cfg));
    }
}
