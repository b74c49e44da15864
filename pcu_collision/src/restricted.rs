//! Restricted-mode direction computation.
//!
//! In recovery the guardian recomputes, from scratch every tick, the set of
//! directions in which each axis may move from its current value. The rules
//! work outward-in: an extended payload outside the physical aperture may
//! only retract; a payload inside the aperture but outside the configured
//! safe radius may translate monotonically toward its aperture center. When
//! both payloads are extended and a center translation would be required,
//! no automatic recovery exists.

use pcu_common::axis::Axis;
use pcu_common::geometry::{Geometry, Instrument};
use pcu_common::position::Position;

/// Monotone direction an axis is allowed to move from its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// New commanded values must not exceed the current value.
    Le,
    /// New commanded values must not fall below the current value.
    Ge,
}

impl Dir {
    /// Whether a commanded value respects this direction from `current`.
    #[inline]
    pub fn holds(self, commanded: f64, current: f64) -> bool {
        match self {
            Dir::Le => commanded <= current,
            Dir::Ge => commanded >= current,
        }
    }

    /// Operator spelling for diagnostics.
    pub const fn symbol(self) -> &'static str {
        match self {
            Dir::Le => "<=",
            Dir::Ge => ">=",
        }
    }
}

/// Per-axis allowed directions; axes absent from the map are held disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionMap {
    dirs: [Option<Dir>; Axis::COUNT],
}

impl DirectionMap {
    /// Map with every axis held.
    pub const fn empty() -> Self {
        Self {
            dirs: [None; Axis::COUNT],
        }
    }

    /// Allow one axis to move in one direction.
    pub fn set(&mut self, axis: Axis, dir: Dir) {
        self.dirs[axis.index()] = Some(dir);
    }

    /// Allowed direction for one axis, if any.
    #[inline]
    pub fn get(&self, axis: Axis) -> Option<Dir> {
        self.dirs[axis.index()]
    }

    /// Whether no axis may move.
    pub fn is_empty(&self) -> bool {
        self.dirs.iter().all(Option::is_none)
    }

    /// `(axis, direction)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, Dir)> + '_ {
        Axis::ALL
            .iter()
            .filter_map(|&a| self.dirs[a.index()].map(|d| (a, d)))
    }
}

/// Outcome of the direction computation.
#[derive(Debug, Clone, PartialEq)]
pub enum RestrictedAction {
    /// Directional recovery is possible under this map.
    Directions(DirectionMap),
    /// No automatic recovery; the stages must be reset by hand.
    ManualReset,
}

/// Direction map plus operator guidance for the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Restriction {
    /// What the guardian should enforce this tick.
    pub action: RestrictedAction,
    /// Operator guidance, emitted once per map change.
    pub notes: Vec<String>,
}

/// Compute the allowed directions for the current position.
pub fn restricted_directions(pos: &Position, geometry: &Geometry) -> Restriction {
    if !pos.is_fully_defined() {
        return Restriction {
            action: RestrictedAction::ManualReset,
            notes: vec!["current position is undefined; the stages must be reset manually".into()],
        };
    }

    let mut map = DirectionMap::empty();
    let mut notes = Vec::new();
    let mut center: Option<(f64, f64)> = None;

    let fiber_in_aperture = geometry.in_aperture(pos, Instrument::Fiber);
    let fiber_safe = geometry.in_hole(pos, Instrument::Fiber);
    if pos.fiber_extended() && !fiber_in_aperture {
        notes.push(
            "the fiber bundle is extended; fully retract the fiber bundle stage (m4)".into(),
        );
        map.set(Axis::M4, Dir::Le);
    } else if fiber_in_aperture && !fiber_safe {
        let (cx, cy) = geometry.fiber_center;
        notes.push(format!(
            "the fiber bundle is outside the allowed bounds; \
             move toward the k-mirror center ({cx:.1}, {cy:.1})"
        ));
        center = Some(geometry.fiber_center);
    }

    let mask_in_aperture = geometry.in_aperture(pos, Instrument::Mask);
    let mask_safe = geometry.in_hole(pos, Instrument::Mask);
    if pos.mask_extended() && !mask_in_aperture {
        notes.push("the pinhole mask is extended; retract the pinhole mask stage (m3)".into());
        map.set(Axis::M3, Dir::Le);
    } else if mask_in_aperture && !mask_safe {
        let (cx, cy) = geometry.mask_center;
        notes.push(format!(
            "the pinhole mask is outside the allowed bounds; \
             move toward the k-mirror center ({cx:.1}, {cy:.1})"
        ));
        center = Some(geometry.mask_center);
    }

    if let Some((cx, cy)) = center {
        if pos.fiber_extended() && pos.mask_extended() {
            notes.push("the PCU stages must be reset manually".into());
            return Restriction {
                action: RestrictedAction::ManualReset,
                notes,
            };
        }
        for (axis, target) in [(Axis::M1, cx), (Axis::M2, cy)] {
            let Some(current) = pos.get(axis) else { continue };
            let diff = target - current;
            if diff > 0.0 {
                map.set(axis, Dir::Ge);
            } else if diff < 0.0 {
                map.set(axis, Dir::Le);
            }
        }
    }

    Restriction {
        action: RestrictedAction::Directions(map),
        notes,
    }
}
