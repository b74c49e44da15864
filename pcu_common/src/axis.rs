//! Stage identifiers.
//!
//! The PCU carries exactly four stages: m1/m2 translate the carriage in the
//! plane, m3 extends the pinhole mask and m4 extends the fiber bundle along
//! the optical axis.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the four PCU stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Planar X stage.
    M1,
    /// Planar Y stage.
    M2,
    /// Pinhole mask extension stage.
    M3,
    /// Fiber bundle extension stage.
    M4,
}

impl Axis {
    /// All axes in canonical order (XY before Z).
    pub const ALL: [Axis; 4] = [Axis::M1, Axis::M2, Axis::M3, Axis::M4];

    /// Number of axes.
    pub const COUNT: usize = 4;

    /// Stable index for fixed-size per-axis arrays.
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Axis::M1 => 0,
            Axis::M2 => 1,
            Axis::M3 => 2,
            Axis::M4 => 3,
        }
    }

    /// Channel-name fragment ("m1".."m4").
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Axis::M1 => "m1",
            Axis::M2 => "m2",
            Axis::M3 => "m3",
            Axis::M4 => "m4",
        }
    }

    /// Whether this axis translates the carriage in the plane.
    #[inline]
    pub const fn is_planar(self) -> bool {
        matches!(self, Axis::M1 | Axis::M2)
    }

    /// Whether this axis extends a payload along the optical axis.
    #[inline]
    pub const fn is_axial(self) -> bool {
        matches!(self, Axis::M3 | Axis::M4)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Axis {
    type Err = UnknownAxis;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "m1" => Ok(Axis::M1),
            "m2" => Ok(Axis::M2),
            "m3" => Ok(Axis::M3),
            "m4" => Ok(Axis::M4),
            other => Err(UnknownAxis(other.to_string())),
        }
    }
}

/// Parse error for an axis name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a valid motor")]
pub struct UnknownAxis(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_xy_then_z() {
        assert_eq!(Axis::ALL, [Axis::M1, Axis::M2, Axis::M3, Axis::M4]);
        assert!(Axis::M1.is_planar() && Axis::M2.is_planar());
        assert!(Axis::M3.is_axial() && Axis::M4.is_axial());
    }

    #[test]
    fn index_is_stable() {
        for (i, axis) in Axis::ALL.iter().enumerate() {
            assert_eq!(axis.index(), i);
        }
    }

    #[test]
    fn round_trip_names() {
        for axis in Axis::ALL {
            assert_eq!(axis.name().parse::<Axis>(), Ok(axis));
        }
        assert!("m5".parse::<Axis>().is_err());
    }
}
