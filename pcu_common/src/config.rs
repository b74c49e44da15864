//! Named-configuration store and motor tables.
//!
//! Two static TOML tables feed the controller: the positions file (named
//! configurations in three families) and the motors file (axis order,
//! tolerances, travel limits and aperture geometry). Both are parsed once at
//! initialization; a `reinit` re-reads them from disk.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::axis::Axis;
use crate::geometry::Geometry;
use crate::position::Position;

/// Default location of the named-position table.
pub const DEFAULT_POSITIONS_FILE: &str = "config/pcu_configurations.toml";
/// Default location of the motor/geometry table.
pub const DEFAULT_MOTORS_FILE: &str = "config/motor_configurations.toml";

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Table validation error.
    #[error("config validation: {0}")]
    Validation(String),
    /// A user-selectable configuration violates the admissibility rules.
    #[error(
        "configuration {name} is invalid; check the motor and instrument \
         limits before reinitializing"
    )]
    InvalidConfiguration { name: String },
}

// ─── Raw TOML Shapes ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPosition {
    m1: f64,
    m2: f64,
    m3: f64,
    m4: f64,
}

impl From<&RawPosition> for Position {
    fn from(raw: &RawPosition) -> Self {
        Position::new(raw.m1, raw.m2, raw.m3, raw.m4)
    }
}

/// The positions file: three sections of named configurations.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionsConfig {
    base: BTreeMap<String, RawPosition>,
    fiber: BTreeMap<String, RawPosition>,
    mask: BTreeMap<String, RawPosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCenter {
    m1: f64,
    m2: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSafeRadius {
    fiber: f64,
    mask: f64,
}

/// The motors file: axis order, tolerances, limits and geometry constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotorsConfig {
    valid_motors: Vec<Axis>,
    kmirror_radius: f64,
    tolerance: HashMap<Axis, f64>,
    motor_limits: HashMap<Axis, [f64; 2]>,
    fiber_center: RawCenter,
    mask_center: RawCenter,
    safe_radius: RawSafeRadius,
}

// ─── Named Configurations ───────────────────────────────────────────

/// Which section of the positions file a configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Arbitrary stage positions (not user-selectable as instrument setups).
    Base,
    /// Fiber-bundle setups: (m1, m2) inside the fiber aperture, m4 may extend.
    Fiber,
    /// Pinhole-mask setups: (m1, m2) inside the mask aperture, m3 may extend.
    Mask,
}

/// A named, fully-specified stage position.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedConfig {
    name: String,
    family: Family,
    position: Position,
}

impl NamedConfig {
    /// Configuration name (lower-case, as written in the table).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// Target position.
    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Fiber and mask configurations are user-selectable instrument setups.
    pub fn is_user_selectable(&self) -> bool {
        matches!(self.family, Family::Fiber | Family::Mask)
    }
}

// ─── Store ──────────────────────────────────────────────────────────

/// Immutable store of named configurations plus the workspace geometry.
///
/// Built once at initialization and replaced wholesale on `reinit`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    configs: Vec<NamedConfig>,
    geometry: Geometry,
    axis_order: Vec<Axis>,
}

impl ConfigStore {
    /// Load and validate both tables from TOML files.
    pub fn load(positions_path: &Path, motors_path: &Path) -> Result<Self, ConfigError> {
        let positions = read_to_string(positions_path)?;
        let motors = read_to_string(motors_path)?;
        Self::from_strs(&positions, &motors)
    }

    /// Load and validate both tables from TOML strings (also used by tests).
    pub fn from_strs(positions_toml: &str, motors_toml: &str) -> Result<Self, ConfigError> {
        let positions: PositionsConfig = toml::from_str(positions_toml)
            .map_err(|e| ConfigError::Parse(format!("positions table: {e}")))?;
        let motors: MotorsConfig = toml::from_str(motors_toml)
            .map_err(|e| ConfigError::Parse(format!("motors table: {e}")))?;
        Self::from_parts(&positions, &motors)
    }

    /// Assemble the store from parsed tables, running structural validation.
    pub fn from_parts(
        positions: &PositionsConfig,
        motors: &MotorsConfig,
    ) -> Result<Self, ConfigError> {
        let geometry = build_geometry(motors)?;
        let axis_order = validate_axis_order(&motors.valid_motors)?;

        let mut configs = Vec::new();
        for (family, section) in [
            (Family::Base, &positions.base),
            (Family::Fiber, &positions.fiber),
            (Family::Mask, &positions.mask),
        ] {
            for (name, raw) in section {
                if configs.iter().any(|c: &NamedConfig| c.name == *name) {
                    return Err(ConfigError::Validation(format!(
                        "duplicate configuration name {name}"
                    )));
                }
                configs.push(NamedConfig {
                    name: name.clone(),
                    family,
                    position: raw.into(),
                });
            }
        }

        Ok(Self {
            configs,
            geometry,
            axis_order,
        })
    }

    /// Workspace geometry constants.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The declared axis order; authoritative for move decomposition.
    pub fn axis_order(&self) -> &[Axis] {
        &self.axis_order
    }

    /// Look up a configuration by name.
    pub fn lookup(&self, name: &str) -> Option<&NamedConfig> {
        self.configs.iter().find(|c| c.name == name)
    }

    /// All configurations, base family first.
    pub fn all(&self) -> impl Iterator<Item = &NamedConfig> {
        self.configs.iter()
    }

    /// User-selectable (fiber + mask) configurations.
    pub fn user_selectable(&self) -> impl Iterator<Item = &NamedConfig> {
        self.configs.iter().filter(|c| c.is_user_selectable())
    }

    /// Check every user-selectable configuration against the admissibility
    /// rules, naming the first offender.
    pub fn validate_user_configs(&self) -> Result<(), ConfigError> {
        for config in self.user_selectable() {
            if !self.geometry.is_valid(&config.position) {
                return Err(ConfigError::InvalidConfiguration {
                    name: config.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Name of the configuration a sampled position matches within
    /// tolerance, if any.
    pub fn match_position(&self, pos: &Position) -> Option<&str> {
        self.configs
            .iter()
            .find(|c| self.geometry.matches(pos, &c.position))
            .map(|c| c.name.as_str())
    }
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn validate_axis_order(valid_motors: &[Axis]) -> Result<Vec<Axis>, ConfigError> {
    for axis in Axis::ALL {
        let count = valid_motors.iter().filter(|&&a| a == axis).count();
        if count != 1 {
            return Err(ConfigError::Validation(format!(
                "valid_motors must list {axis} exactly once (found {count})"
            )));
        }
    }
    Ok(valid_motors.to_vec())
}

fn build_geometry(motors: &MotorsConfig) -> Result<Geometry, ConfigError> {
    let mut motor_limits = [(0.0, 0.0); Axis::COUNT];
    let mut tolerance = [0.0; Axis::COUNT];

    for axis in Axis::ALL {
        let [lo, hi] = *motors.motor_limits.get(&axis).ok_or_else(|| {
            ConfigError::Validation(format!("motor_limits missing {axis}"))
        })?;
        if lo > hi {
            return Err(ConfigError::Validation(format!(
                "motor_limits for {axis} are reversed: [{lo}, {hi}]"
            )));
        }
        motor_limits[axis.index()] = (lo, hi);

        let tol = *motors
            .tolerance
            .get(&axis)
            .ok_or_else(|| ConfigError::Validation(format!("tolerance missing {axis}")))?;
        if tol <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "tolerance for {axis} must be positive (got {tol})"
            )));
        }
        tolerance[axis.index()] = tol;
    }

    let RawSafeRadius { fiber, mask } = motors.safe_radius.clone();
    if fiber <= 0.0 || mask <= 0.0 {
        return Err(ConfigError::Validation(
            "safe_radius entries must be positive".to_string(),
        ));
    }
    if motors.kmirror_radius <= fiber.max(mask) {
        return Err(ConfigError::Validation(format!(
            "kmirror_radius ({}) must exceed both safe radii",
            motors.kmirror_radius
        )));
    }

    Ok(Geometry {
        fiber_center: (motors.fiber_center.m1, motors.fiber_center.m2),
        mask_center: (motors.mask_center.m1, motors.mask_center.m2),
        fiber_safe_radius: fiber,
        mask_safe_radius: mask,
        kmirror_radius: motors.kmirror_radius,
        motor_limits,
        tolerance,
    })
}
