//! Per-axis motor facade over the channel fabric.
//!
//! Each linear stage exposes a fixed set of scalar endpoints under
//! `<prefix>:ln:<axis>`. The facade binds the full set at construction (the
//! valid-motor list is known at start time, so no channels are synthesized
//! later) and is the only place the device naming appears.
//!
//! Device quirks, as wired on the real controller:
//!
//! - The software-enable channel is active-low: the stage is enabled when
//!   `enableRb` reads 0 and torque is on.
//! - Position commands are trigger-latched: write `posval`, then arm `go`.
//! - Positive `jog` deltas nudge in the forward direction (pending hardware
//!   verification).

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::axis::Axis;
use crate::channel::{ChannelBus, ChannelError, DoubleChannel};
use crate::position::Position;

/// Endpoint suffixes of one stage, in registration order.
pub const MOTOR_CHANNEL_SUFFIXES: [&str; 11] = [
    "posvalRb", "posval", "halt", "jog", "go", "home", "enable", "enableRb", "torque", "torqueRb",
    "movingRb",
];

/// Motor operation error.
#[derive(Debug, Error)]
pub enum MotorError {
    /// A required endpoint of this stage did not respond.
    #[error("motor {axis}: {source}")]
    Disconnected {
        axis: Axis,
        #[source]
        source: ChannelError,
    },
    /// A position command was issued to a disabled stage.
    #[error("motor {0} is disabled")]
    Disabled(Axis),
}

/// Facade over one stage's endpoints.
pub struct MotorFacade {
    axis: Axis,
    posval_rb: DoubleChannel,
    posval: DoubleChannel,
    halt: DoubleChannel,
    jog: DoubleChannel,
    go: DoubleChannel,
    home: DoubleChannel,
    enable: DoubleChannel,
    enable_rb: DoubleChannel,
    torque: DoubleChannel,
    torque_rb: DoubleChannel,
    moving_rb: DoubleChannel,
}

impl MotorFacade {
    /// Bind the endpoint set for one stage.
    pub fn new(bus: &Arc<dyn ChannelBus>, prefix: &str, axis: Axis) -> Self {
        let ch = |suffix: &str| {
            DoubleChannel::new(Arc::clone(bus), format!("{prefix}:ln:{axis}:{suffix}"))
        };
        Self {
            axis,
            posval_rb: ch("posvalRb"),
            posval: ch("posval"),
            halt: ch("halt"),
            jog: ch("jog"),
            go: ch("go"),
            home: ch("home"),
            enable: ch("enable"),
            enable_rb: ch("enableRb"),
            torque: ch("torque"),
            torque_rb: ch("torqueRb"),
            moving_rb: ch("movingRb"),
        }
    }

    /// The stage this facade drives.
    #[inline]
    pub fn axis(&self) -> Axis {
        self.axis
    }

    fn disconnected(&self, source: ChannelError) -> MotorError {
        MotorError::Disconnected {
            axis: self.axis,
            source,
        }
    }

    fn channels(&self) -> [&DoubleChannel; 11] {
        [
            &self.posval_rb,
            &self.posval,
            &self.halt,
            &self.jog,
            &self.go,
            &self.home,
            &self.enable,
            &self.enable_rb,
            &self.torque,
            &self.torque_rb,
            &self.moving_rb,
        ]
    }

    /// Verify every endpoint of this stage responds.
    pub fn check_connection(&self) -> Result<(), MotorError> {
        for channel in self.channels() {
            if !channel_connected(channel) {
                return Err(self.disconnected(ChannelError::Disconnected(
                    channel.name().to_string(),
                )));
            }
        }
        Ok(())
    }

    /// Current position readback [mm].
    pub fn read_position(&self) -> Result<f64, MotorError> {
        self.check_connection()?;
        self.posval_rb.get().map_err(|e| self.disconnected(e))
    }

    /// Last commanded position [mm].
    pub fn read_commanded(&self) -> Result<f64, MotorError> {
        self.check_connection()?;
        self.posval.get().map_err(|e| self.disconnected(e))
    }

    /// Command an absolute move and arm the trigger latch.
    pub fn set_position(&self, target: f64) -> Result<(), MotorError> {
        self.check_connection()?;
        if !self.is_enabled()? {
            return Err(MotorError::Disabled(self.axis));
        }
        self.posval.set(target).map_err(|e| self.disconnected(e))?;
        self.go.set(1.0).map_err(|e| self.disconnected(e))?;
        debug!("motor {}: commanded {target:.3} mm", self.axis);
        Ok(())
    }

    /// Relative nudge; positive deltas jog forward.
    pub fn jog(&self, delta: f64) -> Result<(), MotorError> {
        self.check_connection()?;
        self.jog.set(delta).map_err(|e| self.disconnected(e))
    }

    /// Begin axis homing. Completion is supervised by the caller.
    pub fn home(&self) -> Result<(), MotorError> {
        self.check_connection()?;
        self.home.set(1.0).map_err(|e| self.disconnected(e))
    }

    /// Halt motion immediately.
    ///
    /// Deliberately skips the connectivity check and swallows fabric errors:
    /// this is called from disconnect-handling paths and must never fail.
    pub fn stop(&self) {
        let _ = self.halt.set(1.0);
    }

    /// Enable torque and the (active-low) software enable.
    pub fn enable(&self) -> Result<(), MotorError> {
        self.check_connection()?;
        self.enable.set(0.0).map_err(|e| self.disconnected(e))?;
        self.torque.set(1.0).map_err(|e| self.disconnected(e))
    }

    /// Drop torque and set the (active-low) software enable off.
    pub fn disable(&self) -> Result<(), MotorError> {
        self.check_connection()?;
        self.torque.set(0.0).map_err(|e| self.disconnected(e))?;
        self.enable.set(1.0).map_err(|e| self.disconnected(e))
    }

    /// Whether the stage will accept motion.
    pub fn is_enabled(&self) -> Result<bool, MotorError> {
        self.check_connection()?;
        let sw = self.enable_rb.get().map_err(|e| self.disconnected(e))?;
        let torque = self.torque_rb.get().map_err(|e| self.disconnected(e))?;
        Ok(sw == 0.0 && torque != 0.0)
    }

    /// Whether the stage reports motion in progress.
    pub fn is_moving(&self) -> Result<bool, MotorError> {
        self.check_connection()?;
        let moving = self.moving_rb.get().map_err(|e| self.disconnected(e))?;
        Ok(moving != 0.0)
    }

    /// Re-latch the commanded value to the current position, cancelling a
    /// queued target.
    pub fn reset_position(&self) -> Result<(), MotorError> {
        self.check_connection()?;
        let current = self.posval_rb.get().map_err(|e| self.disconnected(e))?;
        self.posval.set(current).map_err(|e| self.disconnected(e))
    }

    /// Re-arm the trigger latch.
    pub fn go(&self) -> Result<(), MotorError> {
        self.check_connection()?;
        self.go.set(1.0).map_err(|e| self.disconnected(e))
    }
}

fn channel_connected(channel: &DoubleChannel) -> bool {
    channel.get().is_ok()
}

// ─── Motor Set ──────────────────────────────────────────────────────

/// All four stages, with a declared iteration order.
pub struct MotorSet {
    motors: [MotorFacade; Axis::COUNT],
    order: Vec<Axis>,
}

impl MotorSet {
    /// Build facades for every axis; `order` sets the iteration order.
    pub fn new(bus: &Arc<dyn ChannelBus>, prefix: &str, order: &[Axis]) -> Self {
        Self {
            motors: Axis::ALL.map(|a| MotorFacade::new(bus, prefix, a)),
            order: order.to_vec(),
        }
    }

    /// Facade for one axis.
    #[inline]
    pub fn get(&self, axis: Axis) -> &MotorFacade {
        &self.motors[axis.index()]
    }

    /// Facades in declared order.
    pub fn iter(&self) -> impl Iterator<Item = &MotorFacade> {
        self.order.iter().map(|&a| self.get(a))
    }

    /// Sample the current position of every stage.
    pub fn current_position(&self) -> Result<Position, MotorError> {
        let mut pos = Position::undefined();
        for motor in &self.motors {
            pos = pos.with(motor.axis(), motor.read_position()?);
        }
        Ok(pos)
    }

    /// Sample the commanded position of every stage.
    pub fn commanded_position(&self) -> Result<Position, MotorError> {
        let mut pos = Position::undefined();
        for motor in &self.motors {
            pos = pos.with(motor.axis(), motor.read_commanded()?);
        }
        Ok(pos)
    }

    /// Halt every stage; never fails.
    pub fn stop_all(&self) {
        for motor in &self.motors {
            motor.stop();
        }
    }

    /// Enable every stage.
    pub fn enable_all(&self) -> Result<(), MotorError> {
        for motor in &self.motors {
            motor.enable()?;
        }
        Ok(())
    }

    /// Disable every stage.
    pub fn disable_all(&self) -> Result<(), MotorError> {
        for motor in &self.motors {
            motor.disable()?;
        }
        Ok(())
    }

    /// Whether any stage is currently enabled.
    pub fn any_enabled(&self) -> Result<bool, MotorError> {
        for motor in &self.motors {
            if motor.is_enabled()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-latch every commanded value to the current position.
    pub fn reset_all(&self) -> Result<(), MotorError> {
        for motor in &self.motors {
            motor.reset_position()?;
        }
        Ok(())
    }

    /// Re-arm every trigger latch.
    pub fn go_all(&self) -> Result<(), MotorError> {
        for motor in &self.motors {
            motor.go()?;
        }
        Ok(())
    }
}
