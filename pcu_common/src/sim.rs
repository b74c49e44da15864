//! Simulated stage firmware for bench testing.
//!
//! [`SimStage`] stands in for one axis of the motor controller: it consumes
//! the same endpoint set the facade drives (`posval`/`go`/`halt`/`jog`/
//! `home`/`enable`/`torque`) and integrates the readback toward the latched
//! target at constant velocity. The integration tests and the `--simulate`
//! mode of the binaries run one instance per axis.
//!
//! Device behavior mirrored from the real controller:
//!
//! - `go` latches whatever `posval` holds as the motion target, whether or
//!   not the stage is enabled; motion only happens with torque on. This is
//!   why the guardian resets commanded values before re-enabling stages.
//! - The software enable is active-low; `enableRb`/`torqueRb` echo the
//!   write channels.
//! - `halt` cancels the target (snaps it to the current position).

use std::sync::Arc;
use std::time::Duration;

use crate::axis::Axis;
use crate::channel::{ChannelBus, InProcessBus};

/// Simulated firmware for one stage.
pub struct SimStage {
    axis: Axis,
    bus: Arc<InProcessBus>,
    prefix: String,
    /// Travel speed [mm/s].
    velocity: f64,
    /// Simulated time step per tick.
    dt: Duration,
    target: f64,
    homing: bool,
}

impl SimStage {
    /// Register the stage's endpoints on the bus and return the firmware.
    ///
    /// The stage starts at 0 mm, disabled, with the commanded value latched
    /// to the current position.
    pub fn new(
        bus: &Arc<InProcessBus>,
        prefix: &str,
        axis: Axis,
        velocity: f64,
        dt: Duration,
    ) -> Self {
        let reg = |suffix: &str, initial: f64| {
            bus.register_double(&format!("{prefix}:ln:{axis}:{suffix}"), initial);
        };
        reg("posvalRb", 0.0);
        reg("posval", 0.0);
        reg("halt", 0.0);
        reg("jog", 0.0);
        reg("go", 0.0);
        reg("home", 0.0);
        reg("enable", 1.0); // active-low: starts disabled
        reg("enableRb", 1.0);
        reg("torque", 0.0);
        reg("torqueRb", 0.0);
        reg("movingRb", 0.0);

        Self {
            axis,
            bus: Arc::clone(bus),
            prefix: prefix.to_string(),
            velocity,
            dt,
            target: 0.0,
            homing: false,
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}:ln:{}:{}", self.prefix, self.axis, suffix)
    }

    fn read(&self, suffix: &str) -> f64 {
        self.bus.read_double(&self.name(suffix)).unwrap_or(0.0)
    }

    fn write(&self, suffix: &str, value: f64) {
        let _ = self.bus.write_double(&self.name(suffix), value);
    }

    /// Consume a trigger channel, returning its latched value.
    fn consume(&self, suffix: &str) -> f64 {
        let value = self.read(suffix);
        if value != 0.0 {
            self.write(suffix, 0.0);
        }
        value
    }

    fn enabled(&self) -> bool {
        self.read("enable") == 0.0 && self.read("torque") != 0.0
    }

    /// Teleport the stage (test setup): readback, commanded and target all
    /// jump to `position`.
    pub fn place(&mut self, position: f64) {
        self.write("posvalRb", position);
        self.write("posval", position);
        self.target = position;
    }

    /// Advance the firmware by one time step.
    pub fn tick(&mut self) {
        // Echo the enable/torque writes into the readbacks.
        self.write("enableRb", self.read("enable"));
        self.write("torqueRb", self.read("torque"));

        let position = self.read("posvalRb");

        if self.consume("halt") != 0.0 {
            // Halt cancels anything pending: triggers and the target.
            self.consume("go");
            self.consume("home");
            self.consume("jog");
            self.homing = false;
            self.target = position;
            self.write("movingRb", 0.0);
            return;
        }

        if self.consume("home") != 0.0 && self.enabled() {
            self.homing = true;
            self.target = 0.0;
        }

        let jog = self.consume("jog");
        if jog != 0.0 && self.enabled() {
            self.target = position + jog;
            self.write("posval", self.target);
        }

        // The trigger latch arms regardless of the enable state; motion
        // waits for torque.
        if self.consume("go") != 0.0 {
            self.target = self.read("posval");
            self.homing = false;
        }

        if !self.enabled() {
            self.write("movingRb", 0.0);
            return;
        }

        let error = self.target - position;
        let step = self.velocity * self.dt.as_secs_f64();
        if error.abs() <= step {
            if error != 0.0 {
                self.write("posvalRb", self.target);
            }
            self.homing = false;
            self.write("movingRb", 0.0);
        } else {
            self.write("posvalRb", position + step * error.signum());
            self.write("movingRb", 1.0);
        }
    }
}

/// A full four-stage bench: bus plus one [`SimStage`] per axis.
pub struct SimBench {
    /// Shared channel registry.
    pub bus: Arc<InProcessBus>,
    stages: [SimStage; Axis::COUNT],
}

impl SimBench {
    /// Build the bench with the given stage velocity and time step.
    pub fn new(prefix: &str, velocity: f64, dt: Duration) -> Self {
        let bus = Arc::new(InProcessBus::new());
        let stages = Axis::ALL.map(|axis| SimStage::new(&bus, prefix, axis, velocity, dt));
        Self { bus, stages }
    }

    /// Firmware for one axis.
    pub fn stage_mut(&mut self, axis: Axis) -> &mut SimStage {
        &mut self.stages[axis.index()]
    }

    /// Advance every stage by `n` time steps.
    pub fn step(&mut self, n: usize) {
        for _ in 0..n {
            for stage in &mut self.stages {
                stage.tick();
            }
        }
    }
}
