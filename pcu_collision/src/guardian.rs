//! Collision guardian state machine:
//! INIT / MONITORING / STOPPED / RESTRICTED / DISABLED / FAULT / TERMINATE.
//!
//! MONITORING validates the current and commanded positions every tick; an
//! inadmissible position triggers the stop-and-reset sequence (halt, wait,
//! disable, wait, re-latch commanded to current, wait, re-arm) and drops to
//! STOPPED. RESTRICTED recomputes the allowed-direction map from scratch
//! each tick, holds every other axis disabled, and enforces that commanded
//! values only move monotonically toward the safe region.
//!
//! Repeated diagnostics for a persisting cause are suppressed by a
//! `same_message` latch, cleared on any state or direction-map change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use pcu_common::channel::{ChannelBus, ChannelError, DoubleChannel, LatchedString, StringChannel};
use pcu_common::config::{ConfigError, ConfigStore, DEFAULT_MOTORS_FILE, DEFAULT_POSITIONS_FILE};
use pcu_common::motor::{MotorError, MotorSet};
use pcu_common::runtime::TickMachine;

use crate::restricted::{restricted_directions, DirectionMap, RestrictedAction};

/// Default pause between the steps of the stop-and-reset sequence.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

// ─── States ─────────────────────────────────────────────────────────

/// Guardian state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Reloading geometry and sampling positions.
    Init,
    /// Watching current and commanded positions.
    Monitoring,
    /// Unsafe position detected; stages held disabled.
    Stopped,
    /// Directional recovery in progress.
    Restricted,
    /// Guardian passive; stages may be driven freely.
    Disabled,
    /// Guardian down (e.g. fabric loss); requires `reinit`.
    Fault,
    /// Terminal.
    Terminate,
}

impl GuardState {
    /// Published state label.
    pub const fn name(self) -> &'static str {
        match self {
            GuardState::Init => "INIT",
            GuardState::Monitoring => "MONITORING",
            GuardState::Stopped => "STOPPED",
            GuardState::Restricted => "RESTRICTED",
            GuardState::Disabled => "DISABLED",
            GuardState::Fault => "FAULT",
            GuardState::Terminate => "TERMINATE",
        }
    }
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Options ────────────────────────────────────────────────────────

/// Construction parameters for [`CollisionGuardian`].
#[derive(Debug, Clone)]
pub struct GuardianOptions {
    /// Channel prefix of the PCU keyword space (the guardian serves its
    /// channels under `<prefix>:collisions`).
    pub prefix: String,
    /// Named-position table.
    pub positions_path: PathBuf,
    /// Motor/geometry table.
    pub motors_path: PathBuf,
    /// Pause between the steps of the stop-and-reset sequence.
    pub settle: Duration,
}

impl GuardianOptions {
    /// Defaults for a prefix: standard config paths, 0.5 s settle.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            positions_path: PathBuf::from(DEFAULT_POSITIONS_FILE),
            motors_path: PathBuf::from(DEFAULT_MOTORS_FILE),
            settle: SETTLE_DELAY,
        }
    }
}

// ─── Internal Error ─────────────────────────────────────────────────

/// Failure that drops the tick into FAULT after a stop-and-disable.
#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Motor(#[from] MotorError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ─── Guardian ───────────────────────────────────────────────────────

/// The collision guardian.
pub struct CollisionGuardian {
    state: GuardState,
    store: ConfigStore,
    motors: MotorSet,

    metastate: StringChannel,
    request: LatchedString,
    homing_flag: DoubleChannel,

    allowed: DirectionMap,
    same_message: bool,
    settle: Duration,

    positions_path: PathBuf,
    motors_path: PathBuf,
}

impl CollisionGuardian {
    /// Load the configuration tables, serve the guardian's channels and
    /// return the machine in INIT.
    pub fn new(bus: Arc<dyn ChannelBus>, options: GuardianOptions) -> Result<Self, ConfigError> {
        let store = ConfigStore::load(&options.positions_path, &options.motors_path)?;
        let prefix = options.prefix.as_str();

        bus.register_string(&format!("{prefix}:collisions:stst"), GuardState::Init.name());
        bus.register_string(&format!("{prefix}:collisions:request"), "");
        bus.register_double(&format!("{prefix}:homing"), 0.0);

        let motors = MotorSet::new(&bus, prefix, store.axis_order());

        Ok(Self {
            state: GuardState::Init,
            motors,
            metastate: StringChannel::new(Arc::clone(&bus), format!("{prefix}:collisions:stst")),
            request: LatchedString::new(Arc::clone(&bus), format!("{prefix}:collisions:request")),
            homing_flag: DoubleChannel::new(Arc::clone(&bus), format!("{prefix}:homing")),
            allowed: DirectionMap::empty(),
            same_message: false,
            settle: options.settle,
            positions_path: options.positions_path,
            motors_path: options.motors_path,
            store,
        })
    }

    /// Current state.
    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Allowed-direction map (meaningful in RESTRICTED).
    pub fn allowed(&self) -> DirectionMap {
        self.allowed
    }

    /// Ingest requests, run one state step, publish the metastate.
    pub fn tick(&mut self) {
        let result = match self.state {
            GuardState::Init => self.tick_init(),
            GuardState::Monitoring => self.tick_monitoring(),
            GuardState::Stopped => self.tick_stopped(),
            GuardState::Restricted => self.tick_restricted(),
            GuardState::Disabled => self.tick_disabled(),
            GuardState::Fault => self.tick_fault(),
            GuardState::Terminate => Ok(()),
        };
        if let Err(e) = result {
            error!("{e}");
            self.stop_and_disable();
            self.transition(GuardState::Fault);
        }
        let _ = self.metastate.set(self.state.name());
    }

    fn transition(&mut self, next: GuardState) {
        if next != self.state {
            info!("guardian: {} -> {}", self.state, next);
            self.state = next;
            self.same_message = false;
        }
    }

    // ─── State Steps ────────────────────────────────────────────────

    fn tick_init(&mut self) -> Result<(), TickError> {
        match ConfigStore::load(&self.positions_path, &self.motors_path) {
            Ok(store) => self.store = store,
            Err(e) => {
                error!("{e}");
                self.transition(GuardState::Fault);
                return Ok(());
            }
        }

        // Cancel any queued targets before watching them.
        self.motors.reset_all()?;
        self.motors.go_all()?;

        if self.check_all_pos()? {
            self.transition(GuardState::Monitoring);
        } else {
            self.transition(GuardState::Stopped);
        }
        Ok(())
    }

    fn tick_monitoring(&mut self) -> Result<(), TickError> {
        self.process_request()?;
        if self.state != GuardState::Monitoring {
            return Ok(());
        }
        // The sequencer owns the stages while homing; commanded values are
        // not meaningful until it is done.
        if self.homing_in_progress() {
            return Ok(());
        }
        if !self.check_all_pos()? {
            self.transition(GuardState::Stopped);
        }
        Ok(())
    }

    fn tick_stopped(&mut self) -> Result<(), TickError> {
        if self.motors.any_enabled()? {
            error!("motors cannot be enabled in STOPPED");
            self.stop_and_reset()?;
        }

        if !self.same_message {
            let current = self.motors.current_position()?;
            if self.store.geometry().is_valid(&current) {
                info!(
                    "current position {current} is valid; \
                     send reinit to resume normal monitoring"
                );
            } else {
                error!(
                    "current position is invalid: {current}; \
                     send allow_moves to enable directional recovery"
                );
            }
            self.same_message = true;
        }

        self.process_request()
    }

    fn tick_restricted(&mut self) -> Result<(), TickError> {
        self.process_request()?;
        if self.state != GuardState::Restricted {
            return Ok(());
        }

        let current = self.motors.current_position()?;
        let restriction = restricted_directions(&current, self.store.geometry());

        let map = match restriction.action {
            RestrictedAction::ManualReset => {
                if !self.same_message {
                    for note in &restriction.notes {
                        error!("{note}");
                    }
                    self.same_message = true;
                }
                self.transition(GuardState::Stopped);
                return Ok(());
            }
            RestrictedAction::Directions(map) => map,
        };

        if map != self.allowed {
            self.allowed = map;
            self.same_message = false;
        }
        if !self.same_message {
            for note in &restriction.notes {
                error!("{note}");
            }
            if self.store.geometry().is_valid(&current) {
                info!(
                    "current position {current} is valid; \
                     send reinit to resume normal monitoring"
                );
            }
            self.same_message = true;
        }

        // Hold every axis outside the map disabled.
        for motor in self.motors.iter() {
            if map.get(motor.axis()).is_none() {
                motor.disable()?;
            }
        }

        // Commanded values must respect the allowed directions.
        let commanded = self.motors.commanded_position()?;
        for (axis, dir) in map.iter() {
            let (Some(cmd), Some(cur)) = (commanded.get(axis), current.get(axis)) else {
                continue;
            };
            if !dir.holds(cmd, cur) {
                error!(
                    "invalid move requested: {axis} commanded {cmd:.3} \
                     violates {} {cur:.3}",
                    dir.symbol()
                );
                self.stop_and_reset()?;
                self.transition(GuardState::Stopped);
                return Ok(());
            }
        }
        Ok(())
    }

    fn tick_disabled(&mut self) -> Result<(), TickError> {
        self.process_request()
    }

    fn tick_fault(&mut self) -> Result<(), TickError> {
        if !self.same_message {
            error!("the collision guardian is down; do not run the motors");
            self.same_message = true;
        }
        self.process_request()
    }

    // ─── Position Checks ────────────────────────────────────────────

    /// Validate the current and commanded positions; on a violation run the
    /// stop-and-reset sequence and return false.
    fn check_all_pos(&mut self) -> Result<bool, TickError> {
        let geometry = self.store.geometry();

        let current = self.motors.current_position()?;
        if !geometry.is_valid(&current) {
            error!("current position is invalid: {current}; disabling all motors");
            self.stop_and_reset()?;
            return Ok(false);
        }

        let commanded = self.motors.commanded_position()?;
        if !geometry.is_valid(&commanded) {
            error!("commanded position is invalid: {commanded}; disabling all motors");
            self.stop_and_reset()?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Halt, wait, disable, wait, re-latch commanded to current, wait,
    /// re-arm. The waits give the controller time to settle each step.
    fn stop_and_reset(&self) -> Result<(), MotorError> {
        self.motors.stop_all();
        std::thread::sleep(self.settle);
        self.motors.disable_all()?;
        std::thread::sleep(self.settle);
        self.motors.reset_all()?;
        std::thread::sleep(self.settle);
        self.motors.go_all()
    }

    /// Halt and disable without touching commanded values; never fails
    /// (used on disconnect paths).
    fn stop_and_disable(&self) {
        self.motors.stop_all();
        std::thread::sleep(self.settle);
        let _ = self.motors.disable_all();
        let _ = self.motors.go_all();
    }

    fn homing_in_progress(&self) -> bool {
        matches!(self.homing_flag.get(), Ok(v) if v != 0.0)
    }

    // ─── Request Processing ─────────────────────────────────────────

    fn process_request(&mut self) -> Result<(), TickError> {
        let Some(raw) = self.request.take()? else {
            return Ok(());
        };
        match raw.to_ascii_lowercase().as_str() {
            "enable" => {
                if self.state == GuardState::Monitoring {
                    error!("collision avoidance is already enabled");
                } else {
                    self.try_reinit()?;
                }
            }
            "reinit" => self.try_reinit()?,
            "allow_moves" => match self.state {
                GuardState::Stopped => {
                    info!("enabling directional moves for safe axes");
                    self.motors.reset_all()?;
                    self.motors.go_all()?;
                    self.allowed = DirectionMap::empty();
                    self.transition(GuardState::Restricted);
                }
                GuardState::Restricted => error!("directional moves are already enabled"),
                GuardState::Fault => error!("reinitialize the guardian before moving"),
                _ => error!("all moves are enabled"),
            },
            "disable" => {
                if self.state == GuardState::Fault {
                    error!("cannot disable from the FAULT state");
                } else {
                    let current = self.motors.current_position()?;
                    if !self.store.geometry().is_valid(&current) {
                        warn!(
                            "the PCU is in an invalid position; mind the hardware \
                             limits before driving the stages"
                        );
                    }
                    self.transition(GuardState::Disabled);
                }
            }
            "shutdown" | "abort" => {
                self.stop_and_disable();
                self.transition(GuardState::Terminate);
            }
            other => warn!("unknown request: {other}"),
        }
        Ok(())
    }

    fn try_reinit(&mut self) -> Result<(), TickError> {
        if matches!(self.state, GuardState::Monitoring | GuardState::Fault) {
            self.transition(GuardState::Init);
            return Ok(());
        }
        let current = self.motors.current_position()?;
        if self.store.geometry().is_valid(&current) {
            self.transition(GuardState::Init);
        } else {
            error!("cannot reinitialize from an invalid position");
        }
        Ok(())
    }
}

impl TickMachine for CollisionGuardian {
    fn name(&self) -> &'static str {
        "pcu-collision"
    }

    fn tick(&mut self) {
        CollisionGuardian::tick(self);
    }

    fn terminated(&self) -> bool {
        self.state == GuardState::Terminate
    }

    fn shutdown(&mut self) {
        self.stop_and_disable();
        self.transition(GuardState::Terminate);
    }
}
