//! Sequencer state machine: INIT / INPOS / MOVING / FAULT / TERMINATE.
//!
//! One tick performs request ingestion, at most one state step, then
//! readback publication. The request channels are destructive-read latches
//! (see `pcu_common::channel`), so a client write is interpreted exactly
//! once however many ticks pass before the next one.
//!
//! Coordination with the collision guardian is one-way: the sequencer
//! raises `<prefix>:homing` around the homing sequence (the guardian
//! suspends its geometry checks while the flag is up) and refuses powered
//! motion while `<prefix>:collisions:stst` reads FAULT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use pcu_common::axis::Axis;
use pcu_common::channel::{
    ChannelBus, ChannelError, DoubleChannel, LatchedDouble, LatchedString, StringChannel,
    RESET_VAL,
};
use pcu_common::config::{ConfigError, ConfigStore, DEFAULT_MOTORS_FILE, DEFAULT_POSITIONS_FILE};
use pcu_common::motor::{MotorError, MotorSet};
use pcu_common::position::Move;
use pcu_common::runtime::TickMachine;
use pcu_common::timer::{ticks_for, TickTimer};

use crate::planner::{self, MoveQueue};

/// Home position of every stage [mm].
pub const HOME_MM: f64 = 0.0;
/// Completion budget for a regular triggered move.
pub const MOVE_TIME: Duration = Duration::from_secs(45);
/// Completion budget for an axis homing move.
pub const HOME_TIME: Duration = Duration::from_secs(360);
/// Default pause between starting a homing move and verifying motion.
pub const HOMING_VERIFY_DELAY: Duration = Duration::from_secs(1);

// ─── States ─────────────────────────────────────────────────────────

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    /// Loading and validating configuration.
    Init,
    /// Stationary; serving requests.
    InPos,
    /// Draining the move queue.
    Moving,
    /// Motion refused until `reinit`.
    Fault,
    /// Terminal.
    Terminate,
}

impl SeqState {
    /// Published state label.
    pub const fn name(self) -> &'static str {
        match self {
            SeqState::Init => "INIT",
            SeqState::InPos => "INPOS",
            SeqState::Moving => "MOVING",
            SeqState::Fault => "FAULT",
            SeqState::Terminate => "TERMINATE",
        }
    }
}

impl std::fmt::Display for SeqState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Options ────────────────────────────────────────────────────────

/// Construction parameters for [`PcuSequencer`].
#[derive(Debug, Clone)]
pub struct SequencerOptions {
    /// Channel prefix of the PCU keyword space.
    pub prefix: String,
    /// Tick period; timeouts are converted to tick counts with it.
    pub tick_period: Duration,
    /// Named-position table.
    pub positions_path: PathBuf,
    /// Motor/geometry table.
    pub motors_path: PathBuf,
    /// Pause before verifying that a homing move actually started.
    pub homing_verify_delay: Duration,
}

impl SequencerOptions {
    /// Defaults for a prefix: 0.5 s ticks, standard config paths.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tick_period: Duration::from_millis(500),
            positions_path: PathBuf::from(DEFAULT_POSITIONS_FILE),
            motors_path: PathBuf::from(DEFAULT_MOTORS_FILE),
            homing_verify_delay: HOMING_VERIFY_DELAY,
        }
    }
}

// ─── Internal Error ─────────────────────────────────────────────────

/// Failure that drops the tick into FAULT after stopping the motors.
#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Motor(#[from] MotorError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ─── Channel Bundles ────────────────────────────────────────────────

struct AxisChannels {
    axis: Axis,
    pos: LatchedDouble,
    offset: LatchedDouble,
    pos_rb: DoubleChannel,
    offset_rb: DoubleChannel,
}

// ─── Sequencer ──────────────────────────────────────────────────────

/// The PCU motion sequencer.
pub struct PcuSequencer {
    state: SeqState,
    store: ConfigStore,
    motors: MotorSet,

    metastate: StringChannel,
    request: LatchedString,
    pos_request: LatchedString,
    pos_rb: StringChannel,
    axes: Vec<AxisChannels>,
    guardian_state: StringChannel,
    homing_flag: DoubleChannel,

    queue: MoveQueue,
    current_move: Option<Move>,
    move_timer: TickTimer,
    move_ticks: u64,
    home_ticks: u64,
    homing: bool,
    homing_verify_delay: Duration,

    destination: Option<String>,
    configuration: Option<String>,

    positions_path: PathBuf,
    motors_path: PathBuf,
}

impl PcuSequencer {
    /// Load the configuration tables, serve the sequencer's channels and
    /// return the machine in INIT.
    pub fn new(bus: Arc<dyn ChannelBus>, options: SequencerOptions) -> Result<Self, ConfigError> {
        let store = ConfigStore::load(&options.positions_path, &options.motors_path)?;
        let prefix = options.prefix.as_str();

        bus.register_string(&format!("{prefix}:stst"), SeqState::Init.name());
        bus.register_string(&format!("{prefix}:pos"), "");
        bus.register_string(&format!("{prefix}:posRb"), "");
        bus.register_string(&format!("{prefix}:request"), "");
        bus.register_double(&format!("{prefix}:homing"), 0.0);

        let mut axes = Vec::with_capacity(Axis::COUNT);
        for &axis in store.axis_order() {
            bus.register_double(&format!("{prefix}:{axis}Pos"), RESET_VAL);
            bus.register_double(&format!("{prefix}:{axis}Offset"), RESET_VAL);
            bus.register_double(&format!("{prefix}:{axis}PosRb"), 0.0);
            bus.register_double(&format!("{prefix}:{axis}OffsetRb"), 0.0);
            axes.push(AxisChannels {
                axis,
                pos: LatchedDouble::new(Arc::clone(&bus), format!("{prefix}:{axis}Pos")),
                offset: LatchedDouble::new(Arc::clone(&bus), format!("{prefix}:{axis}Offset")),
                pos_rb: DoubleChannel::new(Arc::clone(&bus), format!("{prefix}:{axis}PosRb")),
                offset_rb: DoubleChannel::new(Arc::clone(&bus), format!("{prefix}:{axis}OffsetRb")),
            });
        }

        let motors = MotorSet::new(&bus, prefix, store.axis_order());

        Ok(Self {
            state: SeqState::Init,
            motors,
            metastate: StringChannel::new(Arc::clone(&bus), format!("{prefix}:stst")),
            request: LatchedString::new(Arc::clone(&bus), format!("{prefix}:request")),
            pos_request: LatchedString::new(Arc::clone(&bus), format!("{prefix}:pos")),
            pos_rb: StringChannel::new(Arc::clone(&bus), format!("{prefix}:posRb")),
            axes,
            guardian_state: StringChannel::new(
                Arc::clone(&bus),
                format!("{prefix}:collisions:stst"),
            ),
            homing_flag: DoubleChannel::new(Arc::clone(&bus), format!("{prefix}:homing")),
            queue: MoveQueue::new(),
            current_move: None,
            move_timer: TickTimer::new(),
            move_ticks: ticks_for(MOVE_TIME, options.tick_period),
            home_ticks: ticks_for(HOME_TIME, options.tick_period),
            homing: false,
            homing_verify_delay: options.homing_verify_delay,
            destination: None,
            configuration: None,
            positions_path: options.positions_path,
            motors_path: options.motors_path,
            store,
        })
    }

    /// Current state.
    pub fn state(&self) -> SeqState {
        self.state
    }

    /// Latched configuration name, if the PCU sits at a named position.
    pub fn configuration(&self) -> Option<&str> {
        self.configuration.as_deref()
    }

    /// Ingest requests, run one state step, publish readbacks.
    pub fn tick(&mut self) {
        let result = match self.state {
            SeqState::Init => self.tick_init(),
            SeqState::InPos => self.tick_inpos(),
            SeqState::Moving => self.tick_moving(),
            SeqState::Fault => self.tick_fault(),
            SeqState::Terminate => Ok(()),
        };
        if let Err(e) = result {
            error!("{e}");
            self.stop_motors();
            self.transition(SeqState::Fault);
        }
        self.publish_readbacks();
    }

    fn transition(&mut self, next: SeqState) {
        if next != self.state {
            info!("sequencer: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    // ─── INIT ───────────────────────────────────────────────────────

    fn tick_init(&mut self) -> Result<(), TickError> {
        match ConfigStore::load(&self.positions_path, &self.motors_path) {
            Ok(store) => {
                if let Err(e) = store.validate_user_configs() {
                    error!("{e}");
                    self.transition(SeqState::Fault);
                    return Ok(());
                }
                self.store = store;
            }
            Err(e) => {
                error!("{e}");
                self.transition(SeqState::Fault);
                return Ok(());
            }
        }

        let current = self.motors.current_position()?;
        self.configuration = self.store.match_position(&current).map(String::from);
        self.transition(SeqState::InPos);
        Ok(())
    }

    // ─── INPOS ──────────────────────────────────────────────────────

    fn tick_inpos(&mut self) -> Result<(), TickError> {
        self.process_request()?;
        if self.state != SeqState::InPos {
            return Ok(());
        }
        self.process_pos_request()?;
        if self.state != SeqState::InPos {
            return Ok(());
        }
        self.process_move_request()
    }

    // ─── MOVING ─────────────────────────────────────────────────────

    fn tick_moving(&mut self) -> Result<(), TickError> {
        self.process_request()?;
        if self.state != SeqState::Moving {
            return Ok(());
        }
        // Motion requests during a move are consumed and refused.
        self.process_pos_request()?;
        self.process_move_request()?;

        self.move_timer.tick();

        if self.move_complete()? {
            if let Some(next) = self.queue.pop_front() {
                info!("triggering move {next}");
                self.trigger_move(&next)?;
            } else {
                if self.homing {
                    self.end_home_sequence()?;
                } else {
                    info!("finished moving");
                }
                self.configuration = self.destination.take();
                self.transition(SeqState::InPos);
                return Ok(());
            }
        }

        if self.state == SeqState::Moving && self.move_timer.expired() {
            error!("move failed due to motor timeout");
            self.stop_motors();
            self.transition(SeqState::Fault);
        }
        Ok(())
    }

    /// Whether the in-flight move (if any) has finished.
    ///
    /// Regular moves complete when every commanded axis reads within
    /// tolerance of its target. Homing moves complete when the axis
    /// reports no motion *and* reads within tolerance of the home
    /// position, so a move that never started cannot pass as done.
    fn move_complete(&mut self) -> Result<bool, TickError> {
        let Some(mv) = self.current_move else {
            return Ok(true);
        };
        let geometry = self.store.geometry();
        for (axis, target) in mv.iter() {
            let motor = self.motors.get(axis);
            let current = motor.read_position()?;
            if self.homing {
                if motor.is_moving()? {
                    return Ok(false);
                }
                if !geometry.in_position(axis, current, HOME_MM) {
                    return Ok(false);
                }
            } else if !geometry.in_position(axis, current, target) {
                return Ok(false);
            }
        }
        info!("move complete: {mv}");
        self.current_move = None;
        self.move_timer.stop();
        Ok(true)
    }

    fn trigger_move(&mut self, mv: &Move) -> Result<(), TickError> {
        if self.homing {
            for (axis, _) in mv.iter() {
                let motor = self.motors.get(axis);
                motor.enable()?;
                motor.home()?;
            }
            std::thread::sleep(self.homing_verify_delay);
            for (axis, _) in mv.iter() {
                if !self.motors.get(axis).is_moving()? {
                    error!("motor {axis} is not homing; check the stages and reinitialize");
                    self.stop_motors();
                    self.transition(SeqState::Fault);
                    return Ok(());
                }
            }
            self.current_move = Some(*mv);
            self.move_timer.start(self.home_ticks);
            return Ok(());
        }

        for (axis, target) in mv.iter() {
            let motor = self.motors.get(axis);
            if !motor.is_enabled()? {
                error!("motor {axis} is not enabled");
                self.stop_motors();
                self.transition(SeqState::Fault);
                return Ok(());
            }
            motor.set_position(target)?;
        }
        self.current_move = Some(*mv);
        self.move_timer.start(self.move_ticks);
        Ok(())
    }

    // ─── FAULT ──────────────────────────────────────────────────────

    fn tick_fault(&mut self) -> Result<(), TickError> {
        if let Some(raw) = self.request.take()? {
            match raw.to_ascii_lowercase().as_str() {
                "reinit" => self.transition(SeqState::Init),
                "shutdown" | "abort" => {
                    self.stop_motors();
                    self.transition(SeqState::Terminate);
                }
                other => error!("request {other} refused in FAULT; reinitialize first"),
            }
        }
        if self.pos_request.take()?.is_some() {
            error!("reinitialize the sequencer before moving");
        }
        // Drain stale numeric requests so they cannot fire after reinit.
        let mut refused = false;
        for channels in &self.axes {
            refused |= channels.pos.take()?.is_some();
            refused |= channels.offset.take()?.is_some();
        }
        if refused {
            error!("moves are not available from FAULT");
        }
        Ok(())
    }

    // ─── Request Processing ─────────────────────────────────────────

    fn process_request(&mut self) -> Result<(), TickError> {
        let Some(raw) = self.request.take()? else {
            return Ok(());
        };
        match raw.to_ascii_lowercase().as_str() {
            "shutdown" => {
                if self.state == SeqState::Moving {
                    error!("aborting sequencer");
                    self.stop_motors();
                } else {
                    info!("shutting down sequencer");
                }
                self.transition(SeqState::Terminate);
            }
            "abort" => {
                self.stop_motors();
                self.transition(SeqState::Terminate);
            }
            "enable" => {
                if self.state == SeqState::InPos {
                    self.motors.enable_all()?;
                } else {
                    error!("sequencer must be in INPOS to enable motors");
                }
            }
            "disable" => match self.state {
                SeqState::InPos => self.motors.disable_all()?,
                SeqState::Moving => {
                    self.stop_motors();
                    self.motors.disable_all()?;
                    self.transition(SeqState::InPos);
                }
                _ => error!("cannot disable motors from state {}", self.state),
            },
            "clear_pos" => {
                if self.state == SeqState::InPos {
                    self.configuration = None;
                } else {
                    error!("no named position is set");
                }
            }
            "stop" => {
                if self.state == SeqState::Moving {
                    self.stop_motors();
                    self.transition(SeqState::InPos);
                } else {
                    error!("PCU is not moving");
                }
            }
            "reinit" => {
                if self.state == SeqState::Moving {
                    error!("send stop signal before reinitializing");
                } else {
                    self.transition(SeqState::Init);
                }
            }
            "home" => {
                if self.state != SeqState::InPos {
                    error!("cannot home motors from state {}", self.state);
                } else if self.guardian_faulted() {
                    error!("collision guardian is in FAULT; refusing powered motion");
                } else {
                    info!("homing motors");
                    self.load_home_sequence()?;
                    self.transition(SeqState::Moving);
                }
            }
            other => warn!("unknown request: {other}"),
        }
        Ok(())
    }

    fn process_pos_request(&mut self) -> Result<(), TickError> {
        let Some(raw) = self.pos_request.take()? else {
            return Ok(());
        };
        let name = raw.to_ascii_lowercase();
        match self.state {
            SeqState::Moving => error!("send stop signal before moving to a new position"),
            SeqState::InPos => {
                if self.guardian_faulted() {
                    error!("collision guardian is in FAULT; refusing powered motion");
                    return Ok(());
                }
                let Some(config) = self.store.lookup(&name).cloned() else {
                    error!("invalid configuration: {name}");
                    return Ok(());
                };
                let current = self.motors.current_position()?;
                match planner::plan_goto(&current, &config, &self.store) {
                    Ok(queue) => {
                        info!("loading {name}");
                        self.queue = queue;
                        self.current_move = None;
                        self.configuration = None;
                        self.destination = Some(name);
                        self.transition(SeqState::Moving);
                    }
                    Err(e) => error!("{e}"),
                }
            }
            _ => error!("moves not available from state {}", self.state),
        }
        Ok(())
    }

    fn process_move_request(&mut self) -> Result<(), TickError> {
        let Some(request) = self.collect_requested_move()? else {
            return Ok(());
        };
        match self.state {
            SeqState::Moving => {
                error!("PCU is moving; send stop signal before moving to a new position");
            }
            SeqState::InPos => {
                if self.guardian_faulted() {
                    error!("collision guardian is in FAULT; refusing powered motion");
                    return Ok(());
                }
                let current = self.motors.current_position()?;
                match planner::plan_offset(&current, &request, &self.store) {
                    Ok(queue) => {
                        info!("loading requested move {request}");
                        self.queue = queue;
                        self.current_move = None;
                        self.configuration = None;
                        self.destination = None;
                        self.transition(SeqState::Moving);
                    }
                    Err(e) => error!("{e}"),
                }
            }
            _ => error!("moves not valid from state {}", self.state),
        }
        Ok(())
    }

    /// Assemble one move from the per-axis request channels.
    ///
    /// Absolute requests win; offset latches left set alongside an absolute
    /// request stay pending for the next tick.
    fn collect_requested_move(&self) -> Result<Option<Move>, TickError> {
        let mut absolute = Move::absolute();
        for channels in &self.axes {
            if let Some(value) = channels.pos.take()? {
                absolute = absolute.with(channels.axis, value);
            }
        }
        if !absolute.is_empty() {
            return Ok(Some(absolute));
        }

        let mut relative = Move::relative();
        for channels in &self.axes {
            if let Some(value) = channels.offset.take()? {
                relative = relative.with(channels.axis, value);
            }
        }
        Ok((!relative.is_empty()).then_some(relative))
    }

    // ─── Motion Helpers ─────────────────────────────────────────────

    fn enqueue(&mut self, mv: Move) {
        if self.queue.push_back(mv).is_err() {
            error!("move queue overflow; dropping {mv}");
        }
    }

    fn load_home_sequence(&mut self) -> Result<(), TickError> {
        self.homing = true;
        self.homing_flag.set(1.0)?;
        self.configuration = None;
        self.destination = None;
        self.queue.clear();
        self.enqueue(Move::absolute().with(Axis::M3, HOME_MM).with(Axis::M4, HOME_MM));
        self.enqueue(Move::absolute().with(Axis::M1, HOME_MM).with(Axis::M2, HOME_MM));
        Ok(())
    }

    fn end_home_sequence(&mut self) -> Result<(), TickError> {
        info!("finished homing");
        self.homing = false;
        // Homing leaves the commanded values stale; re-latch them to the
        // homed positions before the guardian resumes its checks.
        self.motors.reset_all()?;
        self.homing_flag.set(0.0)?;
        Ok(())
    }

    /// Halt all motion and drop the queue; the configuration is unknown
    /// afterwards.
    fn stop_motors(&mut self) {
        error!("stopping all motors");
        self.current_move = None;
        self.queue.clear();
        self.move_timer.stop();
        self.configuration = None;
        self.destination = None;
        if self.homing {
            self.homing = false;
            let _ = self.homing_flag.set(0.0);
        }
        self.motors.stop_all();
    }

    fn guardian_faulted(&self) -> bool {
        matches!(self.guardian_state.get().as_deref(), Ok("FAULT"))
    }

    // ─── Readbacks ──────────────────────────────────────────────────

    /// Publish metastate, configuration and per-axis readbacks.
    ///
    /// Publication failures are swallowed: a dead fabric is already being
    /// handled by the state logic, and readbacks are best-effort.
    fn publish_readbacks(&mut self) {
        let meta = match self.state {
            SeqState::InPos => self
                .configuration
                .as_deref()
                .map(str::to_ascii_uppercase)
                .unwrap_or_else(|| "USER_DEF".to_string()),
            state => state.name().to_string(),
        };
        let _ = self.metastate.set(&meta);
        let _ = self.pos_rb.set(self.configuration.as_deref().unwrap_or(""));

        let latched = self
            .configuration
            .as_deref()
            .and_then(|name| self.store.lookup(name))
            .map(|config| *config.position());
        for channels in &self.axes {
            let Ok(current) = self.motors.get(channels.axis).read_position() else {
                continue;
            };
            let _ = channels.pos_rb.set(current);
            let offset = latched
                .and_then(|pos| pos.get(channels.axis))
                .map(|target| current - target)
                .unwrap_or(0.0);
            let _ = channels.offset_rb.set(offset);
        }
    }
}

impl TickMachine for PcuSequencer {
    fn name(&self) -> &'static str {
        "pcu-sequencer"
    }

    fn tick(&mut self) {
        PcuSequencer::tick(self);
    }

    fn terminated(&self) -> bool {
        self.state == SeqState::Terminate
    }

    fn shutdown(&mut self) {
        if self.state == SeqState::Moving {
            self.stop_motors();
        }
        self.transition(SeqState::Terminate);
    }
}
