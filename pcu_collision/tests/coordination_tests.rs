//! Cross-machine cooperation tests: sequencer and guardian on one bus.
//!
//! Both state machines are built against the same `InProcessBus` and the
//! same simulated stages, so the coordination paths run against the real
//! peer instead of a hand-written stand-in channel: the sequencer refusing
//! powered motion while the guardian reports FAULT, guardian motor writes
//! preempting the sequencer's next trigger, and the homing flag suspending
//! the guardian's geometry checks.

use std::sync::Arc;
use std::time::Duration;

use pcu_collision::{CollisionGuardian, GuardState, GuardianOptions};
use pcu_common::axis::Axis;
use pcu_common::channel::{ChannelBus, InProcessBus};
use pcu_common::sim::SimBench;
use pcu_sequencer::{PcuSequencer, SeqState, SequencerOptions};

const PREFIX: &str = "k1:ao:pcu";

const MOTORS_TOML: &str = r#"
valid_motors = ["m1", "m2", "m3", "m4"]
kmirror_radius = 50.0

[tolerance]
m1 = 0.01
m2 = 0.01
m3 = 0.01
m4 = 0.01

[motor_limits]
m1 = [-1.0, 300.0]
m2 = [-1.0, 300.0]
m3 = [-1.0, 40.0]
m4 = [-1.0, 40.0]

[fiber_center]
m1 = 100.0
m2 = 50.0

[mask_center]
m1 = 200.0
m2 = 50.0

[safe_radius]
fiber = 20.0
mask = 20.0
"#;

const POSITIONS_TOML: &str = r#"
[base]
telescope = { m1 = 10.0, m2 = 10.0, m3 = 0.0, m4 = 0.0 }

[fiber]
fiber_center = { m1 = 100.0, m2 = 50.0, m3 = 0.0, m4 = 30.0 }

[mask]
mask_center = { m1 = 200.0, m2 = 50.0, m3 = 25.0, m4 = 0.0 }
"#;

// ─── Harness ────────────────────────────────────────────────────────

struct Rig {
    bench: SimBench,
    seq: PcuSequencer,
    guardian: CollisionGuardian,
    _dir: tempfile::TempDir,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let positions = dir.path().join("pcu_configurations.toml");
    let motors = dir.path().join("motor_configurations.toml");
    std::fs::write(&positions, POSITIONS_TOML).unwrap();
    std::fs::write(&motors, MOTORS_TOML).unwrap();

    let bench = SimBench::new(PREFIX, 10.0, Duration::from_secs(1));
    let bus: Arc<dyn ChannelBus> = bench.bus.clone();

    let mut seq_options = SequencerOptions::new(PREFIX);
    seq_options.positions_path = positions.clone();
    seq_options.motors_path = motors.clone();
    seq_options.homing_verify_delay = Duration::ZERO;
    let seq = PcuSequencer::new(Arc::clone(&bus), seq_options).unwrap();

    let mut guardian_options = GuardianOptions::new(PREFIX);
    guardian_options.positions_path = positions;
    guardian_options.motors_path = motors;
    guardian_options.settle = Duration::ZERO;
    let guardian = CollisionGuardian::new(bus, guardian_options).unwrap();

    Rig {
        bench,
        seq,
        guardian,
        _dir: dir,
    }
}

impl Rig {
    fn bus(&self) -> Arc<InProcessBus> {
        self.bench.bus.clone()
    }

    fn write_str(&self, channel: &str, value: &str) {
        self.bus()
            .write_string(&format!("{PREFIX}:{channel}"), value)
            .unwrap();
    }

    fn read_str(&self, channel: &str) -> String {
        self.bus().read_string(&format!("{PREFIX}:{channel}")).unwrap()
    }

    fn read_num(&self, channel: &str) -> f64 {
        self.bus().read_double(&format!("{PREFIX}:{channel}")).unwrap()
    }

    fn write_motor(&self, axis: Axis, suffix: &str, value: f64) {
        self.bus()
            .write_double(&format!("{PREFIX}:ln:{axis}:{suffix}"), value)
            .unwrap();
    }

    /// First tick of both machines, then enable all stages.
    fn start(&mut self) {
        self.seq.tick();
        self.guardian.tick();
        assert_eq!(self.seq.state(), SeqState::InPos);
        assert_eq!(self.guardian.state(), GuardState::Monitoring);

        self.write_str("request", "enable");
        self.seq.tick();
        self.bench.step(1);
    }

    /// Interleave both machines with firmware steps until the sequencer
    /// leaves MOVING (bounded).
    fn run_moves(&mut self, max: usize) {
        for _ in 0..max {
            self.seq.tick();
            self.guardian.tick();
            self.bench.step(1);
            if self.seq.state() != SeqState::Moving {
                return;
            }
        }
        panic!("sequencer still MOVING after {max} iterations");
    }
}

// ─── Guardian FAULT Gates the Sequencer ─────────────────────────────

#[test]
fn guardian_fault_blocks_sequencer_until_reinit() {
    let mut rig = rig();
    rig.start();

    // Fabric loss drops the guardian into FAULT; its published metastate
    // is what the sequencer consults.
    rig.bus().sever(&format!("{PREFIX}:ln:m2:posvalRb"));
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Fault);
    assert_eq!(rig.read_str("collisions:stst"), "FAULT");

    rig.bus().restore(&format!("{PREFIX}:ln:m2:posvalRb"));
    rig.write_str("pos", "telescope");
    rig.seq.tick();
    assert_eq!(rig.seq.state(), SeqState::InPos);

    // Operator recovers the guardian; the same request is now accepted.
    rig.write_str("collisions:request", "reinit");
    rig.guardian.tick();
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);

    // The guardian's fault path disabled the stages on its way down.
    rig.write_str("request", "enable");
    rig.seq.tick();
    rig.bench.step(1);

    rig.write_str("pos", "telescope");
    rig.seq.tick();
    assert_eq!(rig.seq.state(), SeqState::Moving);

    rig.run_moves(20);
    assert_eq!(rig.seq.configuration(), Some("telescope"));
    // Every intermediate position was watched by the live guardian.
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);
}

// ─── Guardian Motor Writes Preempt the Sequencer ────────────────────

#[test]
fn guardian_stop_fails_the_sequencers_next_trigger() {
    let mut rig = rig();
    rig.start();

    // A client queues an unsafe extension behind the sequencer's back;
    // the guardian catches the commanded value, disables the stages and
    // re-latches the target.
    rig.write_motor(Axis::M3, "posval", 30.0);
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Stopped);
    assert_eq!(rig.read_num("ln:m3:posval"), 0.0);
    rig.bench.step(1); // firmware echoes the disables

    // The sequencer still accepts the goal, but its first trigger finds
    // the motor disabled: guardian writes are authoritative.
    rig.write_str("pos", "telescope");
    rig.seq.tick();
    assert_eq!(rig.seq.state(), SeqState::Moving);
    rig.seq.tick();
    assert_eq!(rig.seq.state(), SeqState::Fault);
}

// ─── Homing Coordination Flag ───────────────────────────────────────

#[test]
fn homing_flag_suspends_guardian_checks_end_to_end() {
    let mut rig = rig();
    rig.start();

    // A stranded extended mask: invalid the moment the guardian looks,
    // unless the homing flag is up.
    rig.bench.stage_mut(Axis::M3).place(35.0);

    rig.write_str("request", "home");
    rig.seq.tick();
    assert_eq!(rig.seq.state(), SeqState::Moving);
    assert_eq!(rig.read_num("homing"), 1.0);

    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);

    // Pre-arm the moving readbacks the start verification samples (the
    // stages tick synchronously in this bench).
    rig.write_motor(Axis::M3, "movingRb", 1.0);
    rig.write_motor(Axis::M4, "movingRb", 1.0);
    rig.seq.tick(); // trigger Z homing
    rig.bench.step(5);
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);

    rig.write_motor(Axis::M1, "movingRb", 1.0);
    rig.write_motor(Axis::M2, "movingRb", 1.0);
    rig.seq.tick(); // Z complete, trigger XY homing
    rig.bench.step(2);
    rig.seq.tick(); // XY complete: homing done, flag drops
    assert_eq!(rig.seq.state(), SeqState::InPos);
    assert_eq!(rig.read_num("homing"), 0.0);

    // Checks resume against the homed (valid) position and the re-latched
    // commanded values.
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);
    rig.guardian.tick();
    assert_eq!(rig.guardian.state(), GuardState::Monitoring);
}
