//! Fixed-period tick loop for a state machine.
//!
//! Each state machine owns one task: every `tick_period` it ingests
//! requests, performs at most one state step and publishes its readbacks,
//! all inside [`TickMachine::tick`]. Pacing uses absolute deadlines so a
//! slow tick does not accumulate drift; a tick that overruns its period is
//! logged and the schedule realigns to now.
//!
//! Shutdown is cooperative: when the running flag drops (ctrl-c) the loop
//! asks the machine to terminate and keeps ticking until it reports
//! terminal, so motors are stopped from within the machine's own logic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// A tick-driven state machine hosted by [`run`].
pub trait TickMachine {
    /// Task name for logs.
    fn name(&self) -> &'static str;

    /// Ingest requests, perform one state step, publish readbacks.
    fn tick(&mut self);

    /// Whether the machine reached its terminal state.
    fn terminated(&self) -> bool;

    /// Request an orderly transition to the terminal state.
    fn shutdown(&mut self);
}

/// Drive a machine until it terminates or the running flag drops.
pub fn run(machine: &mut dyn TickMachine, tick_period: Duration, running: &AtomicBool) {
    info!(
        "{}: tick loop starting ({} ms period)",
        machine.name(),
        tick_period.as_millis()
    );

    let mut shutdown_requested = false;
    let mut next_wake = Instant::now() + tick_period;

    loop {
        if !running.load(Ordering::SeqCst) && !shutdown_requested {
            info!("{}: shutdown requested", machine.name());
            machine.shutdown();
            shutdown_requested = true;
        }

        machine.tick();

        if machine.terminated() {
            info!("{}: terminated", machine.name());
            return;
        }

        let now = Instant::now();
        match next_wake.checked_duration_since(now) {
            Some(remaining) if remaining > Duration::ZERO => {
                std::thread::sleep(remaining);
                next_wake += tick_period;
            }
            _ => {
                // Overrun: realign to now instead of spiralling.
                let behind = now.saturating_duration_since(next_wake);
                if behind > tick_period {
                    warn!(
                        "{}: tick overran its period by {} ms",
                        machine.name(),
                        behind.as_millis()
                    );
                } else {
                    debug!("{}: tick overran its period", machine.name());
                }
                next_wake = now + tick_period;
            }
        }
    }
}
