//! Tick-count countdown for move supervision.
//!
//! Timeouts are expressed in ticks rather than wall-clock time so the state
//! machines stay deterministic under test: the owning machine calls
//! [`TickTimer::tick`] exactly once per scheduler tick.

use std::time::Duration;

/// Countdown timer driven by the owning state machine's tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickTimer {
    remaining: Option<u64>,
}

impl TickTimer {
    /// Idle timer.
    pub const fn new() -> Self {
        Self { remaining: None }
    }

    /// Arm the countdown for the given number of ticks.
    pub fn start(&mut self, ticks: u64) {
        self.remaining = Some(ticks);
    }

    /// Disarm without expiring.
    pub fn stop(&mut self) {
        self.remaining = None;
    }

    /// Advance one tick.
    pub fn tick(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    /// Whether an armed countdown has run out.
    pub fn expired(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.remaining.is_some()
    }
}

/// Convert a wall-clock budget into a tick count, rounding up.
pub fn ticks_for(budget: Duration, tick_period: Duration) -> u64 {
    let period = tick_period.as_secs_f64();
    if period <= 0.0 {
        return u64::MAX;
    }
    (budget.as_secs_f64() / period).ceil() as u64
}
