//! # PCU Sequencer Library
//!
//! High-level motion control for the PCU stage assembly. External clients
//! request named configurations or per-axis moves over the channel fabric;
//! the sequencer decomposes each goal into an ordered queue of axis moves
//! that never transits a collision geometry, supervises completion with
//! per-move timeouts, and publishes its metastate and position readbacks
//! every tick.
//!
//! ## Architecture
//!
//! 1. **Planner** — pure decomposition of a goal into a move queue,
//!    injecting the Z-retraction prefix whenever the endpoints are not
//!    in-hole-compatible.
//! 2. **Sequencer** — the INIT / INPOS / MOVING / FAULT / TERMINATE state
//!    machine owning the queue, the move timer and the served channels.
//!
//! The collision guardian (`pcu_collision`) runs independently; the
//! sequencer defers to it by raising the homing coordination flag and by
//! refusing powered motion while the guardian reports FAULT.

pub mod planner;
pub mod sequencer;

pub use planner::{MoveQueue, PlanError};
pub use sequencer::{PcuSequencer, SeqState, SequencerOptions};
