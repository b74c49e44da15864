//! Motion planner: goal → ordered move queue.
//!
//! Goals arrive either as a named configuration or as a single offset move.
//! The planner decomposes them into axis-at-a-time absolute moves (named
//! goals) or an XY-then-Z pair (offsets), and prefixes the queue with a
//! full Z retraction whenever the current and destination positions are not
//! in-hole-compatible. Per-axis moves keep translation and extension from
//! happening at once and bound the blast radius of a failed axis.
//!
//! Planning is pure: identical inputs yield an identical queue.

use heapless::Deque;
use thiserror::Error;

use pcu_common::config::{ConfigStore, NamedConfig};
use pcu_common::position::{Move, Position};

/// Worst-case queue depth: Z retraction plus one move per axis.
pub const MOVE_QUEUE_DEPTH: usize = 8;

/// FIFO queue of planned moves, drained by the sequencer.
pub type MoveQueue = Deque<Move, MOVE_QUEUE_DEPTH>;

/// Planning error; surfaced to the requesting client as a diagnostic.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The goal resolves to a position that violates the admissibility
    /// rules.
    #[error("invalid destination position: {0}")]
    InvalidDestination(Position),
    /// The goal produced more moves than the queue can hold.
    #[error("planned sequence exceeds the move queue depth")]
    QueueOverflow,
}

fn push(queue: &mut MoveQueue, mv: Move) -> Result<(), PlanError> {
    queue.push_back(mv).map_err(|_| PlanError::QueueOverflow)
}

/// Plan a transition to a named configuration.
///
/// Emits one absolute move per axis in the declared axis order (XY before
/// Z), preceded by the Z retraction when the endpoints do not share a safe
/// aperture.
pub fn plan_goto(
    current: &Position,
    config: &NamedConfig,
    store: &ConfigStore,
) -> Result<MoveQueue, PlanError> {
    let geometry = store.geometry();
    let destination = *config.position();
    if !geometry.is_valid(&destination) {
        return Err(PlanError::InvalidDestination(destination));
    }

    let mut queue = MoveQueue::new();
    if !geometry.move_in_hole(current, &destination) {
        push(&mut queue, Move::retract_z())?;
    }
    for &axis in store.axis_order() {
        if let Some(target) = destination.get(axis) {
            push(&mut queue, Move::absolute().with(axis, target))?;
        }
    }
    Ok(queue)
}

/// Plan an offset (or absolute mini-move) from the current position.
///
/// The XY component is queued first, then the Z component, each as one
/// combined move.
pub fn plan_offset(
    current: &Position,
    request: &Move,
    store: &ConfigStore,
) -> Result<MoveQueue, PlanError> {
    let geometry = store.geometry();
    let destination = *current + request;
    if !geometry.is_valid(&destination) {
        return Err(PlanError::InvalidDestination(destination));
    }

    let mut queue = MoveQueue::new();
    if !geometry.move_in_hole(current, &destination) {
        push(&mut queue, Move::retract_z())?;
    }
    let xy = request.xy();
    if !xy.is_empty() {
        push(&mut queue, xy)?;
    }
    let z = request.z();
    if !z.is_empty() {
        push(&mut queue, z)?;
    }
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcu_common::axis::Axis;

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
fiber_center2 = { m1 = 105.0, m2 = 55.0, m3 = 0.0, m4 = 30.0 }

[mask]
mask_center = { m1 = 200.0, m2 = 50.0, m3 = 25.0, m4 = 0.0 }
"#;

    fn store() -> ConfigStore {
        ConfigStore::from_strs(POSITIONS_TOML, MOTORS_TOML).unwrap()
    }

    fn moves(queue: &MoveQueue) -> Vec<Move> {
        queue.iter().copied().collect()
    }

    #[test]
    fn goto_with_retracted_stages_skips_retraction() {
        let store = store();
        let config = store.lookup("telescope").unwrap();
        let queue = plan_goto(&Position::zero(), config, &store).unwrap();
        assert_eq!(
            moves(&queue),
            vec![
                Move::absolute().with(Axis::M1, 10.0),
                Move::absolute().with(Axis::M2, 10.0),
                Move::absolute().with(Axis::M3, 0.0),
                Move::absolute().with(Axis::M4, 0.0),
            ]
        );
    }

    #[test]
    fn goto_within_fiber_hole_keeps_fiber_extended() {
        let store = store();
        let current = Position::new(100.0, 50.0, 0.0, 5.0);
        let config = store.lookup("fiber_center2").unwrap();
        let queue = plan_goto(&current, config, &store).unwrap();
        // No retraction: both endpoints sit in the fiber hole.
        assert_eq!(
            moves(&queue),
            vec![
                Move::absolute().with(Axis::M1, 105.0),
                Move::absolute().with(Axis::M2, 55.0),
                Move::absolute().with(Axis::M3, 0.0),
                Move::absolute().with(Axis::M4, 30.0),
            ]
        );
    }

    #[test]
    fn goto_across_holes_retracts_first() {
        let store = store();
        let current = Position::new(100.0, 50.0, 0.0, 5.0);
        let config = store.lookup("mask_center").unwrap();
        let queue = plan_goto(&current, config, &store).unwrap();
        let planned = moves(&queue);
        assert_eq!(planned[0], Move::retract_z());
        assert_eq!(planned.len(), 5);
        // XY comes before the mask extension.
        assert_eq!(planned[1], Move::absolute().with(Axis::M1, 200.0));
        assert_eq!(planned[4], Move::absolute().with(Axis::M4, 0.0));
    }

    #[test]
    fn offset_out_of_fiber_hole_is_rejected() {
        let store = store();
        // Fiber extended in the hole; a +100 mm X offset would drag the
        // extended bundle out of bounds.
        let current = Position::new(100.0, 50.0, 0.0, 5.0);
        let request = Move::relative().with(Axis::M1, 100.0);
        let err = plan_offset(&current, &request, &store).unwrap_err();
        assert!(matches!(err, PlanError::InvalidDestination(_)));
    }

    #[test]
    fn offset_splits_xy_before_z() {
        let store = store();
        let current = Position::new(100.0, 50.0, 0.0, 5.0);
        let request = Move::relative()
            .with(Axis::M1, 2.0)
            .with(Axis::M2, -1.0)
            .with(Axis::M4, 3.0);
        let queue = plan_offset(&current, &request, &store).unwrap();
        assert_eq!(
            moves(&queue),
            vec![
                Move::relative().with(Axis::M1, 2.0).with(Axis::M2, -1.0),
                Move::relative().with(Axis::M4, 3.0),
            ]
        );
    }

    #[test]
    fn offset_limit_violation_is_rejected() {
        let store = store();
        let request = Move::relative().with(Axis::M1, 500.0);
        assert!(plan_offset(&Position::zero(), &request, &store).is_err());
    }

    #[test]
    fn planned_prefix_positions_stay_valid() {
        let store = store();
        let geometry = store.geometry();
        // Worst case: extended fiber in its hole, destination in the mask
        // hole with the mask extended.
        let start = Position::new(100.0, 50.0, 0.0, 5.0);
        let config = store.lookup("mask_center").unwrap();
        let queue = plan_goto(&start, config, &store).unwrap();

        let mut pos = start;
        assert!(geometry.is_valid(&pos));
        for mv in queue.iter() {
            pos = pos + mv;
            assert!(geometry.is_valid(&pos), "intermediate collision at {pos}");
        }
        assert_eq!(pos, *config.position());
    }

    #[test]
    fn planning_is_deterministic() {
        let store = store();
        let current = Position::new(100.0, 50.0, 0.0, 5.0);
        let config = store.lookup("mask_center").unwrap();
        let a = plan_goto(&current, config, &store).unwrap();
        let b = plan_goto(&current, config, &store).unwrap();
        assert_eq!(moves(&a), moves(&b));
    }
}
