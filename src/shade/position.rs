//! Open-loop position estimation.
//!
//! The URTSii reports nothing back, so a shade's position is inferred from
//! how long its motor has run. Travel speed is assumed constant over the full
//! range: `travel_time` seconds take the shade from 0% to 100%. Errors from
//! repeated partial moves accumulate until the next boundary move re-anchors
//! the estimate.

use crate::shade::command::Direction;

/// Seconds the motor must run to go from `current` to `target`.
///
/// Boundary targets (`<= 0` or `>= 100`) and an unknown start always use the
/// full travel time, which guarantees the shade reaches the end stop.
pub fn required_travel_secs(travel_time: f64, current: Option<u8>, target: i32) -> f64 {
    match current {
        Some(current) if target > 0 && target < 100 => {
            (travel_time * f64::from(target - i32::from(current)) / 100.0).abs()
        }
        _ => travel_time,
    }
}

/// Position after the motor ran `elapsed` seconds in `direction`.
///
/// - A run of at least `travel_time` snaps to the boundary, even from an
///   unknown position.
/// - A shorter run moves a known position proportionally, clamped to
///   `[0, 100]` and truncated.
/// - Anything else leaves the estimate untouched.
pub fn estimate_position(
    current: Option<u8>,
    direction: Option<Direction>,
    elapsed: f64,
    travel_time: f64,
) -> Option<u8> {
    let Some(direction) = direction else {
        return current;
    };
    let elapsed = elapsed.max(0.0);

    if elapsed >= travel_time {
        return Some(direction.boundary());
    }

    match current {
        Some(position) if elapsed > 0.0 => {
            let travel = elapsed / travel_time * 100.0;
            let moved = match direction {
                Direction::Up => f64::from(position) + travel,
                Direction::Down => f64::from(position) - travel,
            };
            Some(moved.clamp(0.0, 100.0) as u8)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_interpolation() {
        assert_eq!(required_travel_secs(10.0, Some(30), 80), 5.0);
        assert_eq!(required_travel_secs(10.0, Some(80), 30), 5.0);
        assert_eq!(required_travel_secs(8.0, Some(0), 50), 4.0);
        assert_eq!(required_travel_secs(8.0, Some(50), 50), 0.0);
    }

    #[test]
    fn test_boundary_and_unknown_use_full_travel() {
        for current in [None, Some(0), Some(40), Some(100)] {
            assert_eq!(required_travel_secs(8.0, current, 0), 8.0);
            assert_eq!(required_travel_secs(8.0, current, 100), 8.0);
            assert_eq!(required_travel_secs(8.0, current, -5), 8.0);
            assert_eq!(required_travel_secs(8.0, current, 105), 8.0);
        }
        assert_eq!(required_travel_secs(8.0, None, 50), 8.0);
    }

    #[test]
    fn test_interpolation_matches_formula_over_grid() {
        let travel = 13.0;
        for from in (0..=100u8).step_by(7) {
            for to in 1..100i32 {
                let expected = travel * (to - i32::from(from)).abs() as f64 / 100.0;
                let actual = required_travel_secs(travel, Some(from), to);
                assert!((actual - expected).abs() < 1e-9, "{from}->{to}");
            }
        }
    }

    #[test]
    fn test_full_run_snaps_to_boundary() {
        assert_eq!(estimate_position(None, Some(Direction::Down), 8.0, 8.0), Some(0));
        assert_eq!(estimate_position(Some(20), Some(Direction::Up), 30.0, 8.0), Some(100));
    }

    #[test]
    fn test_partial_run_moves_known_position() {
        assert_eq!(estimate_position(Some(30), Some(Direction::Up), 5.0, 10.0), Some(80));
        assert_eq!(estimate_position(Some(80), Some(Direction::Down), 2.5, 10.0), Some(55));
        // truncation
        assert_eq!(estimate_position(Some(0), Some(Direction::Up), 1.0, 3.0), Some(33));
    }

    #[test]
    fn test_partial_run_from_unknown_stays_unknown() {
        assert_eq!(estimate_position(None, Some(Direction::Up), 2.0, 8.0), None);
    }

    #[test]
    fn test_no_motion_is_idempotent() {
        assert_eq!(estimate_position(Some(42), None, 100.0, 8.0), Some(42));
        assert_eq!(estimate_position(Some(42), Some(Direction::Up), 0.0, 8.0), Some(42));
        assert_eq!(estimate_position(Some(42), Some(Direction::Up), -3.0, 8.0), Some(42));
    }

    #[test]
    fn test_result_always_clamped() {
        for start in [0u8, 1, 50, 99, 100] {
            for elapsed in [0.1, 1.0, 3.9, 7.99] {
                for direction in [Direction::Up, Direction::Down] {
                    let pos = estimate_position(Some(start), Some(direction), elapsed, 4.0);
                    assert!(matches!(pos, Some(p) if p <= 100));
                }
            }
        }
    }

    #[test]
    fn test_zero_travel_time_snaps() {
        assert_eq!(estimate_position(Some(50), Some(Direction::Up), 0.0, 0.0), Some(100));
        assert_eq!(required_travel_secs(0.0, Some(50), 70), 0.0);
    }
}
