//! Failure-state transitions for monitored nodes.
//!
//! Pure computation: callers persist the returned mutations.

use crate::db::NodeStatus;

/// Consecutive failures at which a node (still below its down threshold)
/// enters `warning`. Fixed, unlike the user-configured failure threshold.
pub const WARNING_FAILURES: i64 = 2;

/// Mutations to persist after one probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    /// New value for `consecutive_failures`.
    pub consecutive_failures: i64,
    /// New status, or `None` when the status is unchanged.
    pub status: Option<NodeStatus>,
    /// True when a success cleared at least one prior failure.
    pub recovered: bool,
}

/// Compute the next state from the latest persisted counters and one probe
/// outcome. `last_check_at` is updated by the caller on every outcome.
///
/// The down rule is evaluated before the warning rule, so a threshold of 1
/// or 2 goes straight to `down`.
pub fn apply(
    status: NodeStatus,
    consecutive_failures: i64,
    failure_threshold: i64,
    success: bool,
) -> StateUpdate {
    if success {
        return StateUpdate {
            consecutive_failures: 0,
            status: (status != NodeStatus::Active).then_some(NodeStatus::Active),
            recovered: consecutive_failures >= 1,
        };
    }

    let count = consecutive_failures + 1;
    let next_status = if count >= failure_threshold {
        (status != NodeStatus::Down).then_some(NodeStatus::Down)
    } else if count == WARNING_FAILURES && status != NodeStatus::Warning {
        Some(NodeStatus::Warning)
    } else {
        None
    };

    StateUpdate {
        consecutive_failures: count,
        status: next_status,
        recovered: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_leaves_node_active() {
        let update = apply(NodeStatus::Active, 0, 3, false);
        assert_eq!(update.consecutive_failures, 1);
        assert_eq!(update.status, None);
    }

    #[test]
    fn second_failure_enters_warning() {
        let update = apply(NodeStatus::Active, 1, 3, false);
        assert_eq!(update.consecutive_failures, 2);
        assert_eq!(update.status, Some(NodeStatus::Warning));
    }

    #[test]
    fn threshold_failure_enters_down() {
        let update = apply(NodeStatus::Warning, 2, 3, false);
        assert_eq!(update.consecutive_failures, 3);
        assert_eq!(update.status, Some(NodeStatus::Down));
    }

    #[test]
    fn failures_past_threshold_stay_down() {
        let update = apply(NodeStatus::Down, 3, 3, false);
        assert_eq!(update.consecutive_failures, 4);
        assert_eq!(update.status, None);
    }

    #[test]
    fn threshold_of_one_skips_warning() {
        let update = apply(NodeStatus::Active, 0, 1, false);
        assert_eq!(update.consecutive_failures, 1);
        assert_eq!(update.status, Some(NodeStatus::Down));
    }

    #[test]
    fn down_rule_wins_over_warning_at_threshold_two() {
        let update = apply(NodeStatus::Active, 1, 2, false);
        assert_eq!(update.consecutive_failures, 2);
        assert_eq!(update.status, Some(NodeStatus::Down));
    }

    #[test]
    fn intermediate_failures_leave_warning_in_place() {
        // threshold 5: third and fourth failures change nothing.
        let update = apply(NodeStatus::Warning, 2, 5, false);
        assert_eq!(update.consecutive_failures, 3);
        assert_eq!(update.status, None);
        let update = apply(NodeStatus::Warning, 3, 5, false);
        assert_eq!(update.status, None);
    }

    #[test]
    fn single_success_recovers_from_down() {
        let update = apply(NodeStatus::Down, 5, 3, true);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.status, Some(NodeStatus::Active));
        assert!(update.recovered);
    }

    #[test]
    fn single_success_recovers_from_warning() {
        let update = apply(NodeStatus::Warning, 2, 3, true);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.status, Some(NodeStatus::Active));
        assert!(update.recovered);
    }

    #[test]
    fn success_on_healthy_node_is_idempotent() {
        let update = apply(NodeStatus::Active, 0, 3, true);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.status, None);
        assert!(!update.recovered);
    }

    #[test]
    fn success_clears_single_failure_without_status_change() {
        let update = apply(NodeStatus::Active, 1, 3, true);
        assert_eq!(update.consecutive_failures, 0);
        assert_eq!(update.status, None);
        assert!(update.recovered);
    }
}
