use ato_core::types::{Task, TaskMode, TaskStatus};
use chrono::Utc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during task status transitions.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// The edge `from -> to` is not in the transition table.
    #[error("invalid transition: cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Every status reachable in one step from `from`. Terminal states have none.
pub fn allowed_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Planning => &[WaitingApproval, Failed, Cancelled],
        WaitingApproval => &[Approved, Failed, Cancelled],
        Approved => &[Running, Completed, Failed, Cancelled],
        Running => &[Testing, Completed, Failed, Cancelled],
        Testing => &[Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

/// Whether a task in `mode` may move from `from` to `to`.
///
/// `approved -> completed` is the plan-mode shortcut and is rejected for
/// every other mode.
pub fn can_transition(mode: TaskMode, from: TaskStatus, to: TaskStatus) -> bool {
    if from == TaskStatus::Approved && to == TaskStatus::Completed && mode != TaskMode::Plan {
        return false;
    }
    allowed_transitions(from).contains(&to)
}

/// Apply `to` to `task`, returning the previous status.
pub fn transition(task: &mut Task, to: TaskStatus) -> Result<TaskStatus, StateMachineError> {
    let from = task.status;
    if !can_transition(task.mode, from, to) {
        return Err(StateMachineError::InvalidTransition { from, to });
    }
    debug!(task_id = %task.id, %from, %to, "task transition");
    task.status = to;
    task.updated_at = Utc::now();
    Ok(from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(allowed_transitions(status).is_empty());
        }
    }

    #[test]
    fn plan_shortcut_only_in_plan_mode() {
        assert!(can_transition(
            TaskMode::Plan,
            TaskStatus::Approved,
            TaskStatus::Completed
        ));
        assert!(!can_transition(
            TaskMode::Build,
            TaskStatus::Approved,
            TaskStatus::Completed
        ));
    }

    #[test]
    fn transition_updates_status() {
        let mut task = Task::new("goal", TaskMode::Build, None, true);
        let prev = transition(&mut task, TaskStatus::WaitingApproval).unwrap();
        assert_eq!(prev, TaskStatus::Planning);
        assert_eq!(task.status, TaskStatus::WaitingApproval);
    }

    #[test]
    fn invalid_transition_leaves_status_unchanged() {
        let mut task = Task::new("goal", TaskMode::Build, None, true);
        let err = transition(&mut task, TaskStatus::Running).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Planning);
    }
}
