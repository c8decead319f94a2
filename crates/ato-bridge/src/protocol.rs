use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every notification the orchestrator broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskCreated,
    TaskStatusChanged,
    TaskPhaseChanged,
    TaskLog,
    PlanStarted,
    PlanReady,
    ApprovalRequired,
    TaskApproved,
    StepStarted,
    StepAction,
    StepCompleted,
    StepFailed,
    FileWritten,
    TestingStarted,
    TestCommandStarted,
    TestCommandOutput,
    TestCommandFinished,
    TaskFinished,
}

impl TaskEventKind {
    /// Kinds that carry workspace side effects (writes and command activity).
    pub fn is_side_effect(&self) -> bool {
        matches!(
            self,
            TaskEventKind::FileWritten
                | TaskEventKind::TestCommandStarted
                | TaskEventKind::TestCommandOutput
                | TaskEventKind::TestCommandFinished
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::TaskCreated => "task_created",
            TaskEventKind::TaskStatusChanged => "task_status_changed",
            TaskEventKind::TaskPhaseChanged => "task_phase_changed",
            TaskEventKind::TaskLog => "task_log",
            TaskEventKind::PlanStarted => "plan_started",
            TaskEventKind::PlanReady => "plan_ready",
            TaskEventKind::ApprovalRequired => "approval_required",
            TaskEventKind::TaskApproved => "task_approved",
            TaskEventKind::StepStarted => "step_started",
            TaskEventKind::StepAction => "step_action",
            TaskEventKind::StepCompleted => "step_completed",
            TaskEventKind::StepFailed => "step_failed",
            TaskEventKind::FileWritten => "file_written",
            TaskEventKind::TestingStarted => "testing_started",
            TaskEventKind::TestCommandStarted => "test_command_started",
            TaskEventKind::TestCommandOutput => "test_command_output",
            TaskEventKind::TestCommandFinished => "test_command_finished",
            TaskEventKind::TaskFinished => "task_finished",
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient notification about one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind, task_id: Uuid) -> Self {
        Self {
            kind,
            task_id,
            timestamp: Utc::now(),
            message: None,
            payload: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
