use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Maximum number of log entries retained per task.
pub const MAX_TASK_LOGS: usize = 600;
/// Maximum number of file-write records retained per task.
pub const MAX_FILE_WRITES: usize = 200;

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO buffer. Pushing past capacity evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append an item, returning the evicted one when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

// ---------------------------------------------------------------------------
// TaskMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Plan,
    #[default]
    Build,
    Coding,
    Bugfix,
}

impl TaskMode {
    /// Whether approval must bind a workspace root before running.
    pub fn requires_workspace(&self) -> bool {
        !matches!(self, TaskMode::Plan)
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskMode::Plan => "plan",
            TaskMode::Build => "build",
            TaskMode::Coding => "coding",
            TaskMode::Bugfix => "bugfix",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plan" => Ok(TaskMode::Plan),
            "build" => Ok(TaskMode::Build),
            "coding" | "code" => Ok(TaskMode::Coding),
            "bugfix" | "fix" => Ok(TaskMode::Bugfix),
            other => Err(format!("unknown task mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus / TaskPhase
// ---------------------------------------------------------------------------

/// Lifecycle state of a task. Legal edges live in `ato_agents::state_machine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    WaitingApproval,
    Approved,
    Running,
    Testing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Planning => "planning",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Running => "running",
            TaskStatus::Testing => "testing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// UI-facing activity indicator, coarser than [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Idle,
    Thinking,
    Writing,
    Testing,
    Done,
    Error,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskPhase::Idle => "idle",
            TaskPhase::Thinking => "thinking",
            TaskPhase::Writing => "writing",
            TaskPhase::Testing => "testing",
            TaskPhase::Done => "done",
            TaskPhase::Error => "error",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    /// Step status only moves forward: pending -> in_progress -> completed | failed.
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        matches!(
            (self, target),
            (StepStatus::Pending, StepStatus::InProgress)
                | (StepStatus::InProgress, StepStatus::Completed)
                | (StepStatus::InProgress, StepStatus::Failed)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("step {step_id} cannot move from {from:?} to {to:?}")]
pub struct StepTransitionError {
    pub step_id: Uuid,
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub description: String,
    pub status: StepStatus,
    pub result: Option<String>,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: StepStatus::Pending,
            result: None,
        }
    }

    pub fn advance(
        &mut self,
        to: StepStatus,
        result: Option<String>,
    ) -> Result<(), StepTransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(StepTransitionError {
                step_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if result.is_some() {
            self.result = result;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// FileWrite / TestRun
// ---------------------------------------------------------------------------

/// One workspace mutation applied by a `write_file` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_changed: i64,
    pub diff_preview: String,
    pub timestamp: DateTime<Utc>,
}

/// One validation command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub command: String,
    pub exit_code: i32,
    pub success: bool,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub phase: TaskPhase,
    pub plan_summary: String,
    pub steps: Vec<Step>,
    pub logs: RingBuffer<LogEntry>,
    pub file_writes: RingBuffer<FileWrite>,
    pub test_runs: Vec<TestRun>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_step_index: usize,
    pub workspace_root: Option<PathBuf>,
    pub auto_run_pipeline: bool,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(
        goal: impl Into<String>,
        mode: TaskMode,
        workspace_root: Option<PathBuf>,
        auto_run_pipeline: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            mode,
            status: TaskStatus::Planning,
            phase: TaskPhase::Thinking,
            plan_summary: String::new(),
            steps: Vec::new(),
            logs: RingBuffer::new(MAX_TASK_LOGS),
            file_writes: RingBuffer::new(MAX_FILE_WRITES),
            test_runs: Vec::new(),
            created_at: now,
            updated_at: now,
            current_step_index: 0,
            workspace_root,
            auto_run_pipeline,
            cancel_requested: false,
            last_error: None,
        }
    }

    /// Append a log line, returning the stored entry.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        self.logs.push(entry.clone());
        self.updated_at = entry.timestamp;
        entry
    }

    pub fn record_file_write(&mut self, write: FileWrite) {
        self.file_writes.push(write);
        self.updated_at = Utc::now();
    }

    pub fn record_test_run(&mut self, run: TestRun) {
        self.test_runs.push(run);
        self.updated_at = Utc::now();
    }

    /// Move the step cursor forward. Never moves backwards.
    pub fn advance_cursor(&mut self, index: usize) {
        if index > self.current_step_index {
            self.current_step_index = index;
        }
    }

    /// Latch the cancellation flag. Once set it stays set.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, phase: TaskPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_first() {
        let mut buf = RingBuffer::new(3);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), None);
        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn task_log_never_exceeds_cap() {
        let mut task = Task::new("goal", TaskMode::Build, None, false);
        for i in 0..(MAX_TASK_LOGS + 50) {
            task.log(LogLevel::Info, format!("line {i}"));
        }
        assert_eq!(task.logs.len(), MAX_TASK_LOGS);
        assert_eq!(task.logs.iter().next().unwrap().message, "line 50");
        assert_eq!(
            task.logs.last().unwrap().message,
            format!("line {}", MAX_TASK_LOGS + 49)
        );
    }

    #[test]
    fn file_write_history_never_exceeds_cap() {
        let mut task = Task::new("goal", TaskMode::Build, None, false);
        for i in 0..(MAX_FILE_WRITES + 5) {
            task.record_file_write(FileWrite {
                path: format!("f{i}.txt"),
                bytes_before: 0,
                bytes_after: 1,
                bytes_changed: 1,
                diff_preview: String::new(),
                timestamp: Utc::now(),
            });
        }
        assert_eq!(task.file_writes.len(), MAX_FILE_WRITES);
        assert_eq!(task.file_writes.iter().next().unwrap().path, "f5.txt");
    }

    #[test]
    fn step_status_never_regresses() {
        let mut step = Step::new("do it");
        assert!(step.advance(StepStatus::Completed, None).is_err());
        step.advance(StepStatus::InProgress, None).unwrap();
        step.advance(StepStatus::Completed, Some("ok".into())).unwrap();
        assert!(step.advance(StepStatus::Pending, None).is_err());
        assert!(step.advance(StepStatus::InProgress, None).is_err());
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.result.as_deref(), Some("ok"));
    }

    #[test]
    fn cursor_is_monotonic() {
        let mut task = Task::new("goal", TaskMode::Build, None, false);
        task.advance_cursor(2);
        task.advance_cursor(1);
        assert_eq!(task.current_step_index, 2);
    }

    #[test]
    fn task_serializes_buffers_as_arrays() {
        let mut task = Task::new("goal", TaskMode::Coding, None, true);
        task.log(LogLevel::Stdout, "hello");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "planning");
        assert_eq!(json["mode"], "coding");
        assert_eq!(json["logs"][0]["level"], "stdout");
        assert!(json["file_writes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn mode_parses_aliases() {
        assert_eq!("Plan".parse::<TaskMode>().unwrap(), TaskMode::Plan);
        assert_eq!("fix".parse::<TaskMode>().unwrap(), TaskMode::Bugfix);
        assert!("deploy".parse::<TaskMode>().is_err());
        assert!(!TaskMode::Plan.requires_workspace());
        assert!(TaskMode::Bugfix.requires_workspace());
    }
}
