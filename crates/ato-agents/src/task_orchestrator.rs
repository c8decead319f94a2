//! TaskOrchestrator -- drives a goal through plan -> approve -> run -> test.
//!
//! Tasks live in memory inside one orchestrator instance. Planning and the run
//! loop execute on spawned, supervised futures whose errors and panics all
//! funnel into the same failure path. Every state change, log line and side
//! effect is published on the [`EventBus`].
//!
//! Cancellation is sticky: `cancel_task` latches the flag, forces the status to
//! `cancelled`, aborts the in-flight model request and kills the running child
//! process. Side-effect events are published under the same lock that
//! cancellation takes, so none can follow a cancel.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ato_bridge::event_bus::EventBus;
use ato_bridge::protocol::{TaskEvent, TaskEventKind};
use ato_core::config::Config;
use ato_core::types::{
    LogLevel, StepStatus, StepTransitionError, Task, TaskMode, TaskPhase, TaskStatus, TestRun,
};
use ato_core::workspace::{
    validation_commands, FsWorkspaceStore, WorkspaceError, WorkspaceStore, WorkspaceWriter,
};
use ato_intelligence::runtime::DiagnosticsSnapshot;
use ato_intelligence::{
    provider_from_config, GenerateRequest, LlmError, ModelGateway, RequestKind,
    RuntimeDiagnostics,
};
use dashmap::DashMap;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actions::{decode_action, StepAction, SKIPPED_RESULT};
use crate::command_runner::{self, CommandOutput, OutputSink, OutputStream, ProcessRegistry, RunnerError};
use crate::planner::{self, PlanError};
use crate::prompts;
use crate::state_machine::{self, StateMachineError};

pub const PLANNING_FAILED: &str = "Planning failed";
pub const EXECUTION_FAILED: &str = "Execution failed";
pub const FILE_WRITES_DISABLED: &str = "File writes are disabled by settings";
pub const TERMINAL_DISABLED: &str = "Terminal commands are disabled by settings";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("{0}")]
    InvalidState(String),
    #[error("workspace required")]
    WorkspaceRequired,
    #[error(transparent)]
    Sandbox(#[from] WorkspaceError),
    #[error("{0}")]
    Provider(String),
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("command `{command}` failed with exit code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("task cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => TaskError::Cancelled,
            other => TaskError::Provider(other.to_string()),
        }
    }
}

impl From<PlanError> for TaskError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Provider(e) => e.into(),
            empty @ PlanError::EmptyOutput => TaskError::Provider(empty.to_string()),
        }
    }
}

impl From<StateMachineError> for TaskError {
    fn from(err: StateMachineError) -> Self {
        TaskError::InvalidState(err.to_string())
    }
}

impl From<StepTransitionError> for TaskError {
    fn from(err: StepTransitionError) -> Self {
        TaskError::Internal(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// CreateTask
// ---------------------------------------------------------------------------

/// Parameters for [`TaskOrchestrator::create_task`].
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub goal: String,
    pub mode: Option<TaskMode>,
    pub workspace_root: Option<PathBuf>,
    pub auto_run: Option<bool>,
}

impl CreateTask {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = Some(auto_run);
        self
    }
}

// ---------------------------------------------------------------------------
// TaskCtx -- a locked task plus the bus, for mutate-and-announce
// ---------------------------------------------------------------------------

struct TaskCtx<'a> {
    task: &'a mut Task,
    bus: &'a EventBus,
}

impl TaskCtx<'_> {
    fn emit(&self, kind: TaskEventKind, message: Option<String>, payload: Option<serde_json::Value>) {
        let mut event = TaskEvent::new(kind, self.task.id);
        event.message = message;
        event.payload = payload;
        self.bus.publish(event);
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = self.task.log(level, message);
        debug!(task_id = %self.task.id, log_level = ?level, message = %entry.message, "task log");
        self.emit(
            TaskEventKind::TaskLog,
            Some(entry.message),
            Some(json!({ "level": level })),
        );
    }

    fn set_status(&mut self, to: TaskStatus) -> Result<()> {
        let from = state_machine::transition(self.task, to)?;
        self.emit(
            TaskEventKind::TaskStatusChanged,
            Some(to.to_string()),
            Some(json!({ "from": from, "to": to })),
        );
        Ok(())
    }

    fn set_phase(&mut self, phase: TaskPhase) {
        if self.task.phase != phase {
            self.task.set_phase(phase);
            self.emit(
                TaskEventKind::TaskPhaseChanged,
                Some(phase.to_string()),
                Some(json!({ "phase": phase })),
            );
        }
    }

    fn finish(&self) {
        self.emit(
            TaskEventKind::TaskFinished,
            Some(self.task.status.to_string()),
            Some(json!({
                "status": self.task.status,
                "last_error": self.task.last_error,
            })),
        );
    }
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

struct Inner {
    tasks: Mutex<HashMap<Uuid, Task>>,
    tokens: DashMap<Uuid, CancellationToken>,
    processes: ProcessRegistry,
    gateway: ModelGateway,
    store: Arc<dyn WorkspaceStore>,
    config: RwLock<Config>,
    bus: EventBus,
}

/// Owns every task and the registries shared by their background work.
///
/// Cloning is cheap and yields a handle onto the same orchestrator.
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl TaskOrchestrator {
    pub fn new(
        gateway: ModelGateway,
        store: Arc<dyn WorkspaceStore>,
        config: Config,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                tokens: DashMap::new(),
                processes: ProcessRegistry::new(),
                gateway,
                store,
                config: RwLock::new(config),
                bus,
            }),
        }
    }

    /// Build the provider, gateway and filesystem store described by `config`.
    pub fn from_config(config: Config) -> std::result::Result<Self, LlmError> {
        let provider = provider_from_config(&config.providers)?;
        let gateway = ModelGateway::new(
            provider,
            RuntimeDiagnostics::new(),
            config.providers.clone(),
        );
        let store = Arc::new(FsWorkspaceStore::new(config.general.workspace_base_path()));
        Ok(Self::new(gateway, store, config, EventBus::new()))
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, Task>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace settings. Running tasks keep the permissions they started with.
    pub fn update_config(&self, config: Config) {
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn subscribe(&self) -> flume::Receiver<TaskEvent> {
        self.inner.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn gateway(&self) -> &ModelGateway {
        &self.inner.gateway
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.gateway.diagnostics().snapshot()
    }

    /// Mutate a task under the lock.
    fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut TaskCtx<'_>) -> Result<R>) -> Result<R> {
        let mut tasks = self.tasks();
        let task = tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        let mut ctx = TaskCtx {
            task,
            bus: &self.inner.bus,
        };
        f(&mut ctx)
    }

    /// Like [`update`](Self::update) but refuses once cancellation was requested.
    fn update_live<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TaskCtx<'_>) -> Result<R>,
    ) -> Result<R> {
        self.update(id, |ctx| {
            if ctx.task.cancel_requested {
                return Err(TaskError::Cancelled);
            }
            f(ctx)
        })
    }

    fn check_cancel(&self, id: Uuid, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        self.update_live(id, |_| Ok(()))
    }

    fn token(&self, id: Uuid) -> Result<CancellationToken> {
        self.inner
            .tokens
            .get(&id)
            .map(|t| t.clone())
            .ok_or(TaskError::NotFound(id))
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Register a new task and start planning it in the background.
    pub fn create_task(&self, request: CreateTask) -> Result<Task> {
        let goal = request.goal.trim();
        if goal.is_empty() {
            return Err(TaskError::Validation("goal must not be empty".into()));
        }
        let auto_run = request
            .auto_run
            .unwrap_or_else(|| self.config().pipeline.auto_run_default);
        let mut task = Task::new(
            goal,
            request.mode.unwrap_or_default(),
            request.workspace_root,
            auto_run,
        );
        let id = task.id;

        let snapshot = {
            let mut tasks = self.tasks();
            let mut ctx = TaskCtx {
                task: &mut task,
                bus: &self.inner.bus,
            };
            ctx.emit(
                TaskEventKind::TaskCreated,
                Some(ctx.task.goal.clone()),
                Some(json!({ "mode": ctx.task.mode, "auto_run_pipeline": auto_run })),
            );
            ctx.log(LogLevel::Info, format!("Task created in {} mode", ctx.task.mode));
            ctx.emit(TaskEventKind::PlanStarted, None, None);
            let snapshot = task.clone();
            tasks.insert(id, task);
            snapshot
        };
        self.inner.tokens.insert(id, CancellationToken::new());
        info!(task_id = %id, mode = %snapshot.mode, "task created");

        let this = self.clone();
        self.spawn_supervised(id, PLANNING_FAILED, async move { this.plan_task(id).await });
        Ok(snapshot)
    }

    /// Approve a planned task and start its run loop.
    pub fn approve_task(&self, id: Uuid) -> Result<Task> {
        // Resolved under the task lock so a concurrent cancel never orphans a new root.
        let snapshot = self.update(id, |ctx| {
            Self::check_approvable(ctx.task)?;
            let mode = ctx.task.mode;
            if mode.requires_workspace() && ctx.task.workspace_root.is_none() {
                match self.inner.store.resolve_or_create_workspace_root(&ctx.task.goal) {
                    Ok(root) => {
                        ctx.log(LogLevel::Info, format!("Workspace bound to {}", root.display()));
                        ctx.task.workspace_root = Some(root);
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "could not bind workspace root");
                        return Err(TaskError::WorkspaceRequired);
                    }
                }
            }
            ctx.set_status(TaskStatus::Approved)?;
            ctx.emit(TaskEventKind::TaskApproved, None, None);
            ctx.log(LogLevel::Info, "Plan approved");
            Ok(ctx.task.clone())
        })?;
        info!(task_id = %id, "task approved");

        let this = self.clone();
        self.spawn_supervised(id, EXECUTION_FAILED, async move { this.run_task(id).await });
        Ok(snapshot)
    }

    fn check_approvable(task: &Task) -> Result<()> {
        if task.cancel_requested || task.status == TaskStatus::Cancelled {
            return Err(TaskError::InvalidState("task was cancelled".into()));
        }
        if task.status != TaskStatus::WaitingApproval {
            return Err(TaskError::InvalidState(format!(
                "task is {}, expected waiting_approval",
                task.status
            )));
        }
        Ok(())
    }

    /// Cancel a task. Always succeeds for a known task.
    pub fn cancel_task(&self, id: Uuid) -> Result<Task> {
        let snapshot = self.update(id, |ctx| {
            ctx.task.request_cancel();
            if !ctx.task.is_terminal() {
                ctx.set_status(TaskStatus::Cancelled)?;
                ctx.set_phase(TaskPhase::Idle);
                ctx.log(LogLevel::Info, "Task cancelled");
                ctx.finish();
            }
            Ok(ctx.task.clone())
        })?;

        if let Some(token) = self.inner.tokens.get(&id) {
            token.cancel();
        }
        self.inner.processes.kill(id);
        info!(task_id = %id, "task cancelled");
        Ok(snapshot)
    }

    /// Snapshots of every task, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks().values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.tasks().get(&id).cloned()
    }

    /// Cancel everything in flight and forget all tasks.
    pub fn reset(&self) {
        for token in self.inner.tokens.iter() {
            token.cancel();
        }
        self.inner.processes.clear();
        self.inner.tokens.clear();
        self.tasks().clear();
        self.inner.gateway.diagnostics().reset();
        debug!("orchestrator reset");
    }

    /// One gated model call outside any task.
    pub async fn chat(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        let system = prompts::chat_system_prompt(&self.config().prompts);
        let request = GenerateRequest::new(RequestKind::Chat, prompt).with_system_prompt(Some(system));
        Ok(self.inner.gateway.generate(request, cancel).await?)
    }

    // -----------------------------------------------------------------------
    // Supervision
    // -----------------------------------------------------------------------

    fn spawn_supervised<F>(&self, id: Uuid, prefix: &'static str, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let handle = tokio::spawn(work);
        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join) if join.is_panic() => {
                    Err(TaskError::Internal("background worker panicked".into()))
                }
                Err(_) => Err(TaskError::Cancelled),
            };
            if let Err(e) = outcome {
                this.fail_task(id, prefix, &e);
            }
        });
    }

    fn fail_task(&self, id: Uuid, prefix: &str, err: &TaskError) {
        let result = self.update(id, |ctx| {
            if ctx.task.is_terminal() {
                return Ok(());
            }
            if ctx.task.cancel_requested || matches!(err, TaskError::Cancelled) {
                ctx.task.request_cancel();
                ctx.set_status(TaskStatus::Cancelled)?;
                ctx.set_phase(TaskPhase::Idle);
                ctx.log(LogLevel::Info, "Task cancelled");
                ctx.finish();
                return Ok(());
            }
            let message = format!("{prefix}: {err}");
            error!(task_id = %ctx.task.id, error = %message, "task failed");
            ctx.task.last_error = Some(message.clone());
            ctx.set_status(TaskStatus::Failed)?;
            ctx.set_phase(TaskPhase::Error);
            ctx.log(LogLevel::Error, message);
            ctx.finish();
            Ok(())
        });
        if let Err(e) = result {
            debug!(task_id = %id, error = %e, "failure not recorded");
        }
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    async fn plan_task(&self, id: Uuid) -> Result<()> {
        let token = self.token(id)?;
        let (goal, mode) = self.update(id, |ctx| Ok((ctx.task.goal.clone(), ctx.task.mode)))?;
        let system = prompts::system_prompt(&self.config().prompts, mode);

        let plan =
            planner::generate_plan(&self.inner.gateway, &goal, mode, system, &token).await?;

        self.update_live(id, |ctx| {
            ctx.task.plan_summary = plan.summary.clone();
            ctx.task.steps = plan
                .steps
                .iter()
                .map(ato_core::types::Step::new)
                .collect();
            ctx.set_status(TaskStatus::WaitingApproval)?;
            ctx.set_phase(TaskPhase::Idle);
            ctx.emit(
                TaskEventKind::PlanReady,
                Some(plan.summary.clone()),
                Some(json!({ "plan_summary": plan.summary, "steps": plan.steps })),
            );
            ctx.log(
                LogLevel::Info,
                format!("Plan ready with {} step(s)", plan.steps.len()),
            );
            ctx.emit(TaskEventKind::ApprovalRequired, None, None);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn run_task(&self, id: Uuid) -> Result<()> {
        let token = self.token(id)?;
        let config = self.config();
        let permissions = config.permissions.clone();

        let (mode, root, step_count, auto_run) = self.update(id, |ctx| {
            Ok((
                ctx.task.mode,
                ctx.task.workspace_root.clone(),
                ctx.task.steps.len(),
                ctx.task.auto_run_pipeline,
            ))
        })?;

        if mode == TaskMode::Plan {
            return self.update_live(id, |ctx| {
                ctx.set_status(TaskStatus::Completed)?;
                ctx.set_phase(TaskPhase::Done);
                ctx.log(LogLevel::Info, "Plan approved; nothing to execute in plan mode");
                ctx.finish();
                Ok(())
            });
        }

        let root = root.ok_or(TaskError::WorkspaceRequired)?;
        let writer = WorkspaceWriter::new(&root);
        let system = prompts::system_prompt(&config.prompts, mode);

        self.update_live(id, |ctx| {
            ctx.set_status(TaskStatus::Running)?;
            ctx.log(LogLevel::Info, format!("Running {step_count} step(s)"));
            Ok(())
        })?;

        for index in 0..step_count {
            self.check_cancel(id, &token)?;

            let prompt = self.update_live(id, |ctx| {
                ctx.task.advance_cursor(index);
                let step = ctx
                    .task
                    .steps
                    .get_mut(index)
                    .ok_or_else(|| TaskError::Internal(format!("step {index} missing")))?;
                step.advance(StepStatus::InProgress, None)?;
                let description = step.description.clone();
                ctx.set_phase(TaskPhase::Thinking);
                ctx.emit(
                    TaskEventKind::StepStarted,
                    Some(description.clone()),
                    Some(json!({ "index": index })),
                );
                ctx.log(LogLevel::Info, format!("Step {}: {}", index + 1, description));
                let task: &Task = &*ctx.task;
                Ok(prompts::step_prompt(task, index, &task.steps[index]))
            })?;

            match self
                .execute_step(id, index, prompt, &system, &root, &writer, &permissions, &token)
                .await
            {
                Ok(result) => self.update_live(id, |ctx| {
                    if let Some(step) = ctx.task.steps.get_mut(index) {
                        step.advance(StepStatus::Completed, Some(result.clone()))?;
                    }
                    ctx.emit(
                        TaskEventKind::StepCompleted,
                        Some(result.clone()),
                        Some(json!({ "index": index })),
                    );
                    ctx.log(LogLevel::Info, format!("Step {} completed: {}", index + 1, result));
                    Ok(())
                })?,
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => {
                    let message = e.to_string();
                    self.update_live(id, |ctx| {
                        if let Some(step) = ctx.task.steps.get_mut(index) {
                            step.advance(StepStatus::Failed, Some(message.clone()))?;
                        }
                        ctx.emit(
                            TaskEventKind::StepFailed,
                            Some(message.clone()),
                            Some(json!({ "index": index })),
                        );
                        Ok(())
                    })?;
                    return Err(e);
                }
            }
        }

        if auto_run {
            let commands =
                validation_commands(&root, &config.pipeline, self.inner.store.as_ref());
            if !commands.is_empty() {
                self.check_cancel(id, &token)?;
                self.update_live(id, |ctx| {
                    ctx.set_status(TaskStatus::Testing)?;
                    ctx.set_phase(TaskPhase::Testing);
                    ctx.emit(
                        TaskEventKind::TestingStarted,
                        None,
                        Some(json!({ "commands": commands })),
                    );
                    ctx.log(
                        LogLevel::Info,
                        format!("Running {} validation command(s)", commands.len()),
                    );
                    Ok(())
                })?;

                for command in &commands {
                    self.check_cancel(id, &token)?;
                    let out = self.run_command(id, &root, command, &token, true).await?;
                    if !out.success {
                        return Err(TaskError::CommandFailed {
                            command: command.clone(),
                            exit_code: out.exit_code,
                        });
                    }
                }
            }
        }

        self.update_live(id, |ctx| {
            ctx.set_status(TaskStatus::Completed)?;
            ctx.set_phase(TaskPhase::Done);
            ctx.log(LogLevel::Info, "Task completed");
            ctx.finish();
            Ok(())
        })?;
        info!(task_id = %id, "task completed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        id: Uuid,
        index: usize,
        prompt: String,
        system: &str,
        root: &Path,
        writer: &WorkspaceWriter,
        permissions: &ato_core::config::PermissionsConfig,
        token: &CancellationToken,
    ) -> Result<String> {
        let request = GenerateRequest::new(RequestKind::StepAction, prompt)
            .with_system_prompt(Some(system.to_string()));
        let raw = self.inner.gateway.generate(request, token).await?;

        let action = decode_action(&raw).map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        self.update_live(id, |ctx| {
            let detail = match &action {
                StepAction::WriteFile { path, .. } => json!({ "index": index, "action": action.name(), "path": path }),
                StepAction::RunCommand { command } => json!({ "index": index, "action": action.name(), "command": command }),
                StepAction::Skip => json!({ "index": index, "action": action.name() }),
            };
            ctx.emit(TaskEventKind::StepAction, Some(action.name().to_string()), Some(detail));
            Ok(())
        })?;

        match action {
            StepAction::Skip => Ok(SKIPPED_RESULT.to_string()),
            StepAction::WriteFile { path, content } => {
                if !permissions.allow_file_write {
                    return Err(TaskError::PermissionDenied(FILE_WRITES_DISABLED.into()));
                }
                self.update_live(id, |ctx| {
                    ctx.set_phase(TaskPhase::Writing);
                    Ok(())
                })?;
                let record = writer.write_file(&path, &content).await?;
                let summary = format!("Wrote {} ({:+} bytes)", record.path, record.bytes_changed);
                self.update_live(id, |ctx| {
                    ctx.emit(
                        TaskEventKind::FileWritten,
                        Some(record.path.clone()),
                        serde_json::to_value(&record).ok(),
                    );
                    ctx.task.record_file_write(record);
                    ctx.log(LogLevel::Info, summary.clone());
                    Ok(())
                })?;
                Ok(summary)
            }
            StepAction::RunCommand { command } => {
                if !permissions.allow_terminal {
                    return Err(TaskError::PermissionDenied(TERMINAL_DISABLED.into()));
                }
                let out = self.run_command(id, root, &command, token, false).await?;
                if !out.success {
                    return Err(TaskError::CommandFailed {
                        command,
                        exit_code: out.exit_code,
                    });
                }
                Ok(format!("Ran `{command}` (exit code 0)"))
            }
        }
    }

    /// Run one command for a task with streamed events. Validation runs are
    /// recorded as [`TestRun`]s.
    async fn run_command(
        &self,
        id: Uuid,
        root: &Path,
        command: &str,
        token: &CancellationToken,
        record: bool,
    ) -> Result<CommandOutput> {
        self.update_live(id, |ctx| {
            ctx.emit(
                TaskEventKind::TestCommandStarted,
                Some(command.to_string()),
                Some(json!({ "command": command })),
            );
            ctx.log(LogLevel::Info, format!("$ {command}"));
            Ok(())
        })?;

        let handle = self.inner.processes.register(id, command, token);
        let sink = TaskOutputSink {
            orchestrator: self,
            task_id: id,
        };
        let result = command_runner::run(command, Some(root), &sink, handle.kill_token()).await;
        drop(handle);
        let out = result?;

        if out.killed {
            return Err(TaskError::Cancelled);
        }

        self.update_live(id, |ctx| {
            if record {
                ctx.task.record_test_run(TestRun {
                    command: out.command.clone(),
                    exit_code: out.exit_code,
                    success: out.success,
                    output: out.output.clone(),
                    started_at: out.started_at,
                    finished_at: out.finished_at,
                });
            }
            ctx.emit(
                TaskEventKind::TestCommandFinished,
                Some(command.to_string()),
                Some(json!({
                    "command": command,
                    "exit_code": out.exit_code,
                    "success": out.success,
                })),
            );
            let level = if out.success { LogLevel::Info } else { LogLevel::Error };
            ctx.log(level, format!("`{command}` exited with code {}", out.exit_code));
            Ok(())
        })?;
        Ok(out)
    }
}

/// Forwards command output into the task log and onto the bus.
struct TaskOutputSink<'a> {
    orchestrator: &'a TaskOrchestrator,
    task_id: Uuid,
}

impl OutputSink for TaskOutputSink<'_> {
    fn on_chunk(&self, stream: OutputStream, chunk: &str) {
        let level = match stream {
            OutputStream::Stdout => LogLevel::Stdout,
            OutputStream::Stderr => LogLevel::Stderr,
        };
        let result = self.orchestrator.update_live(self.task_id, |ctx| {
            ctx.emit(
                TaskEventKind::TestCommandOutput,
                Some(chunk.to_string()),
                Some(json!({ "stream": stream })),
            );
            ctx.log(level, chunk);
            Ok(())
        });
        match result {
            Ok(()) | Err(TaskError::Cancelled) | Err(TaskError::NotFound(_)) => {}
            Err(e) => debug!(task_id = %self.task_id, error = %e, "dropped command output"),
        }
    }
}
