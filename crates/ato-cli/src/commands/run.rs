use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use ato_agents::task_orchestrator::{CreateTask, TaskOrchestrator};
use ato_bridge::protocol::{TaskEvent, TaskEventKind};
use ato_core::config::Config;
use ato_core::types::{TaskMode, TaskStatus};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub goal: String,
    pub mode: TaskMode,
    pub workspace: Option<PathBuf>,
    pub yes: bool,
    pub validate: bool,
}

/// First block of a UUID, enough to tell tasks apart on screen.
fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn print_event(event: &TaskEvent) {
    let message = event.message.as_deref().unwrap_or("");
    let payload = event.payload.as_ref();
    let index = payload
        .and_then(|p| p["index"].as_u64())
        .map(|i| i + 1)
        .unwrap_or(0);

    match event.kind {
        TaskEventKind::StepStarted => println!("\n[step {index}] {message}"),
        TaskEventKind::StepAction => {
            let detail = payload
                .and_then(|p| p["path"].as_str().or_else(|| p["command"].as_str()))
                .unwrap_or("");
            println!("  action: {message} {detail}");
        }
        TaskEventKind::FileWritten => {
            let delta = payload
                .and_then(|p| p["bytes_changed"].as_i64())
                .unwrap_or(0);
            println!("  wrote {message} ({delta:+} bytes)");
        }
        TaskEventKind::StepCompleted => println!("  done: {message}"),
        TaskEventKind::StepFailed => println!("  FAILED: {message}"),
        TaskEventKind::TestingStarted => println!("\n[validation]"),
        TaskEventKind::TestCommandStarted => println!("$ {message}"),
        TaskEventKind::TestCommandOutput => {
            print!("{message}");
            let _ = std::io::stdout().flush();
        }
        TaskEventKind::TestCommandFinished => {
            let code = payload
                .and_then(|p| p["exit_code"].as_i64())
                .unwrap_or(-1);
            println!("  exit code {code}");
        }
        _ => {}
    }
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await??;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Wait for the next event of `task_id`, cancelling the task on Ctrl-C.
async fn next_event(
    orch: &TaskOrchestrator,
    rx: &flume::Receiver<TaskEvent>,
    task_id: Uuid,
) -> anyhow::Result<TaskEvent> {
    loop {
        tokio::select! {
            event = rx.recv_async() => {
                let event = event.context("event stream closed")?;
                if event.task_id == task_id {
                    return Ok(event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                orch.cancel_task(task_id)?;
                eprintln!("\ncancelling...");
            }
        }
    }
}

pub async fn run(config: Config, opts: RunOptions) -> anyhow::Result<()> {
    let orch = TaskOrchestrator::from_config(config)
        .map_err(|e| anyhow::anyhow!("failed to set up provider: {e}"))?;
    let rx = orch.subscribe();

    let mut request = CreateTask::new(&opts.goal)
        .with_mode(opts.mode)
        .with_auto_run(opts.validate);
    if let Some(root) = opts.workspace {
        request = request.with_workspace_root(root);
    }
    let task = orch.create_task(request)?;
    println!("Task {} ({} mode): planning...", short_id(&task.id), task.mode);

    loop {
        let event = next_event(&orch, &rx, task.id).await?;
        match event.kind {
            TaskEventKind::ApprovalRequired => break,
            TaskEventKind::TaskFinished => break,
            _ => {}
        }
    }

    let planned = orch.get_task(task.id).context("task disappeared")?;
    if planned.status != TaskStatus::WaitingApproval {
        anyhow::bail!(
            "task {}: {}",
            planned.status,
            planned.last_error.unwrap_or_default()
        );
    }

    println!("\nPlan: {}", planned.plan_summary);
    for (i, step) in planned.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step.description);
    }

    if !opts.yes && !confirm("\nApprove this plan?").await? {
        orch.cancel_task(task.id)?;
        anyhow::bail!("plan rejected");
    }

    let approved = orch.approve_task(task.id)?;
    if let Some(root) = &approved.workspace_root {
        println!("Workspace: {}", root.display());
    }

    loop {
        let event = next_event(&orch, &rx, task.id).await?;
        print_event(&event);
        if event.kind == TaskEventKind::TaskFinished {
            break;
        }
    }

    let finished = orch.get_task(task.id).context("task disappeared")?;
    match finished.status {
        TaskStatus::Completed => {
            println!(
                "\nCompleted: {} file write(s), {} validation run(s)",
                finished.file_writes.len(),
                finished.test_runs.len()
            );
            Ok(())
        }
        status => anyhow::bail!(
            "task {}: {}",
            status,
            finished.last_error.unwrap_or_default()
        ),
    }
}
