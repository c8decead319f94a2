//! Prompt text sent to the model.
//!
//! Each task mode has a built-in system prompt that `[prompts]` in the config
//! file can override. The planner and step prompts embed the task context and
//! pin the model to a strict JSON reply.

use ato_core::config::PromptsConfig;
use ato_core::types::{Step, StepStatus, Task, TaskMode};

// ---------------------------------------------------------------------------
// System prompts
// ---------------------------------------------------------------------------

pub const CHAT_SYSTEM_PROMPT: &str = "You are a concise, accurate software engineering assistant.";

const PLAN_SYSTEM_PROMPT: &str = "You are a senior engineer producing implementation plans. \
You only plan; you never claim to have changed files.";

const BUILD_SYSTEM_PROMPT: &str = "You are an engineer building a new project from scratch \
inside an empty workspace. Prefer small, complete files and standard tooling.";

const CODING_SYSTEM_PROMPT: &str = "You are an engineer making focused changes to an existing \
codebase. Keep edits minimal and consistent with the surrounding code.";

const BUGFIX_SYSTEM_PROMPT: &str = "You are an engineer fixing a reported bug. Reproduce the \
failure first when possible, then apply the smallest correct fix.";

pub fn default_system_prompt(mode: TaskMode) -> &'static str {
    match mode {
        TaskMode::Plan => PLAN_SYSTEM_PROMPT,
        TaskMode::Build => BUILD_SYSTEM_PROMPT,
        TaskMode::Coding => CODING_SYSTEM_PROMPT,
        TaskMode::Bugfix => BUGFIX_SYSTEM_PROMPT,
    }
}

/// Configured override for `mode`, else the built-in prompt.
pub fn system_prompt(prompts: &PromptsConfig, mode: TaskMode) -> String {
    prompts
        .for_mode(mode)
        .unwrap_or_else(|| default_system_prompt(mode))
        .to_string()
}

pub fn chat_system_prompt(prompts: &PromptsConfig) -> String {
    prompts.for_chat().unwrap_or(CHAT_SYSTEM_PROMPT).to_string()
}

// ---------------------------------------------------------------------------
// Task prompts
// ---------------------------------------------------------------------------

pub fn planner_prompt(goal: &str, mode: TaskMode) -> String {
    format!(
        "Create an implementation plan for the following goal.\n\
         Mode: {mode}\n\
         Goal: {goal}\n\n\
         Respond with JSON only, no prose, in exactly this shape:\n\
         {{\"planSummary\": \"one sentence\", \"steps\": [{{\"description\": \"...\"}}]}}\n\
         Use between 1 and 8 steps. Each step must be a single concrete action."
    )
}

pub fn step_prompt(task: &Task, index: usize, step: &Step) -> String {
    let mut history = String::new();
    for (i, prior) in task.steps.iter().enumerate().take(index) {
        let outcome = match prior.status {
            StepStatus::Completed => prior.result.as_deref().unwrap_or("done"),
            StepStatus::Failed => "failed",
            _ => "not run",
        };
        history.push_str(&format!("{}. {} -> {}\n", i + 1, prior.description, outcome));
    }
    if history.is_empty() {
        history.push_str("(none)\n");
    }

    let root = task
        .workspace_root
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none)".to_string());

    format!(
        "Goal: {goal}\n\
         Plan: {summary}\n\
         Workspace root: {root}\n\
         Completed steps:\n{history}\n\
         Current step {n} of {total}: {description}\n\n\
         Choose exactly one action for the current step and respond with JSON only:\n\
         {{\"action\": \"write_file\", \"path\": \"relative/path\", \"content\": \"full file content\"}}\n\
         {{\"action\": \"run_command\", \"command\": \"shell command\"}}\n\
         {{\"action\": \"skip\"}}\n\
         Paths are relative to the workspace root.",
        goal = task.goal,
        summary = task.plan_summary,
        n = index + 1,
        total = task.steps.len(),
        description = step.description,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_builtin() {
        let prompts = PromptsConfig {
            coding: Some("custom".into()),
            bugfix: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(system_prompt(&prompts, TaskMode::Coding), "custom");
        assert_eq!(
            system_prompt(&prompts, TaskMode::Bugfix),
            BUGFIX_SYSTEM_PROMPT
        );
        assert_eq!(chat_system_prompt(&prompts), CHAT_SYSTEM_PROMPT);
    }

    #[test]
    fn step_prompt_lists_prior_results() {
        let mut task = Task::new("Ship docs", TaskMode::Build, None, false);
        task.plan_summary = "Add docs".into();
        let mut first = Step::new("Create README.md");
        first.advance(StepStatus::InProgress, None).unwrap();
        first
            .advance(StepStatus::Completed, Some("Wrote README.md".into()))
            .unwrap();
        task.steps = vec![first, Step::new("Add LICENSE")];

        let prompt = step_prompt(&task, 1, &task.steps[1]);
        assert!(prompt.contains("1. Create README.md -> Wrote README.md"));
        assert!(prompt.contains("Current step 2 of 2: Add LICENSE"));
    }

    #[test]
    fn planner_prompt_embeds_goal() {
        let prompt = planner_prompt("Add a README", TaskMode::Plan);
        assert!(prompt.contains("Goal: Add a README"));
        assert!(prompt.contains("\"planSummary\""));
    }
}
