//! Turns a goal into an ordered list of steps with one model call.

use ato_core::types::TaskMode;
use ato_intelligence::{GenerateRequest, LlmError, ModelGateway, RequestKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::prompts;

pub const MAX_HEURISTIC_STEPS: usize = 8;
pub const DEFAULT_STEP: &str = "Implement the requested goal";
pub const PLACEHOLDER_SUMMARY: &str = "Generated plan";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Planner returned empty output")]
    EmptyOutput,
    #[error(transparent)]
    Provider(#[from] LlmError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<String>,
}

/// Return the body of the first fenced code block, or the trimmed input.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    let body = match after_open.find('\n') {
        // Skip the info string (```json).
        Some(i) => &after_open[i + 1..],
        // One-line fence: drop a leading info word glued to the opening.
        None => {
            let info = after_open
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(after_open.len());
            &after_open[info..]
        }
    };
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Strip a leading bullet or list number from a line.
fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    for bullet in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            return rest.trim();
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim();
        }
    }
    line
}

/// Parse a raw planner reply. Never fails on malformed text.
pub fn parse_plan(raw: &str) -> Plan {
    let body = strip_code_fence(raw);
    let raw_summary = raw.trim();

    let decoded = serde_json::from_str::<serde_json::Value>(body)
        .map_err(|e| e.to_string())
        .and_then(|value| match value.get("steps") {
            Some(serde_json::Value::Array(items)) => Ok((value.clone(), items.clone())),
            _ => Err("`steps` is missing or not an array".to_string()),
        });

    let (summary, mut steps) = match decoded {
        Ok((value, items)) => {
            let summary = value
                .get("planSummary")
                .and_then(serde_json::Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let steps: Vec<String> = items
                .iter()
                .filter_map(|item| item.get("description").and_then(serde_json::Value::as_str))
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
            (summary, steps)
        }
        Err(reason) => {
            debug!(%reason, "plan is not strict JSON, using line heuristic");
            let steps = body
                .lines()
                .map(strip_list_marker)
                .filter(|l| !l.is_empty() && !l.starts_with("```"))
                .take(MAX_HEURISTIC_STEPS)
                .map(str::to_string)
                .collect();
            (String::new(), steps)
        }
    };

    if steps.is_empty() {
        steps.push(DEFAULT_STEP.to_string());
    }
    let summary = if !summary.is_empty() {
        summary
    } else if !raw_summary.is_empty() {
        raw_summary.to_string()
    } else {
        PLACEHOLDER_SUMMARY.to_string()
    };

    Plan { summary, steps }
}

/// Ask the model for a plan for `goal`.
pub async fn generate_plan(
    gateway: &ModelGateway,
    goal: &str,
    mode: TaskMode,
    system_prompt: String,
    cancel: &CancellationToken,
) -> Result<Plan, PlanError> {
    let request = GenerateRequest::new(RequestKind::Plan, prompts::planner_prompt(goal, mode))
        .with_system_prompt(Some(system_prompt));
    let raw = match gateway.generate(request, cancel).await {
        Ok(raw) => raw,
        Err(LlmError::EmptyResponse) => return Err(PlanError::EmptyOutput),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Err(PlanError::EmptyOutput);
    }
    let plan = parse_plan(&raw);
    info!(steps = plan.steps.len(), "plan generated");
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_plan() {
        let plan = parse_plan(
            r#"{"planSummary":"Add docs","steps":[{"description":"Create README.md"}]}"#,
        );
        assert_eq!(plan.summary, "Add docs");
        assert_eq!(plan.steps, vec!["Create README.md".to_string()]);
    }

    #[test]
    fn fenced_json_plan() {
        let raw = "Here you go:\n```json\n{\"planSummary\":\"S\",\"steps\":[{\"description\":\"a\"},{\"description\":\"b\"}]}\n```\nthanks";
        let plan = parse_plan(raw);
        assert_eq!(plan.summary, "S");
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn heuristic_strips_markers_and_caps_steps() {
        let raw = (1..=10)
            .map(|i| format!("{i}. step {i}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let plan = parse_plan(&raw);
        assert_eq!(plan.steps.len(), MAX_HEURISTIC_STEPS);
        assert_eq!(plan.steps[0], "step 1");
        assert_eq!(plan.summary, raw.trim());
    }

    #[test]
    fn bullets_are_stripped() {
        let plan = parse_plan("- first\n* second\n3) third");
        assert_eq!(plan.steps, vec!["first", "second", "third"]);
    }

    #[test]
    fn wrong_field_types_fall_back_to_lines() {
        let plan = parse_plan(r#"{"planSummary": 3, "steps": "nope"}"#);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0], r#"{"planSummary": 3, "steps": "nope"}"#);
    }

    #[test]
    fn json_without_steps_gets_default_step() {
        let plan = parse_plan(r#"{"planSummary":"","steps":[]}"#);
        assert_eq!(plan.steps, vec![DEFAULT_STEP.to_string()]);
        assert_eq!(plan.summary, r#"{"planSummary":"","steps":[]}"#);
    }

    #[test]
    fn strip_code_fence_passthrough() {
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\nbody\n```"), "body");
    }

    #[test]
    fn one_line_fence_keeps_body() {
        assert_eq!(strip_code_fence("```json {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```{\"a\":1}```"), "{\"a\":1}");

        let plan = parse_plan(
            r#"```json {"planSummary":"S","steps":[{"description":"a"}]}```"#,
        );
        assert_eq!(plan.summary, "S");
        assert_eq!(plan.steps, vec!["a".to_string()]);
    }

    #[test]
    fn steps_without_summary_keep_structure() {
        let raw = r#"{"steps":[{"description":"Create README.md"},{"description":"Add LICENSE"}]}"#;
        let plan = parse_plan(raw);
        assert_eq!(plan.steps, vec!["Create README.md", "Add LICENSE"]);
        assert_eq!(plan.summary, raw);
    }

    #[test]
    fn step_objects_without_description_are_dropped() {
        let plan = parse_plan(
            r#"{"planSummary":"S","steps":[{"description":"a"},{"title":"x"},{"description":7}]}"#,
        );
        assert_eq!(plan.summary, "S");
        assert_eq!(plan.steps, vec!["a".to_string()]);
    }

    #[test]
    fn non_string_summary_falls_back_to_raw_text() {
        let raw = r#"{"planSummary":3,"steps":[{"description":"a"}]}"#;
        let plan = parse_plan(raw);
        assert_eq!(plan.summary, raw);
        assert_eq!(plan.steps, vec!["a".to_string()]);
    }
}
