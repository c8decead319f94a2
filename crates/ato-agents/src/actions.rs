//! Decoding a model reply into the one action a step performs.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::planner::strip_code_fence;

pub const EMPTY_COMMAND: &str = "(empty command)";
pub const SKIPPED_RESULT: &str = "Skipped by model.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    WriteFile { path: String, content: String },
    RunCommand { command: String },
    Skip,
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::WriteFile { .. } => "write_file",
            StepAction::RunCommand { .. } => "run_command",
            StepAction::Skip => "skip",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("Invalid write_file payload")]
    InvalidWriteFile,
}

/// Decode a reply. Anything unrecognisable becomes [`StepAction::Skip`];
/// only a `write_file` without a path or string content is an error.
pub fn decode_action(raw: &str) -> Result<StepAction, ActionError> {
    let body = strip_code_fence(raw);
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) else {
        return Ok(StepAction::Skip);
    };

    match map.get("action").and_then(Value::as_str) {
        Some("write_file") => {
            let path = map
                .get("path")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty());
            let content = map.get("content").and_then(Value::as_str);
            match (path, content) {
                (Some(path), Some(content)) => Ok(StepAction::WriteFile {
                    path: path.to_string(),
                    content: content.to_string(),
                }),
                _ => Err(ActionError::InvalidWriteFile),
            }
        }
        Some("run_command") => {
            let command = map
                .get("command")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(EMPTY_COMMAND);
            Ok(StepAction::RunCommand {
                command: command.to_string(),
            })
        }
        _ => Ok(StepAction::Skip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_action() {
        let action =
            decode_action(r##"{"action":"write_file","path":"README.md","content":"# Hi"}"##)
                .unwrap();
        assert_eq!(
            action,
            StepAction::WriteFile {
                path: "README.md".into(),
                content: "# Hi".into()
            }
        );
    }

    #[test]
    fn empty_content_is_still_valid() {
        let action =
            decode_action(r#"{"action":"write_file","path":"a.txt","content":""}"#).unwrap();
        assert!(matches!(action, StepAction::WriteFile { ref content, .. } if content.is_empty()));
    }

    #[test]
    fn write_file_missing_fields_is_an_error() {
        assert_eq!(
            decode_action(r#"{"action":"write_file","path":"a.txt"}"#),
            Err(ActionError::InvalidWriteFile)
        );
        assert_eq!(
            decode_action(r#"{"action":"write_file","path":"a.txt","content":42}"#),
            Err(ActionError::InvalidWriteFile)
        );
        assert_eq!(
            decode_action(r#"{"action":"write_file","content":"x"}"#),
            Err(ActionError::InvalidWriteFile)
        );
    }

    #[test]
    fn run_command_falls_back_to_placeholder() {
        assert_eq!(
            decode_action(r#"{"action":"run_command"}"#).unwrap(),
            StepAction::RunCommand {
                command: EMPTY_COMMAND.into()
            }
        );
        assert_eq!(
            decode_action("```json\n{\"action\":\"run_command\",\"command\":\"ls\"}\n```").unwrap(),
            StepAction::RunCommand {
                command: "ls".into()
            }
        );
    }

    #[test]
    fn one_line_fenced_write_file() {
        assert_eq!(
            decode_action(r#"```json {"action":"write_file","path":"a","content":"x"}```"#)
                .unwrap(),
            StepAction::WriteFile {
                path: "a".into(),
                content: "x".into()
            }
        );
    }

    #[test]
    fn garbage_and_unknown_actions_skip() {
        assert_eq!(decode_action("not json {").unwrap(), StepAction::Skip);
        assert_eq!(decode_action(r#"{"action":"delete_all"}"#).unwrap(), StepAction::Skip);
        assert_eq!(decode_action("[1,2]").unwrap(), StepAction::Skip);
        assert_eq!(decode_action(r#"{"action":"skip"}"#).unwrap(), StepAction::Skip);
    }
}
