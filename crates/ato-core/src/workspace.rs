//! Workspace roots, the sandboxed file writer, and the validation battery.
//!
//! Every `write_file` action funnels through [`WorkspaceWriter::write_file`],
//! which refuses any target that resolves outside the workspace root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::types::FileWrite;

/// Maximum changed-line pairs rendered into a diff preview.
pub const MAX_DIFF_PAIRS: usize = 12;
pub const NO_CHANGES_MARKER: &str = "(no changes detected)";
pub const DIFF_TRUNCATED_MARKER: &str = "... (diff truncated)";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("sandbox violation: '{requested}' resolves outside workspace root {root}")]
    SandboxViolation { requested: String, root: PathBuf },
    #[error("workspace io error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl WorkspaceError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// WorkspaceStore
// ---------------------------------------------------------------------------

/// Source of workspace roots and project test scripts.
pub trait WorkspaceStore: Send + Sync {
    /// Return a directory for `goal`, creating it when needed.
    fn resolve_or_create_workspace_root(&self, goal: &str) -> Result<PathBuf>;

    /// Project-specific test command for `root`, if the project declares one.
    fn read_test_script(&self, root: &Path) -> Option<String>;
}

/// Filesystem-backed store creating `<base>/<goal-slug>-<8 hex>` roots.
#[derive(Debug, Clone)]
pub struct FsWorkspaceStore {
    base_dir: PathBuf,
}

impl FsWorkspaceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl WorkspaceStore for FsWorkspaceStore {
    fn resolve_or_create_workspace_root(&self, goal: &str) -> Result<PathBuf> {
        let suffix = Uuid::new_v4().simple().to_string();
        let dir = self
            .base_dir
            .join(format!("{}-{}", slugify(goal), &suffix[..8]));
        std::fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
        debug!(root = %dir.display(), "created workspace root");
        Ok(dir)
    }

    fn read_test_script(&self, root: &Path) -> Option<String> {
        let package_json = root.join("package.json");
        if let Ok(text) = std::fs::read_to_string(&package_json) {
            return match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(pkg) => pkg["scripts"]["test"]
                    .as_str()
                    .filter(|script| is_real_test_script(script))
                    .map(|_| "npm test".to_string()),
                Err(e) => {
                    warn!(path = %package_json.display(), error = %e, "unparseable package.json");
                    None
                }
            };
        }
        if root.join("Cargo.toml").is_file() {
            return Some("cargo test".to_string());
        }
        None
    }
}

/// npm scaffolds `echo "Error: no test specified" && exit 1`; that is not a test suite.
fn is_real_test_script(script: &str) -> bool {
    let script = script.trim();
    !script.is_empty() && !script.contains("no test specified")
}

fn slugify(goal: &str) -> String {
    let mut slug = String::new();
    for ch in goal.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

// ---------------------------------------------------------------------------
// Validation battery
// ---------------------------------------------------------------------------

/// Kind of project detected in a workspace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Node,
    Cargo,
}

impl ProjectKind {
    pub fn detect(root: &Path) -> Option<Self> {
        if root.join("package.json").is_file() {
            Some(ProjectKind::Node)
        } else if root.join("Cargo.toml").is_file() {
            Some(ProjectKind::Cargo)
        } else {
            None
        }
    }
}

/// Ordered build/typecheck/test commands to run after all steps succeed.
pub fn validation_commands(
    root: &Path,
    pipeline: &PipelineConfig,
    store: &dyn WorkspaceStore,
) -> Vec<String> {
    let mut commands = match ProjectKind::detect(root) {
        Some(ProjectKind::Node) => pipeline.node_commands.clone(),
        Some(ProjectKind::Cargo) => pipeline.cargo_commands.clone(),
        None => Vec::new(),
    };
    if let Some(test) = store.read_test_script(root) {
        if !commands.contains(&test) {
            commands.push(test);
        }
    }
    commands
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// Lexically normalize `path`, resolving `.` and `..` without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping at the root is a no-op, matching path.resolve semantics.
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize_path(path))
    } else {
        let cwd = std::env::current_dir().map_err(|e| WorkspaceError::io(path, e))?;
        Ok(normalize_path(&cwd.join(path)))
    }
}

/// Resolve `requested` against `root`, rejecting anything that escapes it.
///
/// Containment is component-wise, so `/ws/project2` is not inside `/ws/project`.
pub fn resolve_within(root: &Path, requested: &str) -> Result<PathBuf> {
    let root = absolutize(root)?;
    let target = normalize_path(&root.join(requested));
    if target == root || target.starts_with(&root) {
        Ok(target)
    } else {
        Err(WorkspaceError::SandboxViolation {
            requested: requested.to_string(),
            root,
        })
    }
}

/// Reject targets whose nearest existing ancestor is a symlink leading out of the root.
async fn ensure_no_symlink_escape(root: &Path, target: &Path, requested: &str) -> Result<()> {
    let Ok(real_root) = tokio::fs::canonicalize(root).await else {
        return Ok(());
    };
    let mut probe = Some(target);
    while let Some(candidate) = probe {
        if let Ok(real) = tokio::fs::canonicalize(candidate).await {
            if real.starts_with(&real_root) {
                return Ok(());
            }
            return Err(WorkspaceError::SandboxViolation {
                requested: requested.to_string(),
                root: root.to_path_buf(),
            });
        }
        probe = candidate.parent();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WorkspaceWriter
// ---------------------------------------------------------------------------

/// Applies `write_file` actions inside one workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceWriter {
    root: PathBuf,
}

impl WorkspaceWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` to `requested` (relative to the root) and describe the change.
    pub async fn write_file(&self, requested: &str, content: &str) -> Result<FileWrite> {
        let target = resolve_within(&self.root, requested)?;
        let root = absolutize(&self.root)?;
        ensure_no_symlink_escape(&root, &target, requested).await?;

        let previous = match tokio::fs::read(&target).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(WorkspaceError::io(&target, e)),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::io(parent, e))?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|e| WorkspaceError::io(&target, e))?;

        let bytes_before = previous.len() as u64;
        let bytes_after = content.len() as u64;
        let relative = target
            .strip_prefix(&root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| requested.to_string());

        Ok(FileWrite {
            path: relative,
            bytes_before,
            bytes_after,
            bytes_changed: bytes_after as i64 - bytes_before as i64,
            diff_preview: diff_preview(&String::from_utf8_lossy(&previous), content),
            timestamp: Utc::now(),
        })
    }
}

/// Line-by-line comparison capped at [`MAX_DIFF_PAIRS`] changed lines.
///
/// Lines are split on `\n` only, so a trailing newline or a `\r` counts as
/// a change.
pub fn diff_preview(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let total = old_lines.len().max(new_lines.len());

    let mut out = Vec::new();
    let mut pairs = 0;
    for i in 0..total {
        let before = old_lines.get(i).copied();
        let after = new_lines.get(i).copied();
        if before == after {
            continue;
        }
        if pairs == MAX_DIFF_PAIRS {
            break;
        }
        let line_no = i + 1;
        out.push(format!("- L{line_no}: {}", show_line(before)));
        out.push(format!("+ L{line_no}: {}", show_line(after)));
        pairs += 1;
    }

    if pairs == 0 {
        return NO_CHANGES_MARKER.to_string();
    }
    if pairs == MAX_DIFF_PAIRS && total > MAX_DIFF_PAIRS {
        out.push(DIFF_TRUNCATED_MARKER.to_string());
    }
    out.join("\n")
}

fn show_line(line: Option<&str>) -> String {
    line.unwrap_or("").replace('\r', "\\r")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_outside_root_is_rejected() {
        let err = resolve_within(Path::new("/ws/project"), "../../escape.txt").unwrap_err();
        assert!(matches!(err, WorkspaceError::SandboxViolation { .. }));
    }

    #[test]
    fn sibling_with_common_prefix_is_rejected() {
        let err = resolve_within(Path::new("/ws/project"), "../project2/a.txt").unwrap_err();
        assert!(matches!(err, WorkspaceError::SandboxViolation { .. }));
    }

    #[test]
    fn absolute_request_outside_root_is_rejected() {
        assert!(resolve_within(Path::new("/ws/project"), "/etc/passwd").is_err());
    }

    #[test]
    fn nested_and_root_targets_are_allowed() {
        assert_eq!(
            resolve_within(Path::new("/ws/project"), "src/./lib/../main.rs").unwrap(),
            PathBuf::from("/ws/project/src/main.rs")
        );
        assert_eq!(
            resolve_within(Path::new("/ws/project"), ".").unwrap(),
            PathBuf::from("/ws/project")
        );
    }

    #[test]
    fn diff_reports_changed_lines_with_line_numbers() {
        let diff = diff_preview("a\nb\nc", "a\nB\nc\nd");
        assert_eq!(diff, "- L2: b\n+ L2: B\n- L4: \n+ L4: d");
    }

    #[test]
    fn identical_content_yields_no_changes_marker() {
        assert_eq!(diff_preview("same\ntext", "same\ntext"), NO_CHANGES_MARKER);
        assert_eq!(diff_preview("", ""), NO_CHANGES_MARKER);
    }

    #[test]
    fn trailing_newline_is_a_change() {
        assert_eq!(diff_preview("a", "a\n"), "- L2: \n+ L2: ");
        assert_eq!(diff_preview("a\n", "a\n"), NO_CHANGES_MARKER);
    }

    #[test]
    fn line_ending_conversion_is_a_change() {
        let diff = diff_preview("a\nb", "a\r\nb");
        assert_eq!(diff, "- L1: a\n+ L1: a\\r");
    }

    #[test]
    fn diff_is_capped_with_truncation_marker() {
        let new: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let diff = diff_preview("", &new);
        let lines: Vec<&str> = diff.lines().collect();
        assert_eq!(lines.len(), MAX_DIFF_PAIRS * 2 + 1);
        assert_eq!(*lines.last().unwrap(), DIFF_TRUNCATED_MARKER);
    }

    #[test]
    fn slug_is_filesystem_friendly() {
        assert_eq!(slugify("Add a README!"), "add-a-readme");
        assert_eq!(slugify("***"), "task");
    }

    #[test]
    fn npm_placeholder_test_script_is_ignored() {
        assert!(!is_real_test_script(
            "echo \"Error: no test specified\" && exit 1"
        ));
        assert!(is_real_test_script("vitest run"));
    }
}
