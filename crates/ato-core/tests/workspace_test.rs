use std::path::Path;

use ato_core::config::PipelineConfig;
use ato_core::workspace::*;

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn write_new_file_records_sizes_and_diff() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WorkspaceWriter::new(dir.path());

    let record = writer.write_file("README.md", "# Hi").await.unwrap();

    assert_eq!(record.path, "README.md");
    assert_eq!(record.bytes_before, 0);
    assert_eq!(record.bytes_after, 4);
    assert_eq!(record.bytes_changed, 4);
    assert_eq!(record.diff_preview, "- L1: \n+ L1: # Hi");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
        "# Hi"
    );
}

#[tokio::test]
async fn identical_rewrite_is_a_no_op_diff() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WorkspaceWriter::new(dir.path());
    writer.write_file("a.txt", "one\ntwo\n").await.unwrap();

    let record = writer.write_file("a.txt", "one\ntwo\n").await.unwrap();

    assert_eq!(record.bytes_changed, 0);
    assert_eq!(record.diff_preview, NO_CHANGES_MARKER);
}

#[tokio::test]
async fn shrinking_a_file_reports_negative_delta() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WorkspaceWriter::new(dir.path());
    writer.write_file("a.txt", "0123456789").await.unwrap();

    let record = writer.write_file("a.txt", "012").await.unwrap();

    assert_eq!(record.bytes_before, 10);
    assert_eq!(record.bytes_after, 3);
    assert_eq!(record.bytes_changed, -7);
}

#[tokio::test]
async fn nested_paths_create_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WorkspaceWriter::new(dir.path());

    let record = writer.write_file("src/app/main.ts", "x").await.unwrap();

    assert_eq!(record.path, "src/app/main.ts");
    assert!(dir.path().join("src/app/main.ts").is_file());
}

#[tokio::test]
async fn escape_attempt_leaves_filesystem_untouched() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("ws").join("project");
    std::fs::create_dir_all(&root).unwrap();
    let writer = WorkspaceWriter::new(&root);

    let err = writer
        .write_file("../../escape.txt", "pwned")
        .await
        .unwrap_err();

    assert!(matches!(err, WorkspaceError::SandboxViolation { .. }));
    assert!(!outer.path().join("escape.txt").exists());
    assert_eq!(file_count(&root), 0);
    assert_eq!(file_count(&outer.path().join("ws")), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_directory_cannot_escape_root() {
    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("project");
    let elsewhere = outer.path().join("elsewhere");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::create_dir_all(&elsewhere).unwrap();
    std::os::unix::fs::symlink(&elsewhere, root.join("link")).unwrap();

    let writer = WorkspaceWriter::new(&root);
    let err = writer.write_file("link/out.txt", "x").await.unwrap_err();

    assert!(matches!(err, WorkspaceError::SandboxViolation { .. }));
    assert!(!elsewhere.join("out.txt").exists());
}

#[test]
fn store_creates_slugged_roots_under_base() {
    let base = tempfile::tempdir().unwrap();
    let store = FsWorkspaceStore::new(base.path());

    let root = store.resolve_or_create_workspace_root("Add a README").unwrap();

    assert!(root.is_dir());
    assert!(root.starts_with(base.path()));
    let name = root.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("add-a-readme-"), "got {name}");
}

#[test]
fn test_script_detection() {
    let store = FsWorkspaceStore::new("/unused");
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(store.read_test_script(dir.path()), None);

    std::fs::write(
        dir.path().join("package.json"),
        r#"{"scripts":{"test":"echo \"Error: no test specified\" && exit 1"}}"#,
    )
    .unwrap();
    assert_eq!(store.read_test_script(dir.path()), None);

    std::fs::write(
        dir.path().join("package.json"),
        r#"{"scripts":{"test":"vitest run"}}"#,
    )
    .unwrap();
    assert_eq!(store.read_test_script(dir.path()).as_deref(), Some("npm test"));
}

#[test]
fn validation_battery_follows_project_kind() {
    let store = FsWorkspaceStore::new("/unused");
    let pipeline = PipelineConfig::default();

    let empty = tempfile::tempdir().unwrap();
    assert!(validation_commands(empty.path(), &pipeline, &store).is_empty());

    let node = tempfile::tempdir().unwrap();
    std::fs::write(
        node.path().join("package.json"),
        r#"{"scripts":{"test":"jest"}}"#,
    )
    .unwrap();
    let mut expected = pipeline.node_commands.clone();
    expected.push("npm test".into());
    assert_eq!(validation_commands(node.path(), &pipeline, &store), expected);

    let cargo = tempfile::tempdir().unwrap();
    std::fs::write(cargo.path().join("Cargo.toml"), "[package]\n").unwrap();
    assert_eq!(
        validation_commands(cargo.path(), &pipeline, &store),
        vec!["cargo build".to_string(), "cargo test".to_string()]
    );
}
