//! End-to-end tests driving the `ctx` binary against a temporary config
//! and file tree, mirroring `spec.md` §8's end-to-end scenarios (1-4).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ctx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ctx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"db_path = "{data}/index.db"
shared_db_path = "{data}/shared/doc-store.db"

[chunking]
max_tokens = 700
overlap_words = 40

[server]
bind = "127.0.0.1:0"

[projects.files]
roots = ["{files}"]
include_globs = ["**/*.md", "**/*.txt"]
"#,
        data = root.join("data").display(),
        files = files_dir.display(),
    );

    let config_path = config_dir.join("ctx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ctx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(tmp.path().join("data").join("index.db").exists());
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ctx(&config_path, &["init"]);
    assert!(success1, "first init failed");

    let (_, _, success2) = run_ctx(&config_path, &["init"]);
    assert!(success2, "second init failed (not idempotent)");
}

/// `spec.md` §8 scenario 1: fresh index of a single file reports one
/// indexed source.
#[test]
fn sync_indexes_files_in_project() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ctx(&config_path, &["sync", "files"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("indexed=3"), "expected 3 indexed, got: {stdout}");
}

/// `spec.md` §8 scenario 2: re-running sync without changes skips
/// everything and writes no new rows.
#[test]
fn sync_is_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    let (stdout1, _, _) = run_ctx(&config_path, &["sync", "files"]);
    assert!(stdout1.contains("indexed=3"));

    let (stdout2, _, _) = run_ctx(&config_path, &["sync", "files"]);
    assert!(
        stdout2.contains("skipped_unchanged=3"),
        "expected unchanged files to be skipped, got: {stdout2}"
    );
    assert!(stdout2.contains("indexed=0"));
}

/// `spec.md` §8 scenario 3: modifying a file causes exactly that one
/// source to be reindexed on the next sync.
#[test]
fn sync_reindexes_only_modified_file() {
    let (tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    fs::write(
        tmp.path().join("files").join("alpha.md"),
        "# Alpha Document Updated\n\nThis file was modified with new words like kubernetes.",
    )
    .unwrap();

    let (stdout, _, success) = run_ctx(&config_path, &["sync", "files"]);
    assert!(success);
    assert!(stdout.contains("indexed=1"), "expected 1 doc reindexed, got: {stdout}");
    assert!(stdout.contains("skipped_unchanged=2"));
}

/// `spec.md` §8 scenario 4: deleting a source file prunes it on the next
/// sync.
#[test]
fn sync_deletes_removed_files() {
    let (tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    fs::remove_file(tmp.path().join("files").join("alpha.md")).unwrap();

    let (stdout, _, success) = run_ctx(&config_path, &["sync", "files"]);
    assert!(success);
    assert!(stdout.contains("deleted=1"), "expected 1 source deleted, got: {stdout}");
}

#[test]
fn search_finds_matching_document() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    let (stdout, _, success) = run_ctx(&config_path, &["search", "Rust programming"]);
    assert!(success, "search failed");
    assert!(
        stdout.contains("alpha.md"),
        "expected alpha.md in results, got: {stdout}"
    );
}

#[test]
fn search_empty_query_returns_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    let (stdout, _, success) = run_ctx(&config_path, &["search", ""]);
    assert!(success, "empty query should not error");
    assert!(stdout.contains("No results"));
}

#[test]
fn search_no_results_for_unmatched_query() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    let (stdout, _, success) = run_ctx(&config_path, &["search", "xyznonexistentterm"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn get_reassembles_document_chunks() {
    let (tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    // Source paths are stored as the absolute path discovered on disk.
    let alpha_path = tmp.path().join("files").join("alpha.md");
    let (stdout, stderr, success) = run_ctx(&config_path, &["get", "files", alpha_path.to_str().unwrap()]);
    assert!(success, "get should succeed: {stderr}");
    assert!(stdout.contains("Alpha Document"));
}

#[test]
fn get_missing_document_fails() {
    let (tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);

    let missing_path = tmp.path().join("files").join("missing.md");
    let (_, _, success) = run_ctx(&config_path, &["get", "files", missing_path.to_str().unwrap()]);
    assert!(!success, "get on a missing document should fail");
}

#[test]
fn sources_lists_configured_collections() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_ctx(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("files"));
    assert!(stdout.contains("OK"));
}

/// `--force` bypasses the unchanged-content-hash skip even when nothing
/// on disk changed.
#[test]
fn sync_force_reindexes_unchanged_files() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    let (stdout, _, success) = run_ctx(&config_path, &["sync", "files", "--force"]);
    assert!(success);
    assert!(
        stdout.contains("indexed=3") && stdout.contains("skipped_unchanged=0"),
        "force should reindex every file regardless of hash, got: {stdout}"
    );
}

#[test]
fn search_source_type_filter_excludes_other_kinds() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    run_ctx(&config_path, &["sync", "files"]);

    let (stdout, _, success) =
        run_ctx(&config_path, &["search", "Rust programming", "--source-type", "nonexistent-kind"]);
    assert!(success);
    assert!(
        stdout.contains("No results"),
        "a source_type that matches nothing should filter everything out, got: {stdout}"
    );
}

#[test]
fn sync_unknown_collection_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_ctx(&config_path, &["init"]);
    let (_, stderr, success) = run_ctx(&config_path, &["sync", "nonexistent"]);
    assert!(!success, "unknown collection should fail");
    assert!(stderr.contains("unknown collection"), "got: {stderr}");
}
