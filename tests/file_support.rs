//! Integration tests for binary-container ingestion (PDF, EPUB) through
//! the shared conversion cache (`spec.md` §4.1, §6).

use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn ctx_binary() -> std::path::PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("ctx");
    path
}

/// Minimal valid PDF containing the text `phrase`. Builds the body then an
/// xref table with correct byte offsets so `pdf-extract` can parse it.
fn minimal_pdf_with_phrase(phrase: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    let stream = format!("BT /F1 12 Tf 100 700 Td ({phrase}) Tj ET\n");
    out.extend_from_slice(format!("4 0 obj << /Length {} >> stream\n{}endstream endobj\n", stream.len(), stream).as_bytes());
    let o5 = out.len();
    out.extend_from_slice(b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n");
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    out.extend_from_slice(format!("{:010} 00000 n \n", o1).as_bytes());
    out.extend_from_slice(format!("{:010} 00000 n \n", o2).as_bytes());
    out.extend_from_slice(format!("{:010} 00000 n \n", o3).as_bytes());
    out.extend_from_slice(format!("{:010} 00000 n \n", o4).as_bytes());
    out.extend_from_slice(format!("{:010} 00000 n \n", o5).as_bytes());
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// Minimal EPUB (a zip archive with one XHTML entry) containing `phrase`.
fn minimal_epub_with_phrase(phrase: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("OEBPS/content.xhtml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xhtml = format!(
            "<?xml version=\"1.0\"?><html xmlns=\"http://www.w3.org/1999/xhtml\"><body><p>{phrase}</p></body></html>"
        );
        zip.write_all(xhtml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn setup_env(globs: &[&str]) -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    let globs_str = globs.iter().map(|g| format!("\"{g}\"")).collect::<Vec<_>>().join(", ");

    let config_content = format!(
        r#"db_path = "{data}/index.db"
shared_db_path = "{data}/shared/doc-store.db"

[chunking]
max_tokens = 700

[server]
bind = "127.0.0.1:0"

[projects.docs]
roots = ["{files}"]
include_globs = [{globs_str}]
"#,
        data = root.join("data").display(),
        files = files_dir.display(),
    );

    fs::write(root.join("config").join("ctx.toml"), config_content).unwrap();
    (tmp, root.join("config").join("ctx.toml"))
}

fn run_ctx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ctx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ctx: {}", e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn pdf_is_converted_chunked_and_searchable() {
    let (tmp, config_path) = setup_env(&["**/*.pdf"]);
    fs::write(
        tmp.path().join("files").join("spec.pdf"),
        minimal_pdf_with_phrase("spec test phrase"),
    )
    .unwrap();

    run_ctx(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ctx(&config_path, &["sync", "docs"]);
    assert!(success, "sync failed: stdout={stdout}, stderr={stderr}");
    assert!(stdout.contains("indexed=1"), "got: {stdout}");

    let (search_out, _, success) = run_ctx(&config_path, &["search", "spec test phrase"]);
    assert!(success, "search failed");
    assert!(
        search_out.contains("spec.pdf"),
        "search should surface spec.pdf, got: {search_out}"
    );
}

#[test]
fn epub_is_converted_chunked_and_searchable() {
    let (tmp, config_path) = setup_env(&["**/*.epub"]);
    fs::write(
        tmp.path().join("files").join("book.epub"),
        minimal_epub_with_phrase("epub test phrase"),
    )
    .unwrap();

    run_ctx(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ctx(&config_path, &["sync", "docs"]);
    assert!(success, "sync failed: stdout={stdout}, stderr={stderr}");
    assert!(stdout.contains("indexed=1"), "got: {stdout}");

    let (search_out, _, success) = run_ctx(&config_path, &["search", "epub test phrase"]);
    assert!(success);
    assert!(
        search_out.contains("book.epub"),
        "search should surface book.epub, got: {search_out}"
    );
}

/// `spec.md` §4.1: a converter failure is counted per-item and does not
/// abort the rest of the sync.
#[test]
fn corrupt_pdf_is_counted_as_error_without_blocking_other_files() {
    let (tmp, config_path) = setup_env(&["**/*.pdf", "**/*.md"]);
    fs::write(tmp.path().join("files").join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(tmp.path().join("files").join("good.md"), "# Good\n\nThis is good.\n").unwrap();

    run_ctx(&config_path, &["init"]);
    let (stdout, stderr, success) = run_ctx(&config_path, &["sync", "docs"]);
    assert!(success, "sync must still succeed overall: stdout={stdout}, stderr={stderr}");
    assert!(stdout.contains("errors=1"), "expected one conversion error, got: {stdout}");
    assert!(stdout.contains("indexed=1"), "good.md should still be indexed, got: {stdout}");
}

/// Re-syncing an unchanged PDF does not reconvert it: the conversion
/// cache is keyed by content hash, and the project indexer's own
/// content-hash check short-circuits before even asking the cache.
#[test]
fn pdf_resync_without_changes_is_idempotent() {
    let (tmp, config_path) = setup_env(&["**/*.pdf"]);
    fs::write(
        tmp.path().join("files").join("spec.pdf"),
        minimal_pdf_with_phrase("idempotent phrase"),
    )
    .unwrap();

    run_ctx(&config_path, &["init"]);
    let (stdout1, _, _) = run_ctx(&config_path, &["sync", "docs"]);
    assert!(stdout1.contains("indexed=1"));

    let (stdout2, _, _) = run_ctx(&config_path, &["sync", "docs"]);
    assert!(stdout2.contains("skipped_unchanged=1"), "got: {stdout2}");
    assert!(stdout2.contains("indexed=0"));
}
