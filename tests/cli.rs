use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let docs = root.join("docs");
    fs::create_dir_all(docs.join("nested")).unwrap();
    fs::write(
        docs.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming and cargo crates.",
    )
    .unwrap();
    fs::write(
        docs.join("nested").join("gamma.txt"),
        "Gamma notes about deployment with Kubernetes and Docker.",
    )
    .unwrap();

    // providers default to disabled: fallback metadata, keyword search only
    let config_content = format!(
        r#"[db]
path = '{root}/data/kh.sqlite'

[storage]
root = '{root}/store'

[chunking]
window_tokens = 50
overlap_tokens = 5
min_tokens = 5

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("kh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_kh"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kh: {}", e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn added_id(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("added "))
        .and_then(|rest| rest.split_whitespace().next())
        .expect("no added line")
        .to_string()
}

#[test]
fn test_init_idempotent() {
    let (tmp, config) = setup_test_env();
    let (stdout, _, ok) = run_kh(&config, &["init"]);
    assert!(ok);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/kh.sqlite").exists());
    assert!(tmp.path().join("store/files").is_dir());

    let (_, _, ok) = run_kh(&config, &["init"]);
    assert!(ok);
}

#[test]
fn test_add_directory_then_search() {
    let (tmp, config) = setup_test_env();
    run_kh(&config, &["init"]);

    let docs = tmp.path().join("docs");
    let (stdout, stderr, ok) = run_kh(&config, &["add", docs.to_str().unwrap()]);
    assert!(ok, "add failed: {}", stderr);
    assert!(stdout.contains("added: 2"));
    assert!(stdout.contains("complete: 2"));

    let (stdout, _, ok) = run_kh(&config, &["search", "kubernetes"]);
    assert!(ok);
    assert!(stdout.contains("gamma.txt"));
    assert!(!stdout.contains("alpha.md"));

    let (stdout, _, ok) = run_kh(&config, &["search", "nonexistentterm"]);
    assert!(ok);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_add_same_content_twice_is_duplicate() {
    let (tmp, config) = setup_test_env();
    run_kh(&config, &["init"]);
    let alpha = tmp.path().join("docs/alpha.md");
    let copy = tmp.path().join("alpha-copy.md");
    fs::copy(&alpha, &copy).unwrap();

    let (stdout, _, ok) = run_kh(&config, &["add", alpha.to_str().unwrap()]);
    assert!(ok);
    let id = added_id(&stdout);

    let (stdout, _, ok) = run_kh(&config, &["add", copy.to_str().unwrap()]);
    assert!(ok);
    assert!(stdout.contains(&format!("duplicate {}", id)));
    assert!(stdout.contains("duplicates: 1"));
}

#[test]
fn test_note_status_tag_delete() {
    let (_tmp, config) = setup_test_env();
    run_kh(&config, &["init"]);

    let (stdout, stderr, ok) = run_kh(
        &config,
        &["note", "Saved answer", "--text", "Photosynthesis converts light into chemical energy."],
    );
    assert!(ok, "note failed: {}", stderr);
    let id = added_id(&stdout);
    assert!(stdout.contains("status:       complete"));
    assert!(stdout.contains("Saved answer.md"));

    let (_, _, ok) = run_kh(&config, &["tag", "add", &id, "Biology"]);
    assert!(ok);
    let (stdout, _, ok) = run_kh(&config, &["status", &id]);
    assert!(ok);
    assert!(stdout.contains("biology (manual)"));

    let (stdout, _, ok) = run_kh(&config, &["search", "biology"]);
    assert!(ok);
    assert!(stdout.contains(&id));

    let (_, _, ok) = run_kh(&config, &["delete", &id]);
    assert!(ok);
    let (_, stderr, ok) = run_kh(&config, &["status", &id]);
    assert!(!ok);
    assert!(stderr.contains("file not found"));
}

#[test]
fn test_retry_rejected_unless_error() {
    let (_tmp, config) = setup_test_env();
    run_kh(&config, &["init"]);
    let (stdout, _, _) = run_kh(&config, &["note", "n", "--text", "short note body"]);
    let id = added_id(&stdout);

    let (_, stderr, ok) = run_kh(&config, &["retry", &id]);
    assert!(!ok);
    assert!(stderr.contains("not in error status"));
}

#[test]
fn test_reindex_errors_when_embeddings_disabled() {
    let (_tmp, config) = setup_test_env();
    run_kh(&config, &["init"]);
    let (_, stderr, ok) = run_kh(&config, &["reindex"]);
    assert!(!ok);
    assert!(stderr.contains("vector index unavailable"));
}
