use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn notesync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("notesync");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Nothing listens here; the commands under test never reach the engine.
    let config_content = format!(
        r#"[db]
path = "{}/data/notesync.sqlite"

[decoder]
zone = "+09:00"

[search]
url = "http://127.0.0.1:9"
max-retries = 0
"#,
        root.display()
    );

    let config_path = config_dir.join("notesync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_notesync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = notesync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run notesync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn hash_line<'a>(stdout: &'a str, label: &str) -> &'a str {
    let prefix = format!("{}: ", label);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix(prefix.as_str()))
        .unwrap_or_else(|| panic!("no '{}' line in {}", label, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_notesync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/notesync.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_notesync(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_notesync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, config_path) = setup_test_env();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[sink.window]\nmajor-lag-minutes = 30\n");
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, content).unwrap();

    let (_, stderr, success) = run_notesync(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("sink.window"), "stderr={}", stderr);
}

#[test]
fn test_hash_ignores_audit_fields() {
    let (tmp, config_path) = setup_test_env();
    let first = tmp.path().join("a.json");
    let second = tmp.path().join("b.json");
    fs::write(
        &first,
        r#"{"id":"n1","ownerId":"u1","templateId":null,"title":"A","body":"","tags":["x"],
            "fields":{"n":1},"status":"active","createdAt":null,
            "modifiedAt":"2024-03-01T09:00:00+00:00"}"#,
    )
    .unwrap();
    fs::write(
        &second,
        r#"{"id":"n1","ownerId":"u1","templateId":null,"title":"A","body":"","tags":["x"],
            "fields":{"n":1.0},"status":"deleted","createdAt":"2024-01-01T00:00:00+00:00",
            "modifiedAt":"2024-03-02T10:00:00+09:00"}"#,
    )
    .unwrap();

    let (out1, err1, ok1) = run_notesync(&config_path, &["hash", first.to_str().unwrap()]);
    assert!(ok1, "hash failed: {}", err1);
    let (out2, _, ok2) = run_notesync(&config_path, &["hash", second.to_str().unwrap()]);
    assert!(ok2);

    for label in ["content", "note", "field"] {
        assert_eq!(hash_line(&out1, label), hash_line(&out2, label));
    }
    assert_ne!(hash_line(&out1, "note"), hash_line(&out1, "field"));
}

#[test]
fn test_decode_prints_snapshot_in_configured_zone() {
    let (tmp, config_path) = setup_test_env();
    let envelope = tmp.path().join("change.json");
    fs::write(
        &envelope,
        r#"{"before":null,
            "after":{"_id":{"$oid":"n1"},"ownerId":"u1","title":"A","tags":["x"],
                     "modifiedAt":{"$date":1700000000000}},
            "op":"c","tsMs":1700000000500}"#,
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_notesync(&config_path, &["decode", envelope.to_str().unwrap()]);
    assert!(success, "decode failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("op: c"));
    assert!(stdout.contains("2023-11-15T07:13:20+09:00"));
    assert!(stdout.contains("\"ownerId\": \"u1\""));
    hash_line(&stdout, "note");

    fs::write(&envelope, r#"{"op":"x","after":{}}"#).unwrap();
    let (_, stderr, success) = run_notesync(&config_path, &["decode", envelope.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unknown operation"), "stderr={}", stderr);
}

#[test]
fn test_dlq_list_and_replay() {
    let (tmp, config_path) = setup_test_env();
    run_notesync(&config_path, &["init"]);

    // base64("hello")
    let record = tmp.path().join("dead.json");
    fs::write(
        &record,
        r#"{"originalTopic":"cdc.notes","originalOffset":7,"consumerGroup":"note-sync",
            "failureReason":"decode failed","failedAt":"2024-03-01T09:00:00Z",
            "originalKey":"n1","originalPayload":"aGVsbG8="}"#,
    )
    .unwrap();
    let (stdout, stderr, success) = run_notesync(
        &config_path,
        &["publish", "--topic", "cdc.notes.dlq", record.to_str().unwrap()],
    );
    assert!(success, "publish failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("cdc.notes.dlq#0"));

    let (stdout, _, success) = run_notesync(&config_path, &["dlq", "list", "cdc.notes"]);
    assert!(success);
    assert!(stdout.contains("cdc.notes#7"));
    assert!(stdout.contains("group=note-sync"));
    assert!(stdout.contains("reason=decode failed"));

    let (stdout, _, success) = run_notesync(&config_path, &["dlq", "replay", "cdc.notes"]);
    assert!(success);
    assert!(stdout.contains("replayed: 1"));

    let (stdout, _, _) = run_notesync(&config_path, &["dlq", "replay", "cdc.notes"]);
    assert!(stdout.contains("replayed: 0"));

    // The replayed payload lands after anything already on the topic.
    let payload = tmp.path().join("payload.bin");
    fs::write(&payload, b"next").unwrap();
    let (stdout, _, _) = run_notesync(
        &config_path,
        &["publish", "--topic", "cdc.notes", payload.to_str().unwrap()],
    );
    assert!(stdout.contains("cdc.notes#1"));
}

#[test]
fn test_sweep_on_empty_store() {
    let (_tmp, config_path) = setup_test_env();
    run_notesync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_notesync(
        &config_path,
        &[
            "sweep",
            "--cadence",
            "minor",
            "--index",
            "note",
            "--at",
            "2024-03-01T10:07:00Z",
        ],
    );
    assert!(success, "sweep failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("batches: 0"));
    assert!(stdout.contains("2024-03-01T08:50:00+00:00"));
}
