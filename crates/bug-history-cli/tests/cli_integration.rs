use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const STATUS_HISTORY: &str = concat!(
    r#"{"bug_id":100,"modified_ts":1000,"modified_by":"dev@x","field_name":"status","field_value":"NEW","field_value_removed":"","event_class":1}"#,
    "\n",
    r#"{"bug_id":100,"modified_ts":2000,"modified_by":"dev@x","field_name":"status","field_value":"NEW","field_value_removed":"ASSIGNED","event_class":9}"#,
    "\n",
    r#"{"bug_id":101,"modified_ts":1500,"modified_by":"qa@x","field_name":"status","field_value":"RESOLVED","field_value_removed":null,"event_class":1}"#,
    "\n",
    r#"{"bug_id":101,"modified_ts":1500,"modified_by":"qa@x","field_name":"priority","field_value":"P1","event_class":4}"#,
    "\n",
);

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_bzh<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_bzh"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute bzh binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_bzh(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "bzh command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_events(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("events.ndjson");
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write events file {}: {err}", path.display()));
    path
}

#[test]
fn migrate_reports_applied_versions_and_contract() {
    let dir = unique_temp_dir("bzh-migrate");
    let db = dir.join("history.sqlite3");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&dry_run, "contract_version"), "cli.v1");
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2]));

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert_eq!(migrated["up_to_date"], Value::Bool(true));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 2);
    assert_eq!(status["pending_versions"], serde_json::json!([]));
}

#[test]
fn replay_from_file_stores_versions_and_reports_diagnostics() {
    let dir = unique_temp_dir("bzh-replay-file");
    let db = dir.join("history.sqlite3");
    let events = write_events(&dir, STATUS_HISTORY);
    let out = dir.join("versions.ndjson");

    let replay = run_json([
        "--db",
        path_str(&db),
        "replay",
        "--in",
        path_str(&events),
        "--out",
        path_str(&out),
    ]);
    assert_eq!(as_str(&replay, "source"), "file");
    assert_eq!(as_i64(&replay, "versions_written"), 3);
    assert_eq!(as_i64(&replay["stats"], "entities"), 2);
    assert_eq!(as_i64(&replay["stats"], "high_water_ts"), 2000);
    assert_eq!(as_i64(&replay["out"], "records"), 3);

    let diagnostics = as_array(&replay, "diagnostics");
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(as_str(&diagnostics[0], "kind"), "unrecognized_event_class");
    assert_eq!(as_i64(&diagnostics[0], "bug_id"), 101);

    let body = fs::read_to_string(&out)
        .unwrap_or_else(|err| panic!("failed to read replay output {}: {err}", out.display()));
    let first: Value = serde_json::from_str(body.lines().next().unwrap_or_default())
        .unwrap_or_else(|err| panic!("first output line is not JSON: {err}"));
    assert_eq!(as_str(&first, "_id"), "100.1000");
    assert_eq!(as_str(&first, "status"), "ASSIGNED");
    assert_eq!(as_i64(&first, "expires_on"), 2000);

    let listed = run_json(["--db", path_str(&db), "versions", "list", "--bug-id", "100"]);
    let versions = as_array(&listed, "versions");
    assert_eq!(versions.len(), 2);
    assert_eq!(as_str(&versions[1], "version_id"), "100.2000");
    assert_eq!(versions[1]["expires_on"], Value::Null);
    assert_eq!(as_str(&versions[1]["document"], "status"), "NEW");
}

#[test]
fn stored_events_replay_with_window_and_aliases() {
    let dir = unique_temp_dir("bzh-replay-store");
    let db = dir.join("history.sqlite3");
    let events = write_events(&dir, STATUS_HISTORY);

    let imported = run_json(["--db", path_str(&db), "events", "import", "--in", path_str(&events)]);
    assert_eq!(as_i64(&imported, "imported_events"), 4);

    let settings = dir.join("replay.yaml");
    fs::write(&settings, "start_time: 1800\nalias_list: \"old@x=new@x\"\n")
        .unwrap_or_else(|err| panic!("failed to write settings: {err}"));

    let replay = run_json([
        "--db",
        path_str(&db),
        "replay",
        "--config",
        path_str(&settings),
        "--alias",
        "a@x=b@x",
    ]);
    assert_eq!(as_str(&replay, "source"), "store");
    assert_eq!(as_i64(&replay, "start_time"), 1800);
    // 100.1000 expires inside the window; 101.1500 starts before it and is
    // still open, so it is not re-emitted.
    assert_eq!(as_i64(&replay, "versions_written"), 2);

    let replay = run_json(["--db", path_str(&db), "replay", "--start-time", "1500"]);
    assert_eq!(as_i64(&replay, "versions_written"), 3);
}

#[test]
fn incremental_replay_starts_from_last_high_water_mark() {
    let dir = unique_temp_dir("bzh-incremental");
    let db = dir.join("history.sqlite3");
    let events = write_events(&dir, STATUS_HISTORY);
    run_json(["--db", path_str(&db), "events", "import", "--in", path_str(&events)]);

    let first = run_json(["--db", path_str(&db), "replay"]);
    assert_eq!(first["resumed_from"], Value::Null);

    let second = run_json([
        "--db",
        path_str(&db),
        "replay",
        "--incremental",
        "--look-back-ms",
        "100",
    ]);
    assert_eq!(as_str(&second, "resumed_from"), as_str(&first, "run_id"));
    assert_eq!(as_i64(&second, "start_time"), 1900);
    // Only bug 100 has events at or after 1900.
    assert_eq!(as_i64(&second["stats"], "entities"), 1);
    assert_eq!(as_i64(&second, "versions_written"), 2);
}

#[test]
fn incremental_file_replay_keeps_only_recent_bugs() {
    let dir = unique_temp_dir("bzh-incremental-file");
    let db = dir.join("history.sqlite3");
    let events = write_events(&dir, STATUS_HISTORY);
    run_json(["--db", path_str(&db), "replay", "--in", path_str(&events)]);

    let second = run_json([
        "--db",
        path_str(&db),
        "replay",
        "--in",
        path_str(&events),
        "--incremental",
        "--look-back-ms",
        "100",
    ]);
    assert_eq!(as_str(&second, "source"), "file");
    assert_eq!(as_i64(&second, "start_time"), 1900);
    assert_eq!(as_i64(&second["stats"], "entities"), 1);
    assert_eq!(as_i64(&second, "versions_written"), 2);
    assert!(as_array(&second, "diagnostics").is_empty());
}

#[test]
fn incremental_rejects_explicit_start_time() {
    let dir = unique_temp_dir("bzh-incremental-conflict");
    let db = dir.join("history.sqlite3");
    let output =
        run_bzh(["--db", path_str(&db), "replay", "--incremental", "--start-time", "5"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot be used with"), "stderr:\n{stderr}");
}

#[test]
fn export_writes_manifest_matching_rows() {
    let dir = unique_temp_dir("bzh-export");
    let db = dir.join("history.sqlite3");
    let events = write_events(&dir, STATUS_HISTORY);
    run_json(["--db", path_str(&db), "replay", "--in", path_str(&events)]);

    let out = dir.join("export").join("versions.ndjson");
    let manifest = run_json(["--db", path_str(&db), "versions", "export", "--out", path_str(&out)]);
    let files = as_array(&manifest, "files");
    assert_eq!(files.len(), 1);
    assert_eq!(as_str(&files[0], "path"), "versions.ndjson");
    assert_eq!(as_i64(&files[0], "records"), 3);

    let body = fs::read_to_string(&out)
        .unwrap_or_else(|err| panic!("failed to read export {}: {err}", out.display()));
    let rows: Vec<Value> = body
        .lines()
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|err| panic!("export line is not JSON: {err}\n{line}"))
        })
        .collect();
    assert_eq!(as_str(&rows[0], "_id"), "100.1000");
    assert_eq!(as_i64(&rows[0], "bug_id"), 100);
    assert_eq!(as_str(&rows[0]["json"], "status"), "ASSIGNED");
}

#[test]
fn inverted_window_fails_with_message() {
    let dir = unique_temp_dir("bzh-invalid-window");
    let db = dir.join("history.sqlite3");
    let output =
        run_bzh(["--db", path_str(&db), "replay", "--start-time", "10", "--end-time", "5"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("end_time 5 is before start_time 10"), "stderr:\n{stderr}");
}
