use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const CLEAN_BUNDLE: &str = r#"{
    "courses": {"C1": {"id": "C1", "name": "Course One"}},
    "feedbackSessions": {
        "S1": {"feedbackSessionName": "S1", "courseId": "C1", "creatorEmail": "instr@uni.edu"}
    },
    "feedbackQuestions": {
        "q1": {"feedbackQuestionId": "old-42", "feedbackSessionName": "S1", "courseId": "C1",
               "questionNumber": 1}
    },
    "feedbackResponses": {
        "r1": {"feedbackQuestionId": "old-42", "feedbackSessionName": "S1", "courseId": "C1",
               "giver": "a@uni.edu", "recipient": "b@uni.edu", "answer": "great"}
    }
}"#;

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

fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
    }
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn run_crestore<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_crestore"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute crestore binary: {err}"))
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_crestore(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "crestore command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout_json(&output)
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

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

#[test]
fn db_commands_cover_schema_version_migrate_integrity_and_backup() {
    let dir = unique_temp_dir("crestore-db");
    let db = dir.join("restore.sqlite3");
    let db_arg = path_str(&db);

    let before = run_json(["--db", db_arg, "db", "schema-version"]);
    validate_schema("db-schema-version.json", &before);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(before.get("up_to_date"), Some(&Value::Bool(false)));

    let plan = run_json(["--db", db_arg, "db", "migrate", "--dry-run"]);
    validate_schema("db-migrate.json", &plan);
    assert_eq!(plan.get("would_apply_versions"), Some(&serde_json::json!([1, 2])));

    let applied = run_json(["--db", db_arg, "db", "migrate"]);
    validate_schema("db-migrate.json", &applied);
    assert_eq!(as_i64(&applied, "before_version"), 0);
    assert_eq!(as_i64(&applied, "after_version"), 2);

    let integrity = run_json(["--db", db_arg, "db", "integrity-check"]);
    validate_schema("db-integrity-check.json", &integrity);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));

    let backup_path = dir.join("backup.sqlite3");
    let backup = run_json(["--db", db_arg, "db", "backup", "--out", path_str(&backup_path)]);
    validate_schema("db-backup.json", &backup);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_path.exists());
}

#[test]
fn restore_sweeps_newest_shard_first_and_records_the_ledger() {
    let dir = unique_temp_dir("crestore-restore");
    let root = dir.join("Backup");
    write_file(&root.join("2020_06_01 00.00.00").join("course1.json"), CLEAN_BUNDLE);
    write_file(&root.join("2020_01_01 00.00.00").join("course1.json"), CLEAN_BUNDLE);
    let db = dir.join("restore.sqlite3");
    let db_arg = path_str(&db);

    let summary = run_json(["--db", db_arg, "restore", "--backup-root", path_str(&root)]);
    validate_schema("restore.json", &summary);
    let totals = summary.get("totals").unwrap_or_else(|| panic!("missing totals: {summary}"));
    assert_eq!(as_i64(totals, "committed"), 1);
    assert_eq!(as_i64(totals, "skipped"), 1);
    let counts =
        summary.get("entity_counts").unwrap_or_else(|| panic!("missing counts: {summary}"));
    assert_eq!(as_i64(counts, "feedback_responses"), 1);

    let files = summary
        .pointer("/report/files")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing report files: {summary}"));
    assert_eq!(as_str(&files[0], "shard"), "2020_06_01 00.00.00");
    assert_eq!(as_str(&files[0], "status"), "committed");
    assert_eq!(as_str(&files[1], "status"), "skipped");

    let ledger = run_json(["--db", db_arg, "ledger", "list"]);
    validate_schema("ledger-list.json", &ledger);
    assert_eq!(as_i64(&ledger, "count"), 1);

    let resumed =
        run_json(["--db", db_arg, "restore", "--backup-root", path_str(&root), "--resume"]);
    validate_schema("restore.json", &resumed);
    assert_eq!(resumed.pointer("/report/resumed_files"), Some(&serde_json::json!(1)));
    assert_eq!(resumed.pointer("/totals/skipped"), Some(&serde_json::json!(2)));
}

#[test]
fn restore_exits_non_zero_when_a_file_fails() {
    let dir = unique_temp_dir("crestore-failure");
    let root = dir.join("Backup");
    write_file(&root.join("2020_06_01 00.00.00").join("broken.json"), "{not json");
    write_file(&root.join("2020_06_01 00.00.00").join("course1.json"), CLEAN_BUNDLE);
    let db = dir.join("restore.sqlite3");

    let output =
        run_crestore(["--db", path_str(&db), "restore", "--backup-root", path_str(&root)]);
    assert!(!output.status.success());

    let summary = stdout_json(&output);
    validate_schema("restore.json", &summary);
    assert_eq!(summary.pointer("/totals/failed"), Some(&serde_json::json!(1)));
    assert_eq!(summary.pointer("/totals/committed"), Some(&serde_json::json!(1)));
}

#[test]
fn restore_reads_settings_from_a_config_file() {
    let dir = unique_temp_dir("crestore-config");
    let root = dir.join("Backup");
    write_file(&root.join("2020_06_01 00.00.00").join("course1.json"), CLEAN_BUNDLE);
    let db = dir.join("from-config.sqlite3");
    let config = dir.join("restore.yaml");
    write_file(
        &config,
        &format!("backup_root: \"{}\"\ndb_path: \"{}\"\n", path_str(&root), path_str(&db)),
    );

    let summary = run_json(["restore", "--config", path_str(&config)]);
    validate_schema("restore.json", &summary);
    assert_eq!(as_str(&summary, "db_path"), path_str(&db));
    assert!(db.exists());
}

#[test]
fn restore_with_missing_backup_root_fails() {
    let dir = unique_temp_dir("crestore-missing-root");
    let db = dir.join("restore.sqlite3");
    let output = run_crestore([
        "--db",
        path_str(&db),
        "restore",
        "--backup-root",
        path_str(&dir.join("absent")),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("backup root is not a directory"));
}
