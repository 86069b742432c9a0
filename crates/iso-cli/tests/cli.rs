//! CLI command integration tests.
//! Each test uses a temp directory via ISO_DATA_DIR for full isolation.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const VALUES: &str = r#"{
    "values": [
        {"id": "ab", "kind": "edge", "link": {"source": "alice", "target": "bob"},
         "attributes": {
            "channel": {"value": "email", "axis": "categorical"},
            "sent": {"value": "2024-01-03", "axis": "temporal"}
         }},
        {"id": "bc", "kind": "edge", "link": {"source": "bob", "target": "carol"},
         "attributes": {
            "channel": {"value": "sms", "axis": "categorical"},
            "sent": {"value": "2024-03-02", "axis": "temporal"}
         }},
        {"id": "alice", "kind": "node", "attributes": {"name": {"value": "Alice"}}},
        {"id": "bob", "kind": "node", "attributes": {"name": {"value": "Bob"}}},
        {"id": "carol", "kind": "node", "attributes": {"name": {"value": "Carol"}}}
    ]
}"#;

const EMAIL_FILTER: &str = r#"{
    "categorical": {"conditions": [{"facet": "channel", "op": "equals", "value": "email"}]}
}"#;

fn iso_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("iso").unwrap();
    cmd.env("ISO_DATA_DIR", data_dir.path());
    cmd
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn seeded() -> TempDir {
    let dir = TempDir::new().unwrap();
    let input = write_file(&dir, "values.json", VALUES);
    iso_cmd(&dir).arg("import").arg(&input).assert().success();
    dir
}

/// Extract the value from a stat line like "nodes:      3".
fn extract_stat_value(output: &str, prefix: &str) -> String {
    output
        .lines()
        .find(|l| l.contains(prefix))
        .unwrap_or_else(|| panic!("stat line containing '{prefix}' not found in output:\n{output}"))
        .split_whitespace()
        .last()
        .unwrap()
        .to_string()
}

#[test]
fn stats_fresh_db() {
    let dir = TempDir::new().unwrap();
    iso_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodes:      0"))
        .stdout(predicate::str::contains("edges:      0"))
        .stdout(predicate::str::contains("snapshots:  0"))
        .stdout(predicate::str::contains("current:    main"));
}

#[test]
fn import_then_stats() {
    let dir = TempDir::new().unwrap();
    let input = write_file(&dir, "values.json", VALUES);

    iso_cmd(&dir)
        .arg("import")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 5 values"))
        .stdout(predicate::str::contains("nodes=3, edges=2"));

    let output = iso_cmd(&dir).arg("stats").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "nodes:"), "3");
    assert_eq!(extract_stat_value(&stdout, "edges:"), "2");
    assert_ne!(extract_stat_value(&stdout, "facets:"), "0");
}

#[test]
fn import_with_dangling_edge_fails_atomically() {
    let dir = TempDir::new().unwrap();
    let input = write_file(
        &dir,
        "bad.json",
        r#"[
            {"id": "a", "kind": "node"},
            {"id": "ax", "kind": "edge", "link": {"source": "a", "target": "missing"}}
        ]"#,
    );

    iso_cmd(&dir).arg("import").arg(&input).assert().failure();

    let output = iso_cmd(&dir).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "nodes:"), "0");
}

#[test]
fn get_value_with_facets() {
    let dir = seeded();
    iso_cmd(&dir)
        .args(["get", "ab", "--facets"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": \"ab\""))
        .stdout(predicate::str::contains("categorical.channel"));
}

#[test]
fn get_missing_value_fails() {
    let dir = seeded();
    iso_cmd(&dir).args(["get", "nobody"]).assert().failure();
}

#[test]
fn delete_node_needs_cascade() {
    let dir = seeded();

    iso_cmd(&dir).args(["delete", "alice"]).assert().failure();

    iso_cmd(&dir)
        .args(["delete", "alice", "--cascade"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted 2"));

    let output = iso_cmd(&dir).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "nodes:"), "2");
    assert_eq!(extract_stat_value(&stdout, "edges:"), "1");
}

#[test]
fn compile_prints_query_text() {
    let dir = seeded();
    let filter = write_file(&dir, "filter.json", EMAIL_FILTER);

    iso_cmd(&dir)
        .arg("compile")
        .assert()
        .success()
        .stdout(predicate::str::contains("FIND values"));

    iso_cmd(&dir)
        .arg("compile")
        .arg(&filter)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "FIND values\nWHERE categorical.channel = \"email\"",
        ));
}

#[test]
fn compile_rejects_malformed_filter() {
    let dir = seeded();
    let filter = write_file(&dir, "filter.json", "{\"mode\": \"sometimes\"}");
    iso_cmd(&dir).arg("compile").arg(&filter).assert().failure();
}

#[test]
fn query_with_channel_filter() {
    let dir = seeded();
    let filter = write_file(&dir, "filter.json", EMAIL_FILTER);

    let output = iso_cmd(&dir).arg("query").arg(&filter).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ab\tedge"), "got:\n{stdout}");
    assert!(!stdout.contains("bc\tedge"), "got:\n{stdout}");
    assert!(stdout.contains("(1 results)"));
}

#[test]
fn query_json_and_views() {
    let dir = seeded();

    let output = iso_cmd(&dir).args(["query", "--json"]).output().unwrap();
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["ids"].as_array().unwrap().len(), 5);

    iso_cmd(&dir)
        .args(["query", "--view", "network"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"alice\""));

    iso_cmd(&dir)
        .args(["query", "--view", "kanban", "--by", "categorical.channel"])
        .assert()
        .success()
        .stdout(predicate::str::contains("email"))
        .stdout(predicate::str::contains("sms"));

    iso_cmd(&dir)
        .args(["query", "--view", "kanban"])
        .assert()
        .failure();
}

#[test]
fn capture_branch_merge_log() {
    let dir = seeded();
    let filter = write_file(&dir, "filter.json", EMAIL_FILTER);

    iso_cmd(&dir)
        .args(["capture", "--label", "everything"])
        .assert()
        .success()
        .stdout(predicate::str::contains("on main"));

    iso_cmd(&dir)
        .args(["branch", "email-only"])
        .assert()
        .success();

    iso_cmd(&dir)
        .arg("capture")
        .arg(&filter)
        .args(["--label", "email"])
        .assert()
        .success()
        .stdout(predicate::str::contains("on email-only"));

    iso_cmd(&dir)
        .arg("branch")
        .assert()
        .success()
        .stdout(predicate::str::contains("* email-only"))
        .stdout(predicate::str::contains("main"));

    // The branch head drives the default query state.
    iso_cmd(&dir)
        .arg("query")
        .assert()
        .success()
        .stdout(predicate::str::contains("(1 results)"));

    iso_cmd(&dir)
        .args(["merge", "email-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fast-forwarded email-only into main"));

    iso_cmd(&dir)
        .arg("log")
        .assert()
        .success()
        .stdout(predicate::str::contains("[everything]"))
        .stdout(predicate::str::contains("[email]"))
        .stdout(predicate::str::contains("categorical.channel = \"email\""));

    let output = iso_cmd(&dir).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "snapshots:"), "2");
    assert_eq!(extract_stat_value(&stdout, "current:"), "main");
}

#[test]
fn merge_conflict_exits_nonzero() {
    let dir = seeded();

    iso_cmd(&dir).arg("capture").assert().success();
    iso_cmd(&dir).args(["branch", "alt"]).assert().success();
    iso_cmd(&dir).arg("capture").assert().success();
    iso_cmd(&dir).args(["checkout", "main"]).assert().success();
    iso_cmd(&dir).arg("capture").assert().success();

    iso_cmd(&dir)
        .args(["merge", "alt"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("conflict: main moved since alt"));
}

#[test]
fn checkout_unknown_branch_fails() {
    let dir = TempDir::new().unwrap();
    iso_cmd(&dir).args(["checkout", "nowhere"]).assert().failure();
}

#[test]
fn replay_runs_every_frame() {
    let dir = seeded();
    let filter = write_file(&dir, "filter.json", EMAIL_FILTER);

    iso_cmd(&dir).arg("capture").assert().success();
    iso_cmd(&dir).arg("capture").arg(&filter).assert().success();

    iso_cmd(&dir)
        .args(["replay", "--speed", "1000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[1/2]"))
        .stdout(predicate::str::contains("5 results"))
        .stdout(predicate::str::contains("[2/2]"))
        .stdout(predicate::str::contains("1 results"))
        .stdout(predicate::str::contains("replayed 2 frames"));
}

#[test]
fn replay_empty_branch() {
    let dir = TempDir::new().unwrap();
    iso_cmd(&dir)
        .arg("replay")
        .assert()
        .success()
        .stdout(predicate::str::contains("no snapshots on main"));
}

#[test]
fn export_values_into_fresh_db() {
    let dir = seeded();
    let path = dir.path().join("export.json");
    iso_cmd(&dir)
        .arg("export")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported values"));

    iso_cmd(&dir)
        .arg("export")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"values\""));

    let other = TempDir::new().unwrap();
    iso_cmd(&other)
        .arg("import")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 5 values"));

    let output = iso_cmd(&other).arg("stats").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "edges:"), "2");
}

#[test]
fn history_export_import() {
    let dir = seeded();
    iso_cmd(&dir).args(["capture", "--label", "one"]).assert().success();

    let path = dir.path().join("history.json");
    iso_cmd(&dir)
        .arg("export-history")
        .arg(&path)
        .assert()
        .success();

    let other = TempDir::new().unwrap();
    iso_cmd(&other)
        .arg("import-history")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 1 snapshots"));

    iso_cmd(&other)
        .arg("log")
        .assert()
        .success()
        .stdout(predicate::str::contains("[one]"));
}

#[test]
fn data_dir_flag_overrides_env() {
    let env_dir = TempDir::new().unwrap();
    let flag_dir = seeded();

    let output = iso_cmd(&env_dir)
        .arg("--data-dir")
        .arg(flag_dir.path())
        .arg("stats")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(extract_stat_value(&stdout, "nodes:"), "3");
}
