use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn handoff(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("handoff").unwrap();
    cmd.current_dir(dir).env_remove("HANDOFF_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn init(dir: &Path) {
    handoff(dir).arg("init").assert().success();
}

fn write_status(dir: &Path, agent: &str, completed: std::ops::RangeInclusive<u32>) {
    let tasks: Vec<String> = completed.map(|n| format!("Repo #{n} complete")).collect();
    let path = dir.join("agent_workspaces").join(agent).join("status.json");
    fs::write(path, serde_json::json!({ "completed_tasks": tasks }).to_string()).unwrap();
}

fn inbox_count(dir: &Path, agent: &str) -> usize {
    let inbox = dir.join("agent_workspaces").join(agent).join("inbox");
    match fs::read_dir(inbox) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "md"))
            .count(),
        Err(_) => 0,
    }
}

fn status_json(dir: &Path) -> serde_json::Value {
    let out = handoff(dir)
        .args(["--format", "json", "pipeline", "status"])
        .output()
        .unwrap();
    assert!(out.status.success());
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn test_init_writes_config_and_workspaces() {
    let tmp = TempDir::new().unwrap();
    handoff(tmp.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote handoff.json"));

    assert!(tmp.path().join("handoff.json").exists());
    assert!(tmp.path().join("agent_workspaces/Agent-1/response.txt").exists());
    assert!(tmp.path().join("agent_workspaces/Agent-2/response.txt").exists());

    handoff(tmp.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    handoff(tmp.path()).args(["init", "--force"]).assert().success();
}

#[test]
fn test_missing_config_points_at_init() {
    let tmp = TempDir::new().unwrap();
    handoff(tmp.path())
        .args(["pipeline", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("handoff init"));
}

#[test]
fn test_config_flag_and_env() {
    let tmp = TempDir::new().unwrap();
    handoff(tmp.path())
        .args(["--config", "conf/custom.json", "init"])
        .assert()
        .success();
    assert!(tmp.path().join("conf/custom.json").exists());
    assert!(tmp.path().join("conf/agent_workspaces/Agent-1").is_dir());

    handoff(tmp.path())
        .env("HANDOFF_CONFIG", "conf/custom.json")
        .args(["pipeline", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Agent-1"));
}

#[test]
fn test_capture_smoke_test() {
    let tmp = TempDir::new().unwrap();
    handoff(tmp.path())
        .args(["capture", "--test"])
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke test passed"));
}

#[test]
fn test_capture_requires_an_action() {
    let tmp = TempDir::new().unwrap();
    handoff(tmp.path()).arg("capture").assert().failure();
    handoff(tmp.path())
        .args(["capture", "--start", "--stop"])
        .assert()
        .failure();
}

#[test]
fn test_manual_capture_is_archived() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());

    handoff(tmp.path())
        .args(["capture", "--capture", "Agent-1", "hello", "manual"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Captured response from Agent-1 (manual)"));

    let archive = fs::read_to_string(tmp.path().join(".handoff/responses.jsonl")).unwrap();
    let line: serde_json::Value = serde_json::from_str(archive.lines().next().unwrap()).unwrap();
    assert_eq!(line["agent_id"], "Agent-1");
    assert_eq!(line["content"], "hello");
    assert_eq!(line["source"], "manual");
}

#[test]
fn test_manual_capture_rejects_unknown_source() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());
    handoff(tmp.path())
        .args(["capture", "--capture", "Agent-1", "hello", "telepathy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown response source"));
}

#[test]
fn test_capture_status_when_idle() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());

    let out = handoff(tmp.path())
        .args(["--format", "json", "capture", "--status"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["status"], "idle");
    assert_eq!(status["monitoring"], false);
    assert_eq!(status["strategy"], "file");

    handoff(tmp.path())
        .args(["capture", "--stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn test_pipeline_handoff_scenario() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());

    write_status(tmp.path(), "Agent-1", 1..=2);
    handoff(tmp.path())
        .args(["pipeline", "start", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("EXECUTING"));
    assert_eq!(inbox_count(tmp.path(), "Agent-2"), 0);

    write_status(tmp.path(), "Agent-1", 1..=8);
    handoff(tmp.path()).args(["pipeline", "start", "--once"]).assert().success();
    assert_eq!(inbox_count(tmp.path(), "Agent-2"), 1);

    // Latches survive across processes
    handoff(tmp.path()).args(["pipeline", "start", "--once"]).assert().success();
    assert_eq!(inbox_count(tmp.path(), "Agent-2"), 1);

    let status = status_json(tmp.path());
    let agent = &status["agents"][0];
    assert_eq!(agent["agent_id"], "Agent-1");
    assert_eq!(agent["progress"], 80.0);
    assert_eq!(agent["gas_sent_at_75"], true);
    assert_eq!(agent["gas_sent_at_90"], false);
}

#[test]
fn test_force_gas_and_reset() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());
    write_status(tmp.path(), "Agent-1", 1..=8);
    handoff(tmp.path()).args(["pipeline", "start", "--once"]).assert().success();

    handoff(tmp.path())
        .args(["pipeline", "force-gas", "Agent-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Agent-1 -> Agent-2"));
    assert_eq!(inbox_count(tmp.path(), "Agent-2"), 2);
    assert_eq!(status_json(tmp.path())["agents"][0]["gas_sent_at_75"], true);

    handoff(tmp.path())
        .args(["pipeline", "force-gas", "Agent-2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("end of the pipeline"));

    handoff(tmp.path())
        .args(["pipeline", "reset", "Agent-1"])
        .assert()
        .success();
    assert_eq!(status_json(tmp.path())["agents"][0]["gas_sent_at_75"], false);

    // After a reset the threshold fires again
    handoff(tmp.path()).args(["pipeline", "start", "--once"]).assert().success();
    assert_eq!(inbox_count(tmp.path(), "Agent-2"), 3);

    handoff(tmp.path())
        .args(["pipeline", "reset", "Agent-9"])
        .assert()
        .failure();
}

#[test]
fn test_pipeline_stop_writes_marker() {
    let tmp = TempDir::new().unwrap();
    init(tmp.path());
    handoff(tmp.path()).args(["pipeline", "stop"]).assert().success();
    assert!(tmp.path().join(".handoff/pipeline.stop").exists());
}
