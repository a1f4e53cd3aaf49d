//! CLI command integration tests.
//! Each test points MORPHO_DATA_DIR at its own temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn morpho_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("morpho").unwrap();
    cmd.env("MORPHO_DATA_DIR", data_dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

fn crisis_run(dir: &TempDir, extra: &[&str]) -> assert_cmd::assert::Assert {
    morpho_cmd(dir)
        .args([
            "run",
            "--nodes",
            "6",
            "--scenario",
            "error-spike",
            "--target",
            "n3",
            "--onset",
            "1",
            "--ticks",
            "12",
        ])
        .args(extra)
        .assert()
}

#[test]
fn audit_on_fresh_db() {
    let dir = TempDir::new().unwrap();
    morpho_cmd(&dir)
        .arg("audit")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no runs recorded)"));
    morpho_cmd(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("(no runs recorded)"));
}

#[test]
fn calm_run_takes_no_action() {
    let dir = TempDir::new().unwrap();
    morpho_cmd(&dir)
        .args(["run", "--ticks", "40"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ticks:      40"))
        .stdout(predicate::str::contains("admitted:   0"))
        .stdout(predicate::str::contains("actuator:   0 calls"));
}

#[test]
fn error_spike_opens_circuit_and_is_audited() {
    let dir = TempDir::new().unwrap();
    crisis_run(&dir, &[])
        .success()
        .stdout(predicate::str::contains("ticks:      12"))
        .stdout(predicate::str::contains("failed:     0"));

    // l2 is the ring link n2 → n3.
    morpho_cmd(&dir)
        .args(["audit", "--kind", "intent"])
        .assert()
        .success()
        .stdout(predicate::str::contains("set_circuit_state l2 [succeeded]"));

    let output = morpho_cmd(&dir)
        .args(["audit", "--kind", "intent", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Repeat proposals rejected while the trip was in flight come first.
    let trip: serde_json::Value = stdout
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|v| v["event"]["result"]["status"] == "succeeded")
        .expect("succeeded intent record");
    assert_eq!(trip["event"]["intent"]["action_type"], "set_circuit_state");
    assert_eq!(trip["event"]["intent"]["state"], "Open");
    assert_eq!(trip["event"]["intent"]["link_id"], "l2");
    assert!(trip["post_snapshot"].is_array());
}

#[test]
fn injected_failures_raise_critical_alerts() {
    let dir = TempDir::new().unwrap();
    crisis_run(&dir, &["--failure-rate", "1.0"])
        .success()
        .stdout(predicate::str::contains("succeeded:  0"))
        .stdout(predicate::str::contains("failed:     0").not());

    morpho_cmd(&dir)
        .args(["audit", "--kind", "alert"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[critical]"));
}

#[test]
fn runs_and_export() {
    let dir = TempDir::new().unwrap();
    crisis_run(&dir, &[]).success();
    crisis_run(&dir, &["--seed", "7"]).success();

    let output = morpho_cmd(&dir).arg("runs").output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).lines().count(), 2);

    let path = dir.path().join("audit.jsonl");
    morpho_cmd(&dir)
        .arg("export")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported"));
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.lines().count() > 0);
    for line in text.lines() {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(v["seq"].is_u64());
    }
}

#[test]
fn replay_file_drives_ticks() {
    let dir = TempDir::new().unwrap();
    let topo = dir.path().join("pair.json");
    std::fs::write(
        &topo,
        r#"{"nodes": ["a", "b"], "links": [{"id": "ab", "from": "a", "to": "b"}]}"#,
    )
    .unwrap();
    let sample = r#"{"node_id": "a", "error_count": 0, "total_count": 100, "latency_ms": 20, "capacity_used": 5, "capacity_total": 10}"#;
    let replay = dir.path().join("replay.jsonl");
    std::fs::write(
        &replay,
        format!(
            "[{sample}]\n{{\"change\": \"add_node\", \"id\": \"c\"}}\n[{sample}]\n[]\n"
        ),
    )
    .unwrap();

    morpho_cmd(&dir)
        .arg("run")
        .arg("--topology")
        .arg(&topo)
        .arg("--replay")
        .arg(&replay)
        .assert()
        .success()
        .stdout(predicate::str::contains("ticks:      3"))
        .stdout(predicate::str::contains("topology:   1 changes"));
}

#[test]
fn unknown_target_is_refused() {
    let dir = TempDir::new().unwrap();
    morpho_cmd(&dir)
        .args(["run", "--nodes", "4", "--scenario", "error-spike", "--target", "zz", "--ticks", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the topology"));
}

#[test]
fn check_config_reports_diffusion() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("morpho.toml");
    std::fs::write(&cfg, "tick_seconds = 1.0\n[gateway]\nmax_attempts = 2\n").unwrap();
    let topo = dir.path().join("chain.toml");
    std::fs::write(
        &topo,
        "nodes = [\"a\", \"b\", \"c\"]\n\n[[links]]\nid = \"ab\"\nfrom = \"a\"\nto = \"b\"\n\n[[links]]\nid = \"bc\"\nfrom = \"b\"\nto = \"c\"\n",
    )
    .unwrap();

    morpho_cmd(&dir)
        .arg("check-config")
        .arg(&cfg)
        .arg("--topology")
        .arg(&topo)
        .assert()
        .success()
        .stdout(predicate::str::contains("config ok"))
        .stdout(predicate::str::contains("deg_max:    2"))
        .stdout(predicate::str::contains("D[error]: 0.037500"))
        .stdout(predicate::str::contains("D[spare]: 0.012500"));
}

#[test]
fn check_config_rejects_unstable_coupling() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("bad.toml");
    std::fs::write(
        &cfg,
        "[field]\ncoupling = [[0.0, 0.0, 0.0], [0.5, 0.0, 0.0], [0.0, 0.0, 0.0]]\n",
    )
    .unwrap();
    morpho_cmd(&dir)
        .arg("check-config")
        .arg(&cfg)
        .assert()
        .failure()
        .stderr(predicate::str::contains("stability violation"));
}

#[test]
fn run_refuses_invalid_config() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("bad.toml");
    std::fs::write(&cfg, "tick_seconds = -1.0\n").unwrap();
    morpho_cmd(&dir)
        .arg("--config")
        .arg(&cfg)
        .args(["run", "--ticks", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tick_seconds"));
}
