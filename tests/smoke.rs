//! Smoke tests -- verify the binary runs and the offline subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn depinguard() -> Command {
    let mut cmd = Command::cargo_bin("depinguard").unwrap();
    cmd.env_remove("DEPINGUARD_CONFIG").env("RUST_LOG", "error");
    cmd
}

fn write_readings(dir: &tempfile::TempDir, name: &str, lines: &[String]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

fn reading_line(device: &str, temperature: f64, vibration: f64) -> String {
    format!(r#"{{"device_id":"{device}","temperature":{temperature},"vibration":{vibration},"power_usage":20.0}}"#)
}

#[test]
fn test_cli_help() {
    depinguard()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("tamper-evident event ledger"));
}

#[test]
fn test_cli_version() {
    depinguard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("depinguard"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "verify", "replay", "simulate", "fit-scaler", "calibrate"] {
        depinguard().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_missing_config_file_fails() {
    depinguard()
        .args(["--config", "/nonexistent/depinguard.toml", "verify"])
        .assert()
        .failure();
}

#[test]
fn test_replay_flags_overheating() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("depinguard.toml");
    std::fs::write(&config, "[window]\nlength = 3\n").unwrap();

    let mut lines: Vec<String> = (0..3).map(|_| reading_line("Device-001", 40.0, 0.5)).collect();
    lines.push(reading_line("Device-001", 150.0, 0.5));
    let input = write_readings(&dir, "readings.jsonl", &lines);

    depinguard()
        .arg("--config")
        .arg(&config)
        .arg("replay")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("RuleTemp"))
        .stdout(predicate::str::contains("Records:    1"))
        .stdout(predicate::str::contains("Chain:      ok"));
}

#[test]
fn test_simulate_json_lines() {
    depinguard()
        .args(["simulate", "--devices", "2", "--count", "6", "--seed", "11", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"verdict\"").count(6));
}

#[test]
fn test_simulate_rejects_nan_anomaly_rate() {
    depinguard()
        .args(["simulate", "--count", "3", "--anomaly-rate", "NaN"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("anomaly rate must be between 0 and 1"));
}

#[test]
fn test_fit_scaler_writes_json() {
    let dir = tempfile::TempDir::new().unwrap();
    let lines = vec![
        reading_line("Device-001", 22.0, 0.3),
        reading_line("Device-002", 48.0, 1.7),
    ];
    let input = write_readings(&dir, "normal.jsonl", &lines);
    let output = dir.path().join("scaler.json");

    depinguard()
        .arg("fit-scaler")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let scaler: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(scaler["data_min"], serde_json::json!([22.0, 0.3]));
    assert_eq!(scaler["data_max"], serde_json::json!([48.0, 1.7]));
}

#[test]
fn test_calibrate_writes_threshold() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("depinguard.toml");
    std::fs::write(&config, "[window]\nlength = 4\n").unwrap();
    let lines: Vec<String> = (0..10).map(|i| reading_line("Device-001", 30.0 + i as f64, 0.5)).collect();
    let input = write_readings(&dir, "normal.jsonl", &lines);
    let threshold = dir.path().join("threshold.txt");

    depinguard()
        .arg("--config")
        .arg(&config)
        .arg("calibrate")
        .arg(&input)
        .arg("--output")
        .arg(&threshold)
        .assert()
        .success()
        .stdout(predicate::str::contains("sequences: 7"));

    let written: f64 = std::fs::read_to_string(&threshold).unwrap().trim().parse().unwrap();
    assert_eq!(written, 0.0);
}

#[test]
fn test_verify_detects_tampered_database() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("ledger.db");
    let config = dir.path().join("depinguard.toml");
    std::fs::write(
        &config,
        format!(
            "[window]\nlength = 1\n\n[ledger]\nmirror_path = \"{}\"\n",
            db.display()
        ),
    )
    .unwrap();

    depinguard()
        .arg("--config")
        .arg(&config)
        .args(["simulate", "--devices", "3", "--count", "9", "--anomaly-rate", "1.0", "--seed", "5"])
        .assert()
        .success();

    depinguard()
        .args(["verify", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("chain ok (9 records)"));

    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute("UPDATE ledger_records SET device_id = 'forged' WHERE idx = 4", [])
        .unwrap();
    drop(conn);

    depinguard()
        .args(["verify", "--db"])
        .arg(&db)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("chain BROKEN at record 4 of 9"));
}
