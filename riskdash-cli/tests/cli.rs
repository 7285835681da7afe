use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn riskdash(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("riskdash").unwrap();
    cmd.current_dir(dir)
        .env_remove("RISKDASH_DATABASE_URL")
        .env_remove("RISKDASH_CONFIG")
        .env_remove("RUST_LOG")
        .env("RISKDASH_SQLITE_PATH", dir.join("dash.db"));
    cmd
}

fn seed(dir: &Path) {
    std::fs::write(
        dir.join("issues.jsonl"),
        concat!(
            r#"{"issue_id": "ISS-2024-00042", "issue_title": "Payment gateway timeout", "risk_theme": "Technology"}"#,
            "\n",
            r#"{"issue_id": "ISS-2024-00043", "issue_title": "Batch job overrun", "risk_theme": "Operations"}"#,
            "\n",
        ),
    )
    .unwrap();
    riskdash(dir)
        .args(["ingest", "issues", "issues.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 new"));
}

#[test]
fn init_reports_sqlite_backend() {
    let dir = tempfile::tempdir().unwrap();
    riskdash(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Backend: sqlite"));
    assert!(dir.path().join("dash.db").exists());
}

#[test]
fn resolve_computes_then_hits_cache() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    let first = riskdash(dir.path())
        .args(["resolve", "issues", "root_cause", "ISS-2024-00042"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let first: serde_json::Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(first["source"], "computed");

    let second = riskdash(dir.path())
        .args(["resolve", "issues", "root_cause", "ISS-2024-00042"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let second: serde_json::Value = serde_json::from_slice(&second).unwrap();
    assert_eq!(second["source"], "cache");
    assert_eq!(second["payload"], first["payload"]);
    assert_eq!(second["created_at"], first["created_at"]);

    riskdash(dir.path())
        .args(["results", "issues", "ISS-2024-00042"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enrichment\": null"));
}

#[test]
fn error_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    riskdash(dir.path())
        .args(["resolve", "payments", "root_cause", "X"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown dataset"));

    riskdash(dir.path())
        .args(["resolve", "issues", "controls_taxonomy", "ISS-2024-00042"])
        .assert()
        .code(2);

    riskdash(dir.path())
        .args(["resolve", "issues", "root_cause", "ISS-404"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));

    riskdash(dir.path())
        .args(["--config", "missing.toml", "status"])
        .assert()
        .code(2);
}

#[test]
fn bulk_status_export_clear() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    riskdash(dir.path())
        .args(["bulk", "issues", "issue_taxonomy", "--chunk-size", "1", "--workers", "2"])
        .args(["--resume-dir", "progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Processed 2/2"));

    riskdash(dir.path())
        .args(["bulk", "issues", "issue_taxonomy", "--resume-dir", "progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to process"));

    riskdash(dir.path())
        .args(["status", "issues"])
        .assert()
        .success()
        .stdout(predicate::str::contains("issues: 2 records"))
        .stdout(predicate::str::contains("100.0%"));

    riskdash(dir.path())
        .args(["export", "issues", "issue_taxonomy", "--output", "out/tax.jsonl"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 2 rows"));
    let exported = std::fs::read_to_string(dir.path().join("out/tax.jsonl")).unwrap();
    assert_eq!(exported.lines().count(), 2);

    riskdash(dir.path())
        .args(["clear", "issues", "--function", "issue_taxonomy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared 2 cached results"));
}

#[test]
fn bulk_rejects_zero_workers() {
    let dir = tempfile::tempdir().unwrap();
    riskdash(dir.path())
        .args(["bulk", "issues", "root_cause", "--workers", "0"])
        .assert()
        .code(2);
}
