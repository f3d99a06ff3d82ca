use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// The binary with a throwaway home and no inherited Neptune/MLflow settings.
fn cli(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("neptune-mlflow").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("NEPTUNE_PROJECT")
        .env_remove("NEPTUNE_API_TOKEN")
        .env_remove("NEPTUNE_MLFLOW_URI")
        .env_remove("MLFLOW_TRACKING_URI");
    cmd
}

#[test]
fn help_lists_commands() {
    let home = TempDir::new().unwrap();
    cli(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("relay"))
        .stdout(predicate::str::contains("uri"));
}

#[test]
fn zero_artifact_size_is_rejected() {
    let home = TempDir::new().unwrap();
    cli(&home)
        .args(["sync", "--max-artifact-size", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Max artifact size"));
}

#[test]
fn fractional_artifact_size_is_rejected() {
    let home = TempDir::new().unwrap();
    cli(&home)
        .args(["sync", "--max-artifact-size", "50.5"])
        .assert()
        .failure();
}

#[test]
fn encoded_uri_decodes_to_the_same_options() {
    let home = TempDir::new().unwrap();
    let output = cli(&home)
        .args(["uri", "encode", "--mode", "debug", "--name", "baseline", "--tag", "a"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let uri = String::from_utf8(output.stdout).unwrap();
    let uri = uri.trim();
    assert!(uri.starts_with("neptune://track/"));

    let output = cli(&home).args(["uri", "decode", "--json", uri]).output().unwrap();
    assert!(output.status.success());
    let decoded: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        decoded,
        serde_json::json!({"mode": "debug", "name": "baseline", "tags": ["a"]})
    );
}

#[test]
fn relay_rejects_foreign_uri() {
    let home = TempDir::new().unwrap();
    cli(&home)
        .args(["relay", "--neptune-uri", "http://track/e30"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("neptune://"));
}

#[test]
fn config_set_then_get() {
    let home = TempDir::new().unwrap();
    cli(&home)
        .args(["config", "set", "project", "team/sandbox"])
        .assert()
        .success();
    cli(&home)
        .args(["config", "get", "project"])
        .assert()
        .success()
        .stdout(predicate::str::contains("team/sandbox"));
}
