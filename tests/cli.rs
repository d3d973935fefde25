use assert_cmd::Command;
use predicates::prelude::*;

fn davitd() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("davitd").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    davitd().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    davitd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("davitd"));
}

#[test]
fn test_no_args_shows_usage() {
    davitd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    davitd()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = davitd().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    for cmd in ["serve", "hard-reset"] {
        assert!(
            output.contains(cmd),
            "Help output should list '{}' subcommand",
            cmd
        );
    }
}

#[test]
fn test_hard_reset_on_empty_root_exits_zero() {
    let tmp = tempfile::tempdir().unwrap();
    davitd()
        .args(["hard-reset", "--data-root"])
        .arg(tmp.path())
        .assert()
        .success();
}

#[test]
fn test_serve_rejects_missing_cluster_config() {
    let tmp = tempfile::tempdir().unwrap();
    davitd()
        .args(["serve", "--simulation", "--data-root"])
        .arg(tmp.path())
        .args(["--cluster-config", "/nonexistent/cluster.yaml"])
        .assert()
        .failure();
}
