//! The command-line surface, driven as a subprocess.

use assert_cmd::Command;
use tempfile::TempDir;

/// A command wired to an empty scratch home: config misses are defaults and
/// the database lands in the temp dir, never in the runner's real one.
fn simstim(scratch: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("simstim").unwrap();
    cmd.env("SIMSTIM_CONFIG_PATH", scratch.path().join("absent.toml"))
        .env("SIMSTIM_DATABASE_PATH", scratch.path().join("simstim.db"))
        .env("SIMSTIM_MASTER_KEY", "an adequately long master secret");
    cmd
}

#[test]
fn platforms_lists_names_models_and_quotas() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch).arg("platforms").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("doubao"));
    assert!(stdout.contains("chatqwen"));
    assert!(stdout.contains("qwen-max"));
    assert!(stdout.contains("quota:"));
}

#[test]
fn help_names_every_subcommand() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in [
        "platforms", "login", "submit", "status", "validate", "chat", "usage", "revoke",
    ] {
        assert!(stdout.contains(subcommand), "help is missing {subcommand}");
    }
}

#[test]
fn version_reports_the_package_version() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch).arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn chat_without_a_master_key_says_which_variable_to_set() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch)
        .env_remove("SIMSTIM_MASTER_KEY")
        .args(["chat", "hi", "--platform", "doubao"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("SIMSTIM_MASTER_KEY"), "stderr: {stderr}");
}

#[test]
fn an_unknown_platform_name_is_echoed_back() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch)
        .args(["validate", "--platform", "frobnicator"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("frobnicator"), "stderr: {stderr}");
}

#[test]
fn revoking_an_absent_credential_reports_nothing_removed() {
    let scratch = tempfile::tempdir().unwrap();
    let output = simstim(&scratch)
        .args(["revoke", "--owner", "ann", "--platform", "doubao"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no credential stored"), "stdout: {stdout}");
}
