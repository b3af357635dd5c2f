//! Integration tests for the `trellis` binary entry point.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

fn trellis(apps_dir: &TempDir, project: &TempDir) -> Command {
    let mut command = cargo_bin_cmd!("trellis");
    command
        .current_dir(project.path())
        .env_remove("TRELLIS_LOG_FILTER")
        .arg("--apps-dir")
        .arg(apps_dir.path());
    command
}

fn dirs() -> (TempDir, TempDir) {
    (
        TempDir::new().expect("apps dir"),
        TempDir::new().expect("project dir"),
    )
}

#[test]
fn version_is_printed() {
    let (apps, project) = dirs();
    trellis(&apps, &project)
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn bare_invocation_shows_usage() {
    let (apps, project) = dirs();
    trellis(&apps, &project)
        .assert()
        .failure()
        .stderr(contains("Usage"));
}

#[test]
fn install_rejects_malformed_parameters() {
    let (apps, project) = dirs();
    trellis(&apps, &project)
        .args(["app", "install", "/srv/hello", "greeting"])
        .assert()
        .failure()
        .stderr(contains("malformed key=value arg: greeting"));
}

#[test]
fn uninstall_alias_reports_missing_apps() {
    let (apps, project) = dirs();
    trellis(&apps, &project)
        .args(["app", "rm", "github.com/org/missing"])
        .assert()
        .failure()
        .stderr(contains("app github.com/org/missing not found"));
}

#[test]
fn invalid_local_apps_file_is_reported() {
    let (apps, project) = dirs();
    std::fs::write(project.path().join("trellis-apps.toml"), "apps = 3\n").expect("apps file");

    trellis(&apps, &project)
        .args(["app", "list"])
        .assert()
        .failure()
        .stderr(contains("failed to parse apps file"));
}

#[test]
fn unknown_log_format_is_a_configuration_error() {
    let (apps, project) = dirs();
    trellis(&apps, &project)
        .args(["--log-format", "yaml", "app", "list"])
        .assert()
        .failure()
        .stderr(contains("failed to load configuration"));
}
