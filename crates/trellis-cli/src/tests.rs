//! Tests for the CLI runner with configuration substituted.

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use trellis_apps::testing::SharedBuffer;

use super::*;

struct StubLoader {
    apps_dir: Utf8PathBuf,
}

impl ConfigLoader for StubLoader {
    fn load(&self, _args: &[OsString]) -> Result<Config, CliError> {
        Ok(Config {
            apps_dir: self.apps_dir.clone(),
            ..Config::default()
        })
    }
}

struct Harness {
    _dir: TempDir,
    loader: StubLoader,
}

impl Harness {
    fn run(&self, args: &[&str]) -> (ExitCode, String, String) {
        let stdout = SharedBuffer::default();
        let mut stderr = Vec::new();
        let code = run_with_loader(
            std::iter::once("trellis")
                .chain(args.iter().copied())
                .map(OsString::from),
            &Console::new(stdout.clone()),
            &mut stderr,
            &self.loader,
        );
        (
            code,
            stdout.contents(),
            String::from_utf8_lossy(&stderr).into_owned(),
        )
    }
}

#[fixture]
fn harness() -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let apps_dir = Utf8PathBuf::from_path_buf(dir.path().join("apps")).expect("utf8 temp dir");
    Harness {
        _dir: dir,
        loader: StubLoader { apps_dir },
    }
}

#[rstest]
fn listing_without_apps_prints_the_header(harness: Harness) {
    let (code, stdout, stderr) = harness.run(&["app", "list"]);

    assert_eq!(code, ExitCode::SUCCESS, "{stderr}");
    assert_eq!(stdout, "Path  Config  Status\n");
}

#[rstest]
fn help_goes_to_stdout(harness: Harness) {
    let (code, stdout, _) = harness.run(&["--help"]);

    assert_eq!(code, ExitCode::SUCCESS);
    assert!(stdout.contains("app"), "{stdout}");
}

#[rstest]
fn unknown_commands_fail_on_stderr(harness: Harness) {
    let (code, stdout, stderr) = harness.run(&["launch"]);

    assert_eq!(code, ExitCode::FAILURE);
    assert!(stdout.is_empty());
    assert!(stderr.contains("launch"), "{stderr}");
}

#[rstest]
fn command_failures_are_one_line(harness: Harness) {
    let (code, _, stderr) = harness.run(&["app", "uninstall", "-g", "github.com/org/missing"]);

    assert_eq!(code, ExitCode::FAILURE);
    assert_eq!(stderr, "app github.com/org/missing not found\n");
}
