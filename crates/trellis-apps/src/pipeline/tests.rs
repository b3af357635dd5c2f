//! Tests for fetching, staleness and building.

use std::fs;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::cargo::{built_executables, pick_executable};
use super::*;
use crate::reference::ResolvedApp;
use crate::testing::{EventLog, RecordingFetcher, RecordingToolchain};

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
    log: EventLog,
}

impl Workspace {
    fn remote(&self, reference: &str) -> ResolvedApp {
        ResolvedApp::parse(&self.root.join("apps"), reference).expect("remote reference")
    }

    fn local(&self, name: &str) -> ResolvedApp {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).expect("local dir");
        ResolvedApp::parse(&self.root, dir.as_str()).expect("local reference")
    }
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
    Workspace {
        _dir: dir,
        root,
        log: EventLog::new(),
    }
}

fn touch(path: &Utf8Path, at: SystemTime) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent");
    }
    fs::write(path, b"x").expect("write");
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(at))
        .expect("set mtime");
}

fn hours_ago(hours: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(hours * 3600)
}

#[rstest]
fn fetch_clones_missing_remote_once(workspace: Workspace) {
    let app = workspace.remote("github.com/org/repo/plugins/app@v1/beta");
    let fetcher = RecordingFetcher::new(workspace.log.clone());
    let ctx = CallContext::background();

    fetch(&fetcher, &app, &ctx).expect("first fetch");
    fetch(&fetcher, &app, &ctx).expect("second fetch");

    assert_eq!(workspace.log.events(), ["fetch github.com/org/repo@v1/beta"]);
    assert!(app.src_path().is_dir());
    assert!(app.src_path().as_str().contains("repo-v1-beta"));
}

#[rstest]
fn fetch_skips_local_apps(workspace: Workspace) {
    let app = workspace.local("mine");
    let fetcher = RecordingFetcher::new(workspace.log.clone());
    fetch(&fetcher, &app, &CallContext::background()).expect("fetch");
    assert!(workspace.log.events().is_empty());
}

#[rstest]
fn failed_clone_leaves_nothing_behind(workspace: Workspace) {
    let app = workspace.remote("github.com/org/missing");
    let fetcher = RecordingFetcher::failing(workspace.log.clone(), "repository not found");

    let error = fetch(&fetcher, &app, &CallContext::background()).expect_err("clone fails");

    assert!(
        error
            .to_string()
            .starts_with("cloning \"github.com/org/missing\": "),
        "{error}"
    );
    let source = app.remote_source().expect("remote");
    assert!(!source.clone_dir().exists(), "partial clone must be removed");
}

#[rstest]
fn missing_artifact_is_outdated(workspace: Workspace) {
    let app = workspace.local("fresh");
    touch(&app.src_path().join("src/main.rs"), hours_ago(1));
    assert!(is_outdated(app.src_path(), &app.artifact_path()).expect("inspect"));
}

#[rstest]
fn newer_source_makes_artifact_outdated(workspace: Workspace) {
    let app = workspace.local("edited");
    touch(&app.artifact_path(), hours_ago(2));
    touch(&app.src_path().join("src/main.rs"), hours_ago(1));
    assert!(is_outdated(app.src_path(), &app.artifact_path()).expect("inspect"));
}

#[rstest]
fn skipped_directories_do_not_count(workspace: Workspace) {
    let app = workspace.local("built");
    touch(&app.src_path().join("src/main.rs"), hours_ago(3));
    touch(&app.artifact_path(), hours_ago(2));
    touch(&app.src_path().join("target/release/built"), hours_ago(1));
    touch(&app.src_path().join(".git/index"), hours_ago(1));
    assert!(!is_outdated(app.src_path(), &app.artifact_path()).expect("inspect"));
}

#[rstest]
fn remote_builds_only_without_artifact(workspace: Workspace) {
    let app = workspace.remote("github.com/org/repo");
    touch(&app.src_path().join("src/main.rs"), hours_ago(1));
    assert!(needs_build(&app).expect("missing"));

    touch(&app.artifact_path(), hours_ago(2));
    assert!(!needs_build(&app).expect("present"), "remote apps never rebuild");
}

#[rstest]
fn build_runs_both_steps(workspace: Workspace) {
    let app = workspace.local("hello");
    let toolchain = RecordingToolchain::new(workspace.log.clone());

    build(&toolchain, &app, &CallContext::background()).expect("build");

    assert_eq!(
        workspace.log.events(),
        [format!("tidy {}", app.src_path()), "compile hello".to_owned()]
    );
    assert!(app.artifact_path().is_file());
    assert!(!needs_build(&app).expect("inspect"));
}

#[rstest]
#[case::tidy(RecordingToolchain::failing_tidy, BuildStep::Tidy, "cargo fetch: ")]
#[case::compile(RecordingToolchain::failing_compile, BuildStep::Compile, "cargo build: ")]
fn build_failure_names_step(
    workspace: Workspace,
    #[case] configure: fn(RecordingToolchain) -> RecordingToolchain,
    #[case] expected: BuildStep,
    #[case] prefix: &str,
) {
    let app = workspace.local("broken");
    let toolchain = configure(RecordingToolchain::new(workspace.log.clone()));

    let error = build(&toolchain, &app, &CallContext::background()).expect_err("build fails");

    assert!(matches!(error, PipelineError::Build { step, .. } if step == expected));
    assert!(error.to_string().starts_with(prefix), "{error}");
}

#[rstest]
fn clean_removes_remote_clone_only(workspace: Workspace) {
    let remote = workspace.remote("github.com/org/repo");
    fs::create_dir_all(remote.src_path()).expect("clone dir");
    clean(&remote).expect("clean remote");
    assert!(!remote.src_path().exists());
    clean(&remote).expect("cleaning twice is fine");

    let local = workspace.local("kept");
    clean(&local).expect("clean local");
    assert!(local.src_path().exists());
}

#[test]
fn executables_are_read_from_compiler_artifacts() {
    let stdout = concat!(
        r#"{"reason":"compiler-artifact","executable":null}"#,
        "\n",
        "not json\n",
        r#"{"reason":"compiler-artifact","executable":"/w/target/release/hello"}"#,
        "\n",
        r#"{"reason":"build-finished","success":true}"#,
        "\n",
    );
    assert_eq!(
        built_executables(stdout),
        [Utf8PathBuf::from("/w/target/release/hello")]
    );
}

#[rstest]
#[case::named(&["/t/helper", "/t/hello"], Some("/t/hello"))]
#[case::single(&["/t/other"], Some("/t/other"))]
#[case::none(&[], None)]
#[case::ambiguous(&["/t/a", "/t/b"], None)]
fn executable_choice(#[case] reported: &[&str], #[case] expected: Option<&str>) {
    let built: Vec<Utf8PathBuf> = reported.iter().map(Utf8PathBuf::from).collect();
    let chosen = pick_executable(&built, "hello").ok().map(Utf8Path::as_str);
    assert_eq!(chosen, expected);
}
