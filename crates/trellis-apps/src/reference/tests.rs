//! Unit tests for reference resolution.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::error::ResolveError;

#[fixture]
fn apps_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("/home/user/.trellis/apps")
}

fn remote(resolved: &ResolvedApp) -> &RemoteSource {
    resolved.remote_source().expect("remote app")
}

#[rstest]
fn revision_is_suffixed_onto_clone_dir(apps_dir: Utf8PathBuf) {
    let app = resolve(&apps_dir, "github.com/ignite/app@develop").expect("resolve");
    let source = remote(&app);
    assert_eq!(source.clone_dir(), apps_dir.join("github.com/ignite/app-develop"));
    assert_eq!(app.src_path(), source.clone_dir());
    assert_eq!(app.name(), "app");
    assert_eq!(source.repository(), "github.com/ignite/app@develop");
    assert_eq!(source.clone_url(), "https://github.com/ignite/app");
    assert_eq!(source.revision(), Some("develop"));
}

#[rstest]
fn subpath_and_slashed_revision(apps_dir: Utf8PathBuf) {
    let app = resolve(&apps_dir, "github.com/ignite/app/app1@package/v1.0.0").expect("resolve");
    let source = remote(&app);
    assert_eq!(
        source.clone_dir(),
        apps_dir.join("github.com/ignite/app-package-v1.0.0")
    );
    assert_eq!(
        app.src_path(),
        apps_dir.join("github.com/ignite/app-package-v1.0.0/app1")
    );
    assert_eq!(app.name(), "app1");
    assert_eq!(source.subpath(), "app1");
    assert_eq!(source.repository(), "github.com/ignite/app@package/v1.0.0");
}

#[rstest]
fn unpinned_remote_uses_repository_path(apps_dir: Utf8PathBuf) {
    let app = resolve(&apps_dir, "github.com/org/tools/apps/lint").expect("resolve");
    let source = remote(&app);
    assert_eq!(source.clone_dir(), apps_dir.join("github.com/org/tools"));
    assert_eq!(app.src_path(), apps_dir.join("github.com/org/tools/apps/lint"));
    assert_eq!(app.name(), "lint");
    assert_eq!(source.repository(), "github.com/org/tools");
    assert_eq!(source.revision(), None);
    assert_eq!(
        app.artifact_path(),
        apps_dir.join("github.com/org/tools/apps/lint/lint.app")
    );
}

#[rstest]
fn trailing_slash_is_ignored(apps_dir: Utf8PathBuf) {
    let app = resolve(&apps_dir, "github.com/org/my-app/").expect("resolve");
    assert_eq!(app.name(), "my-app");
    assert_eq!(app.src_path(), apps_dir.join("github.com/org/my-app"));
}

#[rstest]
#[case::one_segment("app")]
#[case::two_segments("github.com/org")]
#[case::two_segments_with_revision("github.com/org@v1/with/slashes")]
#[case::empty_segments("github.com//org")]
#[case::empty_segment_in_repository("github.com//org/repo")]
#[case::empty_segment_in_subpath("github.com/org/repo//apps/lint")]
#[case::double_trailing_slash("github.com/org/repo//")]
fn short_remote_references_are_invalid(#[case] reference: &str) {
    // The base directory does not exist; resolution must not care.
    let base = Utf8Path::new("/definitely/not/here");
    let error = resolve(base, reference).expect_err("invalid reference");
    assert!(
        matches!(error, ResolveError::InvalidRepository { .. }),
        "unexpected error: {error:?}"
    );
    assert!(error.to_string().ends_with("is not a valid repository URL"));
}

#[test]
fn invalid_repository_message_omits_revision() {
    let error = ResolvedApp::parse(Utf8Path::new("/apps"), "github.com/org@main")
        .expect_err("invalid");
    assert_eq!(
        error.to_string(),
        "app path \"github.com/org\" is not a valid repository URL"
    );
}

#[test]
fn empty_reference_is_missing_path() {
    let error = resolve(Utf8Path::new("/apps"), "").expect_err("empty");
    assert_eq!(error, ResolveError::MissingPath);
    assert_eq!(error.to_string(), "missing app property \"path\"");
}

#[rstest]
#[case::plain("develop")]
#[case::nested("release/v1.2/hotfix")]
fn revision_round_trips(apps_dir: Utf8PathBuf, #[case] revision: &str) {
    let reference = format!("example.org/team/tool@{revision}");
    let app = resolve(&apps_dir, &reference).expect("resolve");
    let source = remote(&app);

    let dir_name = source.clone_dir().file_name().expect("clone dir name");
    let encoded = dir_name.strip_prefix("tool-").expect("revision suffix");
    assert_eq!(encoded, revision.replace('/', "-"));
    assert_eq!(source.repository(), reference);
    assert_eq!(source.revision(), Some(revision));
}

#[test]
fn local_directory_resolves_in_place() {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8Path::from_path(dir.path()).expect("utf8 path");
    let app_dir = path.join("my-local-app");
    fs::create_dir(&app_dir).expect("create app dir");

    let first = resolve(Utf8Path::new("/unused"), app_dir.as_str()).expect("resolve");
    let second = resolve(Utf8Path::new("/unused"), app_dir.as_str()).expect("resolve again");

    assert_eq!(first, second);
    assert!(first.is_local());
    assert_eq!(first.name(), "my-local-app");
    assert_eq!(first.src_path(), app_dir);
    assert_eq!(first.artifact_path(), app_dir.join("my-local-app.app"));
}

#[test]
fn missing_local_directory_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    let missing = Utf8Path::from_path(dir.path())
        .expect("utf8 path")
        .join("absent");
    let error = resolve(Utf8Path::new("/unused"), missing.as_str()).expect_err("missing");
    assert_eq!(
        error,
        ResolveError::LocalNotFound {
            path: missing.to_string()
        }
    );
}

#[test]
fn local_file_is_not_a_directory() {
    let dir = TempDir::new().expect("temp dir");
    let file = Utf8Path::from_path(dir.path())
        .expect("utf8 path")
        .join("file");
    fs::write(&file, "not a dir").expect("write file");
    let error = resolve(Utf8Path::new("/unused"), file.as_str()).expect_err("not a dir");
    assert!(matches!(error, ResolveError::LocalNotDirectory { .. }));
}
