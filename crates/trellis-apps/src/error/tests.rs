//! Tests for error rendering and stage classification.

use std::io;
use std::sync::Arc;

use rstest::rstest;

use super::*;

fn tool_failure() -> ToolError {
    ToolError::Failed {
        command: "git clone https://github.com/org/app".to_owned(),
        status: "exit status: 128".to_owned(),
        stderr: "repository not found".to_owned(),
    }
}

#[rstest]
#[case::resolve(AppError::Resolve(ResolveError::MissingPath), Stage::Resolve)]
#[case::fetch(
    AppError::Pipeline(PipelineError::Fetch { repository: "github.com/org/app".to_owned(), source: tool_failure() }),
    Stage::Fetch
)]
#[case::build(
    AppError::Pipeline(PipelineError::Build { step: BuildStep::Compile, source: tool_failure() }),
    Stage::Build
)]
#[case::connect(AppError::Connect(HostError::ExitedEarly), Stage::Connect)]
#[case::dispense(AppError::Dispense(HostError::Disconnected), Stage::Dispense)]
#[case::manifest(AppError::Manifest(HostError::Cancelled), Stage::Manifest)]
#[case::publish(AppError::Publish(CacheError::EmptyReference), Stage::Publish)]
#[case::link(
    AppError::Link(LinkError::NotLoaded { app: "a".to_owned() }),
    Stage::Link
)]
fn stage_follows_variant(#[case] error: AppError, #[case] expected: Stage) {
    assert_eq!(error.stage(), expected);
}

#[test]
fn fetch_error_names_repository() {
    let error = AppError::Pipeline(PipelineError::Fetch {
        repository: "github.com/org/app@v1".to_owned(),
        source: tool_failure(),
    });
    let message = error.to_string();
    assert!(message.starts_with("cloning \"github.com/org/app@v1\": "), "{message}");
    assert!(message.contains("repository not found"), "{message}");
}

#[test]
fn connect_errors_are_prefixed() {
    let error = AppError::Connect(HostError::Connect {
        endpoint: "unix:///tmp/a.sock".to_owned(),
        source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
    });
    assert!(error.to_string().starts_with("connecting: failed to connect to unix:///tmp/a.sock"));
}

#[test]
fn link_failures_join_every_app() {
    let failures = LinkFailures {
        failures: vec![
            (
                "github.com/org/one".to_owned(),
                AppError::Link(LinkError::CommandExists {
                    name: "scaffold".to_owned(),
                    parent: "trellis".to_owned(),
                }),
            ),
            (
                "/opt/two".to_owned(),
                AppError::Resolve(ResolveError::LocalNotFound {
                    path: "/opt/two".to_owned(),
                }),
            ),
        ],
    };
    assert_eq!(
        failures.to_string(),
        "fail to link: github.com/org/one: app command \"scaffold\" already exists under \
         \"trellis\"; /opt/two: local app path \"/opt/two\" not found"
    );
}

#[test]
fn host_error_from_io_keeps_kind() {
    let error = HostError::from(io::Error::from(io::ErrorKind::BrokenPipe));
    match error {
        HostError::Io(source) => assert_eq!(source.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected Io variant, got {other:?}"),
    }
}
