//! Drives the built `trellis-app-hello` binary through the host's process
//! connector.
#![cfg(unix)]

use std::time::Duration;

use camino::Utf8Path;
use trellis_app_hello::APP_NAME;
use trellis_apps::host::{Connector, LaunchOptions, LaunchRequest, OutputSinks, ProcessConnector};
use trellis_apps::testing::SharedBuffer;
use trellis_apps::{CallContext, ExecutedCommand, HostClientApi};

const ARTIFACT: &str = env!("CARGO_BIN_EXE_trellis-app-hello");

fn ctx() -> CallContext {
    CallContext::background().with_timeout(Duration::from_secs(20))
}

#[test]
fn launched_app_serves_manifest_and_commands() {
    let stdout = SharedBuffer::default();
    let connector = ProcessConnector::new(LaunchOptions::default());
    let request = LaunchRequest {
        artifact: Utf8Path::new(ARTIFACT),
        name: APP_NAME,
        sinks: OutputSinks::new(Box::new(stdout.clone()), Box::new(std::io::sink())),
    };

    let mut session = connector.launch(&request, &ctx()).expect("launch");
    let app = session.dispense(APP_NAME, &ctx()).expect("dispense");

    let manifest = app.manifest(&ctx()).expect("manifest");
    assert!(manifest.shared_host);

    let command = ExecutedCommand {
        usage: "hello [name]".to_owned(),
        path: "trellis hello".to_owned(),
        args: vec!["mars".to_owned()],
        ..ExecutedCommand::default()
    };
    app.execute(&ctx(), &command, &HostClientApi::new())
        .expect("execute");
    assert_eq!(stdout.contents(), "Hello, mars!\n");

    let pid = session.descriptor().pid;
    session.terminate(Duration::from_secs(2));
    assert_ne!(trellis_apps::process::is_alive(pid), Some(true), "app process stopped");
}

#[test]
fn binary_refuses_to_run_outside_a_host() {
    let output = std::process::Command::new(ARTIFACT)
        .env_remove("TRELLIS_APP_MAGIC_COOKIE")
        .output()
        .expect("run binary");

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
