//! Tests for the RPC client and process launching.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rstest::rstest;
use trellis_config::SocketEndpoint;

use super::*;
use crate::client::{HostClientApi, StaticChain};
use crate::error::HostError;
use crate::protocol::{
    AppFrame, ChainInfo, ClientCall, ExecutedCommand, HostCall, HostFrame, Outcome, Reply,
    decode_frame, write_frame,
};
use crate::transport::{self, Connection, LineReader};

/// Serves one connection with `script`, which sees each host frame and
/// writes whatever it likes back.
fn fake_app<F>(script: F) -> (SocketEndpoint, JoinHandle<()>)
where
    F: FnOnce(&mut LineReader, &mut Connection) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let connection = Connection::Tcp(stream);
        let mut writer = connection.try_clone().expect("clone");
        let mut reader = LineReader::new(connection).expect("reader");
        script(&mut reader, &mut writer);
    });
    (SocketEndpoint::tcp("127.0.0.1", port), handle)
}

fn next_call(reader: &mut LineReader) -> (u64, HostCall) {
    let line = reader.next_line().expect("read").expect("frame");
    match decode_frame::<HostFrame>(&line).expect("decode") {
        HostFrame::Call { id, call, .. } => (id, call),
        other => panic!("expected call, got {other:?}"),
    }
}

fn client_for(endpoint: &SocketEndpoint) -> RpcAppClient {
    let connection = transport::connect(endpoint, Duration::from_secs(2)).expect("connect");
    RpcAppClient::new(connection, endpoint.to_string()).expect("client")
}

fn chain() -> ChainInfo {
    ChainInfo {
        chain_id: "venus".to_owned(),
        ..ChainInfo::default()
    }
}

#[test]
fn callbacks_are_answered_before_the_reply() {
    let (endpoint, server) = fake_app(|reader, writer| {
        let (id, call) = next_call(reader);
        assert!(matches!(call, HostCall::Execute { drain: None, .. }));
        write_frame(
            writer,
            &AppFrame::Callback {
                id: 77,
                call: ClientCall::ChainInfo,
            },
        )
        .expect("callback");
        let line = reader.next_line().expect("read").expect("callback reply");
        let reply: HostFrame = decode_frame(&line).expect("decode");
        assert_eq!(
            reply,
            HostFrame::CallbackReply {
                id: 77,
                outcome: Outcome::Ok(chain()),
            }
        );
        write_frame(
            writer,
            &AppFrame::Reply {
                id,
                outcome: Outcome::Ok(Reply::Ack),
            },
        )
        .expect("reply");
    });

    let client = client_for(&endpoint);
    let api = HostClientApi::new().with_chain(Arc::new(StaticChain(chain())));
    client
        .execute(&CallContext::background(), &ExecutedCommand::default(), &api)
        .expect("execute");
    server.join().expect("server");
}

#[test]
fn remote_errors_keep_the_connection_usable() {
    let (endpoint, server) = fake_app(|reader, writer| {
        let (first, _) = next_call(reader);
        write_frame(
            writer,
            &AppFrame::Reply {
                id: first,
                outcome: Outcome::Err("no such command".to_owned()),
            },
        )
        .expect("error reply");
        let (second, call) = next_call(reader);
        assert_eq!(call, HostCall::Manifest);
        write_frame(
            writer,
            &AppFrame::Reply {
                id: second,
                outcome: Outcome::Ok(Reply::Manifest(crate::protocol::Manifest::new("x"))),
            },
        )
        .expect("manifest reply");
    });

    let client = client_for(&endpoint);
    let error = client
        .execute(
            &CallContext::background(),
            &ExecutedCommand::default(),
            &HostClientApi::new(),
        )
        .expect_err("remote failure");
    assert_eq!(error.to_string(), "no such command");
    let manifest = client
        .manifest(&CallContext::background())
        .expect("manifest");
    assert_eq!(manifest.name, "x");
    server.join().expect("server");
}

#[test]
fn expired_call_poisons_the_connection() {
    let (endpoint, server) = fake_app(|reader, _writer| {
        let _call = next_call(reader);
        // Never reply; wait for the host to hang up.
        while let Ok(Some(_)) = reader.next_line() {}
    });

    let client = client_for(&endpoint);
    let ctx = CallContext::background().with_timeout(Duration::from_millis(100));
    assert!(matches!(
        client.manifest(&ctx),
        Err(HostError::DeadlineExceeded)
    ));
    assert!(matches!(
        client.manifest(&CallContext::background()),
        Err(HostError::Poisoned)
    ));
    client.close();
    assert!(matches!(
        client.manifest(&CallContext::background()),
        Err(HostError::Closed)
    ));
    server.join().expect("server");
}

#[test]
fn drain_token_is_awaited() {
    let monitor = Arc::new(DrainMonitor::new());
    let notifier = Arc::clone(&monitor);
    let (endpoint, server) = fake_app(move |reader, writer| {
        let (id, call) = next_call(reader);
        let token = call.drain().expect("drain token").to_owned();
        assert_eq!(token, "hello-1-0");
        write_frame(
            writer,
            &AppFrame::Reply {
                id,
                outcome: Outcome::Ok(Reply::Ack),
            },
        )
        .expect("reply");
        thread::sleep(Duration::from_millis(50));
        notifier.notify(&token);
    });

    let client = client_for(&endpoint).with_drain(
        Arc::clone(&monitor),
        "hello-1",
        Duration::from_secs(5),
    );
    let started = std::time::Instant::now();
    client
        .execute(
            &CallContext::background(),
            &ExecutedCommand::default(),
            &HostClientApi::new(),
        )
        .expect("execute");
    assert!(started.elapsed() >= Duration::from_millis(40));
    server.join().expect("server");
}

#[cfg(unix)]
mod process {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn script(dir: &TempDir, body: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("fake.app")).expect("utf8");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn connector() -> ProcessConnector {
        ProcessConnector::new(LaunchOptions {
            handshake_timeout: Duration::from_millis(300),
            ..LaunchOptions::default()
        })
    }

    fn launch(body: &str) -> HostError {
        let dir = TempDir::new().expect("temp dir");
        let artifact = script(&dir, body);
        let request = LaunchRequest {
            artifact: &artifact,
            name: "fake",
            sinks: OutputSinks::discard(),
        };
        match connector().launch(&request, &CallContext::background()) {
            Ok(_) => panic!("launch unexpectedly succeeded"),
            Err(error) => error,
        }
    }

    #[rstest]
    #[case::failure("exit 3")]
    #[case::success("exit 0")]
    fn silent_exit_is_reported(#[case] body: &str) {
        assert!(matches!(launch(body), HostError::ExitedEarly));
    }

    #[test]
    fn cookie_and_quiet_log_level_are_passed() {
        let body = format!(
            "[ \"$TRELLIS_APP_MAGIC_COOKIE\" = \"{}\" ] && [ \"$TRELLIS_APP_LOG\" = error ] && echo ready; sleep 5",
            crate::protocol::MAGIC_COOKIE_VALUE
        );
        match launch(&body) {
            HostError::Handshake { line, .. } => assert_eq!(line, "ready"),
            other => panic!("expected the environment-gated line, got {other:?}"),
        }
    }

    #[test]
    fn garbage_handshake_is_rejected() {
        let error = launch("echo 'hello there'; sleep 5");
        assert!(matches!(error, HostError::Handshake { .. }), "{error:?}");
    }

    #[test]
    fn slow_app_times_out() {
        let error = launch("sleep 5");
        assert!(matches!(error, HostError::HandshakeTimeout { .. }), "{error:?}");
    }

    #[test]
    fn newer_protocol_is_refused() {
        let error = launch(
            r#"echo '{"protocol_version":99,"endpoint":{"transport":"tcp","host":"127.0.0.1","port":1},"pid":1}'; sleep 5"#,
        );
        assert!(
            matches!(error, HostError::ProtocolMismatch { found: 99, .. }),
            "{error:?}"
        );
    }

    #[test]
    fn stale_descriptor_fails_to_reattach() {
        let descriptor = crate::cache::ReattachDescriptor {
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            endpoint: SocketEndpoint::unix("/nonexistent/trellis/gone.sock"),
            pid: 1,
        };
        let error = match connector().reattach(&descriptor, &CallContext::background()) {
            Ok(_) => panic!("reattach unexpectedly succeeded"),
            Err(error) => error,
        };
        assert!(matches!(error, HostError::Connect { .. }), "{error:?}");
    }

    #[test]
    fn stderr_is_forwarded() {
        let dir = TempDir::new().expect("temp dir");
        let artifact = script(&dir, "echo 'boom on stderr' >&2; exit 1");
        let captured = crate::testing::SharedBuffer::default();
        let request = LaunchRequest {
            artifact: &artifact,
            name: "fake",
            sinks: OutputSinks::new(Box::new(std::io::sink()), Box::new(captured.clone())),
        };
        assert!(connector().launch(&request, &CallContext::background()).is_err());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !captured.contents().contains("boom") && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(captured.contents().contains("boom on stderr"));
    }
}
