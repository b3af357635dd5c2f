//! Starting app binaries and reattaching to running ones.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::output::{DrainMonitor, OutputSinks};
use super::rpc::{DEFAULT_DRAIN_WAIT, RpcAppClient};
use super::{AppInterface, Connector, HOST_TARGET, LaunchRequest, Session};
use crate::cache::ReattachDescriptor;
use crate::context::CallContext;
use crate::error::HostError;
use crate::protocol::{
    Handshake, LOG_LEVEL_KEY, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
    parse_drain_marker,
};
use crate::transport;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REAP_POLL: Duration = Duration::from_millis(20);

/// Tuning for [`ProcessConnector`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run apps with verbose logging.
    pub debug: bool,
    /// Longest wait for the handshake line.
    pub handshake_timeout: Duration,
    /// Longest wait when dialing an endpoint.
    pub connect_timeout: Duration,
    /// Longest wait for output to drain after a call.
    pub drain_wait: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            debug: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_wait: DEFAULT_DRAIN_WAIT,
        }
    }
}

/// [`Connector`] for real app processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    options: LaunchOptions,
}

impl ProcessConnector {
    /// Creates a connector with the given options.
    #[must_use]
    pub const fn new(options: LaunchOptions) -> Self {
        Self { options }
    }

    fn log_level(&self) -> &'static str {
        if self.options.debug { "trace" } else { "error" }
    }
}

impl Connector for ProcessConnector {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError> {
        ctx.check()?;
        let mut command = Command::new(request.artifact.as_std_path());
        command
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(LOG_LEVEL_KEY, self.log_level())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = request.artifact.parent() {
            command.current_dir(dir);
        }
        let spawned = command.spawn().map_err(|source| HostError::Spawn {
            binary: request.artifact.to_path_buf(),
            source: Arc::new(source),
        })?;
        let mut guard = ChildGuard::new(spawned);
        let pid = guard.pid();
        debug!(target: HOST_TARGET, app = request.name, pid, "app process started");

        let monitor = Arc::new(DrainMonitor::new());
        let (handshake_tx, handshake_rx) = mpsc::sync_channel(1);
        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = guard.take_stdout() {
            forwarders.push(spawn_stdout_forwarder(
                stdout,
                request.sinks.clone(),
                Arc::clone(&monitor),
                handshake_tx,
            ));
        }
        if let Some(stderr) = guard.take_stderr() {
            forwarders.push(spawn_stderr_forwarder(stderr, request.sinks.clone()));
        }

        let wait = ctx
            .remaining()
            .map_or(self.options.handshake_timeout, |left| {
                left.min(self.options.handshake_timeout)
            });
        let line = match handshake_rx.recv_timeout(wait) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                ctx.check()?;
                return Err(HostError::HandshakeTimeout {
                    timeout_ms: wait.as_millis(),
                });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(HostError::ExitedEarly),
        };
        let handshake = Handshake::parse(&line)?;
        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(HostError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: handshake.protocol_version,
            });
        }
        let descriptor = handshake.into_descriptor();
        let connection = transport::connect(&descriptor.endpoint, self.options.connect_timeout)?;
        let client = RpcAppClient::new(connection, descriptor.endpoint.to_string())?.with_drain(
            monitor,
            format!("{}-{pid}", request.name),
            self.options.drain_wait,
        );
        info!(
            target: HOST_TARGET,
            app = request.name,
            pid,
            endpoint = %descriptor.endpoint,
            "app process connected"
        );
        Ok(Box::new(ProcessSession {
            name: request.name.to_owned(),
            client: Arc::new(client),
            descriptor,
            child: guard.disarm(),
            forwarders,
        }))
    }

    fn reattach(
        &self,
        descriptor: &ReattachDescriptor,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError> {
        ctx.check()?;
        if descriptor.protocol_version != PROTOCOL_VERSION {
            return Err(HostError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                found: descriptor.protocol_version,
            });
        }
        let connect_timeout = ctx
            .remaining()
            .map_or(self.options.connect_timeout, |left| {
                left.min(self.options.connect_timeout)
            });
        let connection = transport::connect(&descriptor.endpoint, connect_timeout)?;
        let client = RpcAppClient::new(connection, descriptor.endpoint.to_string())?;
        debug!(
            target: HOST_TARGET,
            pid = descriptor.pid,
            endpoint = %descriptor.endpoint,
            "reattached to app process"
        );
        Ok(Box::new(ProcessSession {
            name: String::new(),
            client: Arc::new(client),
            descriptor: descriptor.clone(),
            child: None,
            forwarders: Vec::new(),
        }))
    }
}

/// Session over a connection, owning the child process when this host
/// started it.
struct ProcessSession {
    name: String,
    client: Arc<RpcAppClient>,
    descriptor: ReattachDescriptor,
    child: Option<Child>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Session for ProcessSession {
    fn dispense(
        &mut self,
        service: &str,
        ctx: &CallContext,
    ) -> Result<Arc<dyn AppInterface>, HostError> {
        self.client.dispense(service, ctx)?;
        if self.name.is_empty() {
            service.clone_into(&mut self.name);
        }
        Ok(Arc::clone(&self.client) as Arc<dyn AppInterface>)
    }

    fn descriptor(&self) -> ReattachDescriptor {
        self.descriptor.clone()
    }

    fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            self.close();
            return;
        };
        let ctx = CallContext::background().with_timeout(grace);
        if let Err(error) = self.client.shutdown(&ctx) {
            debug!(
                target: HOST_TARGET,
                app = %self.name,
                error = %error,
                "graceful shutdown request failed"
            );
        }
        self.client.close();
        reap(&mut child, grace, &self.name);
        for forwarder in self.forwarders.drain(..) {
            if forwarder.join().is_err() {
                warn!(target: HOST_TARGET, app = %self.name, "output forwarder panicked");
            }
        }
    }

    fn close(&mut self) {
        self.client.close();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate(Duration::ZERO);
        }
    }
}

/// Waits up to `grace` for the child to exit, then kills it, then reaps it.
fn reap(child: &mut Child, grace: Duration, name: &str) {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: HOST_TARGET, app = name, ?status, "app process exited");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
            Ok(None) => break,
            Err(error) => {
                warn!(target: HOST_TARGET, app = name, error = %error, "failed to poll app process");
                break;
            }
        }
    }
    warn!(target: HOST_TARGET, app = name, pid = child.id(), "killing app process");
    if let Err(error) = child.kill() {
        debug!(target: HOST_TARGET, app = name, error = %error, "kill failed");
    }
    if let Err(error) = child.wait() {
        warn!(target: HOST_TARGET, app = name, error = %error, "failed to reap app process");
    }
}

/// Kills and reaps the child unless disarmed.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    const fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn pid(&self) -> u32 {
        self.child.as_ref().map_or(0, Child::id)
    }

    fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|child| child.stdout.take())
    }

    fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|child| child.stderr.take())
    }

    fn disarm(mut self) -> Option<Child> {
        self.child.take()
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(error) = child.kill() {
                debug!(target: HOST_TARGET, error = %error, "kill after failed launch");
            }
            if let Err(error) = child.wait() {
                debug!(target: HOST_TARGET, error = %error, "reap after failed launch");
            }
        }
    }
}

fn spawn_stdout_forwarder(
    stdout: ChildStdout,
    sinks: OutputSinks,
    monitor: Arc<DrainMonitor>,
    handshake: SyncSender<String>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut first = String::new();
        match reader.read_line(&mut first) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                if handshake.send(first).is_err() {
                    return;
                }
            }
        }
        drop(handshake);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let marker = std::str::from_utf8(&line)
                .ok()
                .and_then(parse_drain_marker);
            match marker {
                Some(token) => monitor.notify(token),
                None => sinks.write_stdout(&line),
            }
        }
    })
}

fn spawn_stderr_forwarder(stderr: ChildStderr, sinks: OutputSinks) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = stderr;
        let mut buffer = [0_u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => return,
                Ok(read) => sinks.write_stderr(buffer.get(..read).unwrap_or_default()),
            }
        }
    })
}
