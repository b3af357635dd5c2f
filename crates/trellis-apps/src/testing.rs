//! Recording fakes for the seams of app hosting.
//!
//! Every fake appends what it was asked to do to an [`EventLog`], so tests
//! can assert on call order across several apps and sessions at once.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use trellis_config::SocketEndpoint;

use crate::cache::ReattachDescriptor;
use crate::client::ClientApi;
use crate::context::CallContext;
use crate::error::{HostError, ToolError};
use crate::host::{AppInterface, Connector, LaunchRequest, Session};
use crate::pipeline::{SourceFetcher, Toolchain};
use crate::protocol::{ExecutedCommand, ExecutedHook, Manifest, PROTOCOL_VERSION};
use crate::reference::RemoteSource;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory writer whose contents can be read from another handle.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Ordered record of calls made on fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push(&self, event: impl Into<String>) {
        lock(&self.0).push(event.into());
    }

    /// Snapshot of every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Number of events equal to `event`.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        lock(&self.0).iter().filter(|seen| *seen == event).count()
    }

    /// Forgets every event.
    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

/// An app that answers from a fixed manifest and records each call.
///
/// Events are `manifest`, `execute <path>`, and `<hook>.pre`, `<hook>.post`
/// or `<hook>.cleanup`. Any event registered with [`FakeApp::fail_on`] is
/// recorded and then answered with a remote error.
#[derive(Debug)]
pub struct FakeApp {
    manifest: Manifest,
    log: EventLog,
    failures: Mutex<HashSet<String>>,
}

impl FakeApp {
    /// Serves `manifest`, recording into `log`.
    #[must_use]
    pub fn new(manifest: Manifest, log: EventLog) -> Self {
        Self {
            manifest,
            log,
            failures: Mutex::new(HashSet::new()),
        }
    }

    /// Makes the call recorded as `event` fail.
    #[must_use]
    pub fn fail_on(self, event: impl Into<String>) -> Self {
        lock(&self.failures).insert(event.into());
        self
    }

    fn record(&self, event: String) -> Result<(), HostError> {
        let failing = lock(&self.failures).contains(&event);
        self.log.push(event.clone());
        if failing {
            return Err(HostError::Remote {
                message: format!("{event} failed"),
            });
        }
        Ok(())
    }
}

impl AppInterface for FakeApp {
    fn manifest(&self, ctx: &CallContext) -> Result<Manifest, HostError> {
        ctx.check()?;
        self.record("manifest".to_owned())?;
        Ok(self.manifest.clone())
    }

    fn execute(
        &self,
        ctx: &CallContext,
        command: &ExecutedCommand,
        _api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        ctx.check()?;
        self.record(format!("execute {}", command.path))
    }

    fn execute_hook_pre(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        ctx.check()?;
        self.record(format!("{}.pre", hook.hook.name))
    }

    fn execute_hook_post(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        ctx.check()?;
        self.record(format!("{}.post", hook.hook.name))
    }

    fn execute_hook_cleanup(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), HostError> {
        ctx.check()?;
        self.record(format!("{}.cleanup", hook.hook.name))
    }
}

/// Process table shared by every session a [`FakeConnector`] hands out.
#[derive(Debug, Default)]
struct FakeProcesses {
    next_pid: AtomicU32,
    live: Mutex<BTreeSet<u32>>,
}

/// Connector whose "processes" are [`FakeApp`]s serving one manifest.
///
/// Launches and reattachments share a process table, so several loaders
/// built from clones of one connector behave like separate invocations
/// talking to the same machine. Events are `launch <name> <pid>`,
/// `reattach <pid>`, `dispense <service> <pid>`, `terminate <pid>` and
/// `close <pid>`, followed by whatever the apps record.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    manifest: Manifest,
    log: EventLog,
    failures: Vec<String>,
    processes: Arc<FakeProcesses>,
}

impl FakeConnector {
    /// Process ids handed out by fakes start here, well above real pids.
    pub const FIRST_PID: u32 = 4_000_000;

    /// Connector whose apps serve `manifest`, recording into `log`.
    #[must_use]
    pub fn new(manifest: Manifest, log: EventLog) -> Self {
        Self {
            manifest,
            log,
            failures: Vec::new(),
            processes: Arc::new(FakeProcesses {
                next_pid: AtomicU32::new(Self::FIRST_PID),
                live: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Makes the call recorded as `event` fail on every app handed out.
    #[must_use]
    pub fn with_failure(mut self, event: impl Into<String>) -> Self {
        self.failures.push(event.into());
        self
    }

    /// Pids of processes launched and not yet terminated.
    #[must_use]
    pub fn live_pids(&self) -> Vec<u32> {
        lock(&self.processes.live).iter().copied().collect()
    }

    /// Marks `pid` as gone, as if the process crashed.
    pub fn crash(&self, pid: u32) {
        lock(&self.processes.live).remove(&pid);
    }

    fn session(&self, pid: u32, hosting: bool) -> Box<dyn Session> {
        let app = self
            .failures
            .iter()
            .fold(FakeApp::new(self.manifest.clone(), self.log.clone()), |app, event| {
                app.fail_on(event.clone())
            });
        Box::new(FakeSession {
            pid,
            hosting,
            app: Arc::new(app),
            log: self.log.clone(),
            processes: Arc::clone(&self.processes),
        })
    }
}

fn fake_descriptor(pid: u32) -> ReattachDescriptor {
    ReattachDescriptor {
        protocol_version: PROTOCOL_VERSION,
        endpoint: SocketEndpoint::unix(format!("/tmp/trellis-fake/{pid}.sock")),
        pid,
    }
}

impl Connector for FakeConnector {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError> {
        ctx.check()?;
        let pid = self.processes.next_pid.fetch_add(1, Ordering::SeqCst);
        lock(&self.processes.live).insert(pid);
        self.log.push(format!("launch {} {pid}", request.name));
        Ok(self.session(pid, true))
    }

    fn reattach(
        &self,
        descriptor: &ReattachDescriptor,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError> {
        ctx.check()?;
        let pid = descriptor.pid;
        if !lock(&self.processes.live).contains(&pid) {
            return Err(HostError::Connect {
                endpoint: descriptor.endpoint.to_string(),
                source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
            });
        }
        self.log.push(format!("reattach {pid}"));
        Ok(self.session(pid, false))
    }
}

struct FakeSession {
    pid: u32,
    hosting: bool,
    app: Arc<FakeApp>,
    log: EventLog,
    processes: Arc<FakeProcesses>,
}

impl Session for FakeSession {
    fn dispense(
        &mut self,
        service: &str,
        ctx: &CallContext,
    ) -> Result<Arc<dyn AppInterface>, HostError> {
        ctx.check()?;
        self.log.push(format!("dispense {service} {}", self.pid));
        Ok(Arc::clone(&self.app) as Arc<dyn AppInterface>)
    }

    fn descriptor(&self) -> ReattachDescriptor {
        fake_descriptor(self.pid)
    }

    fn terminate(&mut self, _grace: Duration) {
        if self.hosting {
            lock(&self.processes.live).remove(&self.pid);
            self.log.push(format!("terminate {}", self.pid));
        } else {
            self.close();
        }
    }

    fn close(&mut self) {
        self.log.push(format!("close {}", self.pid));
    }
}

/// Fetcher that creates the clone directory instead of running `git`.
///
/// Events are `fetch <repository>`. A failing fetcher still creates the
/// directory first, like an interrupted clone.
#[derive(Debug, Clone, Default)]
pub struct RecordingFetcher {
    log: EventLog,
    failure: Option<String>,
}

impl RecordingFetcher {
    /// Succeeding fetcher recording into `log`.
    #[must_use]
    pub fn new(log: EventLog) -> Self {
        Self { log, failure: None }
    }

    /// Fetcher whose tool fails with `stderr`.
    #[must_use]
    pub fn failing(log: EventLog, stderr: impl Into<String>) -> Self {
        Self {
            log,
            failure: Some(stderr.into()),
        }
    }
}

impl SourceFetcher for RecordingFetcher {
    fn fetch(&self, source: &RemoteSource, ctx: &CallContext) -> Result<(), ToolError> {
        ctx.check().map_err(|error| ToolError::Interrupted {
            command: "fake fetch".to_owned(),
            reason: error.to_string(),
        })?;
        self.log.push(format!("fetch {}", source.repository()));
        let target = source.clone_dir().join(source.subpath());
        fs::create_dir_all(&target).map_err(|error| ToolError::Io {
            path: target.clone(),
            source: Arc::new(error),
        })?;
        self.failure.as_ref().map_or(Ok(()), |stderr| {
            Err(ToolError::Failed {
                command: format!("git clone {}", source.clone_url()),
                status: "exit status: 128".to_owned(),
                stderr: stderr.clone(),
            })
        })
    }
}

/// Toolchain that writes a placeholder artifact instead of compiling.
///
/// Events are `tidy <src>` and `compile <name>`.
#[derive(Debug, Clone, Default)]
pub struct RecordingToolchain {
    log: EventLog,
    fail_tidy: bool,
    fail_compile: bool,
}

impl RecordingToolchain {
    /// Succeeding toolchain recording into `log`.
    #[must_use]
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_tidy: false,
            fail_compile: false,
        }
    }

    /// Makes the dependency step fail.
    #[must_use]
    pub const fn failing_tidy(mut self) -> Self {
        self.fail_tidy = true;
        self
    }

    /// Makes the compile step fail.
    #[must_use]
    pub const fn failing_compile(mut self) -> Self {
        self.fail_compile = true;
        self
    }
}

fn failed(command: &str) -> ToolError {
    ToolError::Failed {
        command: command.to_owned(),
        status: "exit status: 101".to_owned(),
        stderr: "error: could not compile".to_owned(),
    }
}

impl Toolchain for RecordingToolchain {
    fn tidy(&self, src: &Utf8Path, _ctx: &CallContext) -> Result<(), ToolError> {
        self.log.push(format!("tidy {src}"));
        if self.fail_tidy {
            return Err(failed("cargo fetch"));
        }
        Ok(())
    }

    fn compile(
        &self,
        _src: &Utf8Path,
        name: &str,
        artifact: &Utf8Path,
        _ctx: &CallContext,
    ) -> Result<(), ToolError> {
        self.log.push(format!("compile {name}"));
        if self.fail_compile {
            return Err(failed("cargo build"));
        }
        fs::write(artifact, b"fake artifact").map_err(|error| ToolError::Io {
            path: artifact.to_path_buf(),
            source: Arc::new(error),
        })
    }
}
