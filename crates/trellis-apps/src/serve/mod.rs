//! App side of the host protocol.
//!
//! An app binary hands its [`AppService`] to [`run`]. The runtime refuses to
//! start without the host's cookie, binds a per-process socket, announces it
//! with the handshake line on stdout and then serves host connections until
//! one of them asks it to shut down. Several hosts may be connected at once
//! when the app is a shared host.

mod dispatch;


use std::env;
use std::io::{self, IsTerminal, Write};
use std::process::ExitCode;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trellis_config::SocketEndpoint;

use self::dispatch::Dispatcher;
use crate::client::ClientApi;
use crate::error::{ServeError, ServiceError};
use crate::protocol::{
    ExecutedCommand, ExecutedHook, Handshake, LOG_LEVEL_KEY, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    Manifest, PROTOCOL_VERSION,
};
use crate::transport::SocketListener;

const SERVE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::serve");

/// Directory under the system temp dir holding app sockets.
const SOCKET_DIR: &str = "trellis";

/// Behaviour an app exposes to the host.
///
/// Output written to stdout while serving a call is forwarded to the user.
/// Hook phases default to doing nothing.
pub trait AppService: Send + Sync {
    /// Describes the app's commands and hooks.
    ///
    /// # Errors
    ///
    /// Reported to the host, which then refuses to load the app.
    fn manifest(&self) -> Result<Manifest, ServiceError>;

    /// Runs one of the app's commands.
    ///
    /// # Errors
    ///
    /// Reported to the user as the command's failure.
    fn execute(&self, command: &ExecutedCommand, api: &dyn ClientApi) -> Result<(), ServiceError>;

    /// Runs before the hooked command.
    ///
    /// # Errors
    ///
    /// Aborts the hooked command.
    fn execute_hook_pre(
        &self,
        _hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Runs after the hooked command succeeded.
    ///
    /// # Errors
    ///
    /// Fails the hooked command.
    fn execute_hook_post(
        &self,
        _hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Runs once the hooked command finished, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Logged by the host.
    fn execute_hook_cleanup(
        &self,
        _hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Serves `service` and maps the outcome to an exit code. Intended as the
/// whole body of an app's `main`.
#[must_use]
pub fn run(name: &str, service: Arc<dyn AppService>) -> ExitCode {
    match serve(name, service) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(io::stderr(), "{error}");
            ExitCode::FAILURE
        }
    }
}

/// Serves `service` under `name` until a host asks for shutdown.
///
/// # Errors
///
/// Fails when the binary was not started by a host, or when the listener
/// or the handshake cannot be set up.
pub fn serve(name: &str, service: Arc<dyn AppService>) -> Result<(), ServeError> {
    if env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(ServeError::NotHosted);
    }
    install_logging();

    let pid = std::process::id();
    let endpoint = app_endpoint(name, pid);
    endpoint.prepare_filesystem()?;
    let listener = SocketListener::bind(&endpoint)?;
    let announced = listener.local_endpoint();

    let shutdown = Arc::new(ShutdownLatch::default());
    let dispatcher = Dispatcher::new(name, service, Arc::clone(&shutdown), stdout_sink());
    let handle = listener.start(Arc::new(dispatcher))?;

    let handshake = Handshake {
        protocol_version: PROTOCOL_VERSION,
        endpoint: announced.clone(),
        pid,
    };
    let mut line = serde_json::to_string(&handshake).map_err(ServeError::Encode)?;
    line.push('\n');
    {
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(line.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(ServeError::Handshake)?;
    }
    info!(target: SERVE_TARGET, app = name, pid, endpoint = %announced, "app serving");

    shutdown.wait();
    handle.shutdown();
    handle.join()?;
    info!(target: SERVE_TARGET, app = name, pid, "app stopped");
    Ok(())
}

#[cfg(unix)]
fn app_endpoint(name: &str, pid: u32) -> SocketEndpoint {
    camino::Utf8PathBuf::from_path_buf(env::temp_dir()).map_or_else(
        |_| SocketEndpoint::tcp("127.0.0.1", 0),
        |temp| SocketEndpoint::app_socket(&temp.join(SOCKET_DIR), name, pid),
    )
}

#[cfg(not(unix))]
fn app_endpoint(_name: &str, _pid: u32) -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", 0)
}

/// Logs go to stderr, which the host forwards; the level comes from the
/// host.
fn install_logging() {
    let level = env::var(LOG_LEVEL_KEY).unwrap_or_else(|_| "error".to_owned());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("error"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(true)
        .compact()
        .try_init();
    if installed.is_err() {
        warn!(target: SERVE_TARGET, "a tracing subscriber was already installed");
    }
}

/// Where drain markers are written; shared with the service's own output.
pub(crate) type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

fn stdout_sink() -> OutputSink {
    Arc::new(Mutex::new(Box::new(io::stdout())))
}

/// Released once a host requests shutdown.
#[derive(Debug, Default)]
pub(crate) struct ShutdownLatch {
    released: Mutex<bool>,
    signal: Condvar,
}

impl ShutdownLatch {
    pub(crate) fn release(&self) {
        if let Ok(mut released) = self.released.lock() {
            *released = true;
            self.signal.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_released(&self) -> bool {
        self.released.lock().is_ok_and(|released| *released)
    }

    fn wait(&self) {
        let Ok(mut released) = self.released.lock() else {
            return;
        };
        while !*released {
            match self.signal.wait(released) {
                Ok(guard) => released = guard,
                Err(_) => return,
            }
        }
    }
}
