//! Error taxonomy for app hosting.
//!
//! Each component owns an enum with structured fields; [`AppError`] wraps
//! them with the stage that failed so the error recorded on an app always
//! says where loading stopped. Non-`Clone` causes are held in `Arc` so the
//! recorded error can be cloned out of the app.

use std::fmt;
use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

#[cfg(test)]
mod tests;

/// Failures turning a reference string into an app location.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The configured reference was empty.
    #[error("missing app property \"path\"")]
    MissingPath,

    /// A local reference does not exist.
    #[error("local app path {path:?} not found")]
    LocalNotFound {
        /// Configured local path.
        path: String,
    },

    /// A local reference exists but is not a directory.
    #[error("local app path {path:?} is not a directory")]
    LocalNotDirectory {
        /// Configured local path.
        path: String,
    },

    /// A local reference could not be inspected.
    #[error("local app path {path:?} could not be inspected: {message}")]
    LocalInspect {
        /// Configured local path.
        path: String,
        /// Description of the I/O failure.
        message: String,
    },

    /// A remote reference has fewer than three path segments.
    #[error("app path {path:?} is not a valid repository URL")]
    InvalidRepository {
        /// Reference without its revision suffix.
        path: String,
    },
}

/// Failures of the reattachment cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Entries are keyed by app reference and the key was empty.
    #[error("reattachment cache key must not be empty")]
    EmptyReference,

    /// The cache file exists but could not be read.
    #[error("failed to read reattachment cache '{path}': {source}")]
    Read {
        /// Cache file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The updated cache could not be encoded.
    #[error("failed to encode reattachment cache: {0}")]
    Encode(#[source] Arc<serde_json::Error>),

    /// The cache file could not be written.
    #[error("failed to write reattachment cache '{path}': {source}")]
    Write {
        /// Cache file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The lock file could not be created or cleaned.
    #[error("failed to manage cache lock '{path}': {source}")]
    Lock {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Another process held the lock for longer than the wait budget.
    #[error("timed out after {waited_ms}ms waiting for cache lock '{path}'")]
    LockTimeout {
        /// Lock file path.
        path: Utf8PathBuf,
        /// Time spent waiting.
        waited_ms: u128,
    },
}

/// Failures of an external tool (`git`, `cargo`).
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// The executable is not on `PATH`.
    #[error("`{program}` executable not found: {message}")]
    NotFound {
        /// Program name.
        program: String,
        /// Lookup failure description.
        message: String,
    },

    /// The executable could not be started.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The tool exited unsuccessfully.
    #[error("`{command}` failed with {status}: {stderr}")]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Trimmed standard error.
        stderr: String,
    },

    /// The caller's context ended while the tool was running.
    #[error("`{command}` interrupted: {reason}")]
    Interrupted {
        /// Rendered command line.
        command: String,
        /// Cancellation or deadline description.
        reason: String,
    },

    /// The build finished without producing the expected executable.
    #[error("build produced no executable: {message}")]
    MissingArtifact {
        /// What was looked for.
        message: String,
    },

    /// Copying or inspecting files around the tool failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// The two toolchain steps of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    /// Dependency resolution.
    Tidy,
    /// Compilation.
    Compile,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tidy => f.write_str("cargo fetch"),
            Self::Compile => f.write_str("cargo build"),
        }
    }
}

/// Failures of the fetch/build pipeline.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Cloning a remote app failed.
    #[error("cloning {repository:?}: {source}")]
    Fetch {
        /// Repository key (`host/org/repo[@rev]`).
        repository: String,
        /// Tool failure.
        #[source]
        source: ToolError,
    },

    /// A build step failed.
    #[error("{step}: {source}")]
    Build {
        /// Step that failed.
        step: BuildStep,
        /// Tool failure.
        #[source]
        source: ToolError,
    },

    /// The source tree could not be walked for the staleness check.
    #[error("inspecting sources in '{path}': {message}")]
    Inspect {
        /// Directory being walked.
        path: Utf8PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// Removing a clone directory failed.
    #[error("removing '{path}': {source}")]
    Clean {
        /// Directory being removed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Failures talking to an app process.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The artifact could not be started.
    #[error("failed to start app binary '{binary}': {source}")]
    Spawn {
        /// Artifact path.
        binary: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The process exited before printing its handshake.
    #[error("app exited before completing the handshake")]
    ExitedEarly,

    /// No handshake arrived in time.
    #[error("no handshake from app within {timeout_ms}ms")]
    HandshakeTimeout {
        /// Wait budget in milliseconds.
        timeout_ms: u128,
    },

    /// The handshake line was malformed.
    #[error("invalid handshake line {line:?}: {message}")]
    Handshake {
        /// Raw line received.
        line: String,
        /// Parse failure.
        message: String,
    },

    /// Host and app speak different protocol versions.
    #[error("protocol version mismatch: host speaks {expected}, app speaks {found}")]
    ProtocolMismatch {
        /// Host protocol version.
        expected: u32,
        /// Version announced by the app.
        found: u32,
    },

    /// Dialing the app endpoint failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        /// Endpoint display form.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The endpoint transport is not available on this platform.
    #[error("transport for {endpoint} is not supported on this platform")]
    UnsupportedTransport {
        /// Endpoint display form.
        endpoint: String,
    },

    /// Reading or writing frames failed.
    #[error("transport I/O failed: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(#[source] Arc<serde_json::Error>),

    /// A frame could not be decoded.
    #[error("failed to decode frame: {message}")]
    Decode {
        /// Decoder message.
        message: String,
    },

    /// The app closed the connection mid-call.
    #[error("app closed the connection")]
    Disconnected,

    /// The reply did not match the request.
    #[error("unexpected reply, expected {expected}")]
    UnexpectedReply {
        /// Reply kind the host waited for.
        expected: &'static str,
    },

    /// The app reported an error for the call.
    #[error("{message}")]
    Remote {
        /// Message reported by the app.
        message: String,
    },

    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,

    /// The call outlived its deadline.
    #[error("call deadline exceeded")]
    DeadlineExceeded,

    /// An earlier call was interrupted so the stream position is unknown.
    #[error("connection is unusable after an interrupted call")]
    Poisoned,

    /// The client was closed by its owner.
    #[error("app client is closed")]
    Closed,

    /// A published descriptor points at a process that no longer serves.
    #[error("reattachment descriptor for pid {pid} at {endpoint} is stale: {reason}")]
    StaleDescriptor {
        /// Recorded process id.
        pid: u32,
        /// Recorded endpoint.
        endpoint: String,
        /// Why reattaching failed.
        reason: String,
    },
}

impl From<io::Error> for HostError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

/// Failures of the app-side listener.
#[derive(Debug, Clone, Error)]
pub enum ListenerError {
    /// The endpoint could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// Endpoint display form.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Unix sockets are not available on this platform.
    #[error("unix socket {endpoint} is not supported on this platform")]
    UnsupportedUnix {
        /// Endpoint display form.
        endpoint: String,
    },

    /// The listener could not be made non-blocking.
    #[error("failed to configure listener: {source}")]
    NonBlocking {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The accept thread panicked.
    #[error("listener thread panicked")]
    ThreadPanic,
}

/// Failures splicing an app into the command tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A command's attachment path does not exist.
    #[error("unable to find command path {path:?} for app {app:?}")]
    CommandPathNotFound {
        /// Normalised attachment path.
        path: String,
        /// App reference.
        app: String,
    },

    /// A command was placed under a runnable command.
    #[error("can't attach app command {command:?} to runnable command {path:?}")]
    RunnableParent {
        /// Usage string of the command.
        command: String,
        /// Path of the runnable command.
        path: String,
    },

    /// A sibling with the same name exists.
    #[error("app command {name:?} already exists under {parent:?}")]
    CommandExists {
        /// First token of the command usage.
        name: String,
        /// Path of the parent command.
        parent: String,
    },

    /// A command declares a flag the parser cannot accept.
    #[error("app command {command:?} declares conflicting flag {flag:?}: {reason}")]
    FlagConflict {
        /// Path of the command declaring the flag.
        command: String,
        /// Flag name as declared.
        flag: String,
        /// What is wrong with the flag.
        reason: String,
    },

    /// A hook's attachment path does not exist.
    #[error("unable to find command path {path:?} for app hook {hook:?}")]
    HookPathNotFound {
        /// Normalised attachment path.
        path: String,
        /// Hook name.
        hook: String,
    },

    /// A hook was placed on a dispatch-only command.
    #[error("can't attach app hook {hook:?} to non executable command {path:?}")]
    HookOnDispatchOnly {
        /// Hook name.
        hook: String,
        /// Attachment path as declared.
        path: String,
    },

    /// The app has no manifest because it never connected.
    #[error("app {app:?} is not loaded")]
    NotLoaded {
        /// App reference.
        app: String,
    },
}

/// Failures running a command from the tree.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// A call into an app failed.
    #[error("app {app:?} {call}() error: {source}")]
    App {
        /// App reference.
        app: String,
        /// Interface method that failed.
        call: &'static str,
        /// Underlying failure.
        #[source]
        source: HostError,
    },

    /// No node exists at the path.
    #[error("unknown command {path:?}")]
    NotFound {
        /// Normalised command path.
        path: String,
    },

    /// The node only groups subcommands.
    #[error("command {path:?} is not runnable")]
    NotRunnable {
        /// Normalised command path.
        path: String,
    },

    /// A built-in command failed.
    #[error("{message}")]
    Failed {
        /// Message shown to the user.
        message: String,
    },
}

impl CommandError {
    /// Builds a built-in command failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Failures reported by the client API passed to apps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientApiError {
    /// No chain was bound when the API was built.
    #[error("no chain is bound to the client API")]
    NoChain,

    /// The bound chain failed to describe itself.
    #[error("chain info unavailable: {0}")]
    Chain(String),

    /// The callback to the host failed.
    #[error("client API callback failed: {0}")]
    Transport(String),

    /// The host answered the callback with an error.
    #[error("{0}")]
    Host(String),
}

/// Pipeline stage at which an app stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Parsing the reference.
    Resolve,
    /// Cloning sources.
    Fetch,
    /// Building the artifact.
    Build,
    /// Launching or reattaching.
    Connect,
    /// Requesting the named service.
    Dispense,
    /// Fetching the manifest.
    Manifest,
    /// Publishing the reattachment descriptor.
    Publish,
    /// Grafting into the command tree.
    Link,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Resolve => "resolve",
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Connect => "connect",
            Self::Dispense => "dispense",
            Self::Manifest => "manifest",
            Self::Publish => "publish",
            Self::Link => "link",
        };
        f.write_str(label)
    }
}

/// Terminal error recorded on an app.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// The reference could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Fetching or building failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The reattachment cache could not be consulted.
    #[error("reading reattachment cache: {0}")]
    Plan(#[source] CacheError),

    /// Launching or reattaching failed.
    #[error("connecting: {0}")]
    Connect(#[source] HostError),

    /// The app did not expose its service.
    #[error("dispensing: {0}")]
    Dispense(#[source] HostError),

    /// The manifest could not be fetched.
    #[error("manifest load: {0}")]
    Manifest(#[source] HostError),

    /// Publishing the descriptor failed.
    #[error("publishing reattachment descriptor: {0}")]
    Publish(#[source] CacheError),

    /// Grafting failed.
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl AppError {
    /// Stage at which the app stopped.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Resolve(_) => Stage::Resolve,
            Self::Pipeline(PipelineError::Fetch { .. } | PipelineError::Clean { .. }) => {
                Stage::Fetch
            }
            Self::Pipeline(PipelineError::Build { .. } | PipelineError::Inspect { .. }) => {
                Stage::Build
            }
            Self::Plan(_) | Self::Connect(_) => Stage::Connect,
            Self::Dispense(_) => Stage::Dispense,
            Self::Manifest(_) => Stage::Manifest,
            Self::Publish(_) => Stage::Publish,
            Self::Link(_) => Stage::Link,
        }
    }
}

/// Combined link failure over several apps.
#[derive(Debug, Clone, Error)]
#[error("fail to link: {}", render_failures(.failures))]
pub struct LinkFailures {
    /// App reference and its error, in load order.
    pub failures: Vec<(String, AppError)>,
}

fn render_failures(failures: &[(String, AppError)]) -> String {
    failures
        .iter()
        .map(|(reference, error)| format!("{reference}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by an [`AppService`](crate::serve::AppService) method.
///
/// Only the message crosses the wire; the host sees it as
/// [`HostError::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    /// Creates an error carrying `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The reported message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ClientApiError> for ServiceError {
    fn from(error: ClientApiError) -> Self {
        Self::new(error.to_string())
    }
}

/// Failures of the app-side runtime before or while serving.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The binary was started without the host's cookie.
    #[error(
        "this binary is a trellis app and is not meant to be executed directly; \
         install it with `trellis app install`"
    )]
    NotHosted,

    /// The socket directory could not be prepared.
    #[error(transparent)]
    Socket(#[from] trellis_config::SocketPreparationError),

    /// The listener could not be started.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// The handshake line could not be written.
    #[error("failed to write handshake: {0}")]
    Handshake(#[source] io::Error),

    /// The handshake could not be encoded.
    #[error("failed to encode handshake: {0}")]
    Encode(#[source] serde_json::Error),
}
