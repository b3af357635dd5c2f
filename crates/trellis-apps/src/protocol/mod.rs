//! Wire protocol between the host and an app process.
//!
//! On start the app prints a single [`Handshake`] line on stdout. Every later
//! exchange happens on the announced endpoint as newline-delimited JSON: the
//! host sends [`HostFrame`]s and the app answers with [`AppFrame`]s. While a
//! call is in flight the app may issue callbacks for the client API, which
//! the host answers on the same connection before the final reply arrives.

mod executed;
mod manifest;


use std::io::Write;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_config::SocketEndpoint;

pub use self::executed::{ChainInfo, ExecutedCommand, ExecutedFlag, ExecutedHook};
pub use self::manifest::{CommandSpec, FlagKind, FlagSpec, HookSpec, Manifest};
use crate::cache::ReattachDescriptor;
use crate::error::HostError;

/// Version of the frame layout below.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the handshake cookie.
pub const MAGIC_COOKIE_KEY: &str = "TRELLIS_APP_MAGIC_COOKIE";

/// Expected cookie value. Binaries started without it are not under a host.
pub const MAGIC_COOKIE_VALUE: &str = "5b1d0c7e9a3f4e61b2c8d4a07f6e9132";

/// Environment variable carrying the app's log level.
pub const LOG_LEVEL_KEY: &str = "TRELLIS_APP_LOG";

/// Prefix of the stdout line an app writes once a call's output is flushed.
pub const DRAIN_MARKER_PREFIX: &str = "\u{1e}trellis:drain:";

/// First stdout line of an app process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol version the app speaks.
    pub protocol_version: u32,
    /// Endpoint the app listens on.
    pub endpoint: SocketEndpoint,
    /// Process id of the app.
    pub pid: u32,
}

impl Handshake {
    /// Parses a handshake line.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Handshake`] when the line is not a handshake.
    pub fn parse(line: &str) -> Result<Self, HostError> {
        serde_json::from_str(line.trim()).map_err(|error| HostError::Handshake {
            line: line.trim_end().to_owned(),
            message: error.to_string(),
        })
    }

    /// The descriptor another invocation would use to reattach.
    #[must_use]
    pub fn into_descriptor(self) -> ReattachDescriptor {
        ReattachDescriptor {
            protocol_version: self.protocol_version,
            endpoint: self.endpoint,
            pid: self.pid,
        }
    }
}

/// Operations the host invokes on an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum HostCall {
    /// Asks for the named service; apps serve exactly one.
    Dispense {
        /// Service name, the app's display name.
        service: String,
    },
    /// Requests the manifest.
    Manifest,
    /// Runs a command.
    Execute {
        /// Invocation details.
        command: ExecutedCommand,
        /// Token to echo in a drain marker once output is flushed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain: Option<String>,
    },
    /// Runs a hook's pre phase.
    HookPre {
        /// Invocation details.
        hook: ExecutedHook,
        /// Drain token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain: Option<String>,
    },
    /// Runs a hook's post phase.
    HookPost {
        /// Invocation details.
        hook: ExecutedHook,
        /// Drain token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain: Option<String>,
    },
    /// Runs a hook's cleanup phase.
    HookCleanup {
        /// Invocation details.
        hook: ExecutedHook,
        /// Drain token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        drain: Option<String>,
    },
    /// Asks the app to exit after replying.
    Shutdown,
}

impl HostCall {
    /// Method name used in logs.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Dispense { .. } => "dispense",
            Self::Manifest => "manifest",
            Self::Execute { .. } => "execute",
            Self::HookPre { .. } => "hook_pre",
            Self::HookPost { .. } => "hook_post",
            Self::HookCleanup { .. } => "hook_cleanup",
            Self::Shutdown => "shutdown",
        }
    }

    /// Drain token carried by the call, if any.
    #[must_use]
    pub fn drain(&self) -> Option<&str> {
        match self {
            Self::Execute { drain, .. }
            | Self::HookPre { drain, .. }
            | Self::HookPost { drain, .. }
            | Self::HookCleanup { drain, .. } => drain.as_deref(),
            Self::Dispense { .. } | Self::Manifest | Self::Shutdown => None,
        }
    }
}

/// Result of a call, with errors carried as display text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    /// The call succeeded.
    Ok(T),
    /// The call failed with this message.
    Err(String),
}

impl<T> Outcome<T> {
    /// Converts into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried message for [`Outcome::Err`].
    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err(message) => Err(message),
        }
    }
}

impl<T, E: ToString> From<Result<T, E>> for Outcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Err(error.to_string()),
        }
    }
}

/// Successful reply payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// The call completed without a payload.
    Ack,
    /// The app's manifest.
    Manifest(Manifest),
}

/// Callback operations an app invokes on the host while serving a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientCall {
    /// Requests the chain description.
    ChainInfo,
}

/// Frames written by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostFrame {
    /// A new call.
    Call {
        /// Correlation id, unique per connection.
        id: u64,
        /// Remaining time budget of the caller.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        /// The operation.
        call: HostCall,
    },
    /// Answer to an app callback.
    CallbackReply {
        /// Id of the callback being answered.
        id: u64,
        /// Callback result.
        outcome: Outcome<ChainInfo>,
    },
}

/// Frames written by the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppFrame {
    /// Final answer to a host call.
    Reply {
        /// Id of the call being answered.
        id: u64,
        /// Call result.
        outcome: Outcome<Reply>,
    },
    /// A client API request made while serving a call.
    Callback {
        /// Callback id, unique per connection.
        id: u64,
        /// The request.
        call: ClientCall,
    },
}

/// Writes one frame followed by a newline and flushes.
///
/// # Errors
///
/// Fails when the frame cannot be encoded or written.
pub fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), HostError>
where
    W: Write + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(|e| HostError::Encode(Arc::new(e)))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Decodes one frame from a line, trailing newline allowed.
///
/// # Errors
///
/// Returns [`HostError::Decode`] for malformed input.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, HostError> {
    serde_json::from_slice(line.trim_ascii_end()).map_err(|error| HostError::Decode {
        message: error.to_string(),
    })
}

/// Renders the drain marker line for `token`, newline included.
#[must_use]
pub fn drain_marker(token: &str) -> String {
    format!("{DRAIN_MARKER_PREFIX}{token}\n")
}

/// Extracts the token from a drain marker line.
#[must_use]
pub fn parse_drain_marker(line: &str) -> Option<&str> {
    line.trim_end_matches(['\r', '\n'])
        .strip_prefix(DRAIN_MARKER_PREFIX)
}
