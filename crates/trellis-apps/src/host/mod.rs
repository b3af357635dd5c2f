//! Process hosting: launching app binaries, reattaching to running ones, and
//! calling them over the wire protocol.
//!
//! The [`Connector`] trait is the seam between the app state machine and
//! real processes. [`ProcessConnector`] spawns artifacts and reads their
//! handshake; tests substitute recording fakes.

mod launch;
mod output;
mod rpc;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;

pub use self::launch::{LaunchOptions, ProcessConnector};
pub use self::output::{DrainMonitor, OutputSinks, SharedWriter};
pub use self::rpc::RpcAppClient;
use crate::cache::ReattachDescriptor;
use crate::client::ClientApi;
use crate::context::CallContext;
use crate::error::HostError;
use crate::protocol::{ExecutedCommand, ExecutedHook, Manifest};

const HOST_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// Grace period between a shutdown request and a kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Operations an app exposes to the host.
pub trait AppInterface: Send + Sync {
    /// Returns the app's manifest.
    ///
    /// # Errors
    ///
    /// Fails when the call cannot complete or the app reports an error.
    fn manifest(&self, ctx: &CallContext) -> Result<Manifest, HostError>;

    /// Runs a command the app contributed.
    ///
    /// # Errors
    ///
    /// Fails when the call cannot complete or the app reports an error.
    fn execute(
        &self,
        ctx: &CallContext,
        command: &ExecutedCommand,
        api: &dyn ClientApi,
    ) -> Result<(), HostError>;

    /// Runs the pre phase of a hook.
    ///
    /// # Errors
    ///
    /// Fails when the call cannot complete or the app reports an error.
    fn execute_hook_pre(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError>;

    /// Runs the post phase of a hook.
    ///
    /// # Errors
    ///
    /// Fails when the call cannot complete or the app reports an error.
    fn execute_hook_post(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError>;

    /// Runs the cleanup phase of a hook.
    ///
    /// # Errors
    ///
    /// Fails when the call cannot complete or the app reports an error.
    fn execute_hook_cleanup(
        &self,
        ctx: &CallContext,
        hook: &ExecutedHook,
        api: &dyn ClientApi,
    ) -> Result<(), HostError>;
}

/// What the host needs to start an app binary.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    /// Built artifact to execute.
    pub artifact: &'a Utf8Path,
    /// App display name, used in logs.
    pub name: &'a str,
    /// Destinations for the process's output.
    pub sinks: OutputSinks,
}

/// Produces sessions with app processes.
pub trait Connector: Send + Sync {
    /// Starts the artifact and connects to it.
    ///
    /// # Errors
    ///
    /// Fails when the process cannot be started, does not complete the
    /// handshake, or cannot be dialed.
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError>;

    /// Connects to a process another invocation published.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor's protocol differs or nothing answers at
    /// its endpoint.
    fn reattach(
        &self,
        descriptor: &ReattachDescriptor,
        ctx: &CallContext,
    ) -> Result<Box<dyn Session>, HostError>;
}

/// A live connection to an app process.
pub trait Session: Send {
    /// Requests the named service and returns its interface.
    ///
    /// # Errors
    ///
    /// Fails when the app does not serve `service`.
    fn dispense(
        &mut self,
        service: &str,
        ctx: &CallContext,
    ) -> Result<Arc<dyn AppInterface>, HostError>;

    /// Descriptor another invocation would use to reach this process.
    fn descriptor(&self) -> ReattachDescriptor;

    /// Stops the process: a shutdown request, a kill after `grace`, then a
    /// reap. Sessions that did not start the process only disconnect.
    fn terminate(&mut self, grace: Duration);

    /// Disconnects without touching the process.
    fn close(&mut self);
}
