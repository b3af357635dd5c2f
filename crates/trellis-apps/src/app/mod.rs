//! The lifecycle of one configured app.
//!
//! An [`App`] moves through `Resolved -> Fetched -> Built -> Connected`, or
//! stops in `Failed` with the first error it met. [`App::load`] is the only
//! driver: it applies one transition per state until the app is connected or
//! failed, so no stage has to re-check whether an earlier one went wrong.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};
use trellis_config::{AppEntry, Config};

use crate::cache::ReattachStore;
use crate::context::CallContext;
use crate::error::{AppError, LinkError, ResolveError};
use crate::host::{
    AppInterface, Connector, DEFAULT_TERMINATE_GRACE, LaunchOptions, LaunchRequest,
    OutputSinks, ProcessConnector, Session,
};
use crate::pipeline::{self, CargoToolchain, GitFetcher, SourceFetcher, Toolchain};
use crate::protocol::Manifest;
use crate::reference::{self, ResolvedApp};
use crate::shared::{Attachment, Ownership, SharedHostCoordinator};

const APP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::app");

/// Everything apps of one invocation share: where sources live, how they are
/// fetched, built and started, and where their output goes.
pub struct AppEnvironment {
    apps_dir: Utf8PathBuf,
    coordinator: SharedHostCoordinator,
    fetcher: Arc<dyn SourceFetcher>,
    toolchain: Arc<dyn Toolchain>,
    connector: Arc<dyn Connector>,
    sinks: OutputSinks,
    terminate_grace: Duration,
}

impl AppEnvironment {
    /// Uses `git`, `cargo` and real processes, forwarding app output to this
    /// process's own streams.
    #[must_use]
    pub fn new(apps_dir: impl Into<Utf8PathBuf>, store: ReattachStore) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            coordinator: SharedHostCoordinator::new(store),
            fetcher: Arc::new(GitFetcher::new()),
            toolchain: Arc::new(CargoToolchain::new()),
            connector: Arc::new(ProcessConnector::default()),
            sinks: OutputSinks::inherit(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    /// Environment described by the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let store = ReattachStore::new(config.reattach_cache_path(), env!("CARGO_PKG_VERSION"));
        let options = LaunchOptions {
            debug: config.debug(),
            ..LaunchOptions::default()
        };
        Self::new(config.apps_dir(), store).with_connector(Arc::new(ProcessConnector::new(options)))
    }

    /// Replaces the source fetcher.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replaces the toolchain.
    #[must_use]
    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    /// Replaces the process connector.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the output destinations of launched apps.
    #[must_use]
    pub fn with_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Replaces the wait between a shutdown request and a kill.
    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Root under which remote apps are cloned.
    #[must_use]
    pub fn apps_dir(&self) -> &Utf8Path {
        &self.apps_dir
    }

    /// Shared-host coordination for these apps.
    #[must_use]
    pub const fn coordinator(&self) -> &SharedHostCoordinator {
        &self.coordinator
    }
}

impl fmt::Debug for AppEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppEnvironment")
            .field("apps_dir", &self.apps_dir)
            .field("coordinator", &self.coordinator)
            .field("terminate_grace", &self.terminate_grace)
            .finish_non_exhaustive()
    }
}

/// A live session with an app process.
struct Connection {
    session: Box<dyn Session>,
    interface: Arc<dyn AppInterface>,
    manifest: Manifest,
    role: Ownership,
}

enum AppState {
    Resolved,
    Fetched,
    Built,
    Connected(Box<Connection>),
    Failed(AppError),
}

impl AppState {
    const fn label(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Fetched => "fetched",
            Self::Built => "built",
            Self::Connected(_) => "connected",
            Self::Failed(_) => "failed",
        }
    }
}

/// One configured app and the process serving it.
pub struct App {
    entry: AppEntry,
    target: Result<ResolvedApp, ResolveError>,
    env: Arc<AppEnvironment>,
    state: AppState,
}

impl App {
    /// Resolves `entry` against the environment's apps directory. Resolution
    /// failures are recorded on the app rather than returned.
    #[must_use]
    pub fn resolve(entry: AppEntry, env: Arc<AppEnvironment>) -> Self {
        let target = reference::resolve(env.apps_dir(), &entry.path);
        let state = match &target {
            Ok(_) => AppState::Resolved,
            Err(error) => {
                debug!(target: APP_TARGET, reference = %entry.path, error = %error, "unresolvable app");
                AppState::Failed(AppError::Resolve(error.clone()))
            }
        };
        Self {
            entry,
            target,
            env,
            state,
        }
    }

    /// Configuration entry the app was created from.
    #[must_use]
    pub const fn entry(&self) -> &AppEntry {
        &self.entry
    }

    /// The reference exactly as configured.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.entry.path
    }

    /// Resolved locations, unless resolution failed.
    #[must_use]
    pub fn resolved(&self) -> Option<&ResolvedApp> {
        self.target.as_ref().ok()
    }

    /// The recorded error, once the app has failed.
    #[must_use]
    pub const fn error(&self) -> Option<&AppError> {
        match &self.state {
            AppState::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Whether the app is connected and its manifest is known.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self.state, AppState::Connected(_))
    }

    /// Manifest fetched when the app connected.
    #[must_use]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.connection().map(|connection| &connection.manifest)
    }

    /// Interface to call the app through.
    #[must_use]
    pub fn interface(&self) -> Option<Arc<dyn AppInterface>> {
        self.connection()
            .map(|connection| Arc::clone(&connection.interface))
    }

    /// Responsibility this instance holds for the app process.
    #[must_use]
    pub fn ownership(&self) -> Option<Ownership> {
        self.connection().map(|connection| connection.role)
    }

    /// Whether this instance owns the shared process serving the app.
    /// Private processes and guests are not hosts.
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.ownership().is_some_and(Ownership::is_host)
    }

    /// Whether the app declared a shared host.
    #[must_use]
    pub fn is_shared_host(&self) -> bool {
        self.manifest().is_some_and(|manifest| manifest.shared_host)
    }

    fn connection(&self) -> Option<&Connection> {
        match &self.state {
            AppState::Connected(connection) => Some(connection),
            _ => None,
        }
    }

    /// Drives the app until it is connected or failed.
    ///
    /// # Errors
    ///
    /// Returns the recorded error; loading a failed app again returns the
    /// same error without doing any work.
    pub fn load(&mut self, ctx: &CallContext) -> Result<(), AppError> {
        loop {
            let target = match &self.target {
                Ok(target) => target,
                Err(error) => return Err(AppError::Resolve(error.clone())),
            };
            let step = match &self.state {
                AppState::Failed(error) => return Err(error.clone()),
                AppState::Connected(_) => return Ok(()),
                AppState::Resolved => self.fetch_sources(target, ctx).map(|()| AppState::Fetched),
                AppState::Fetched => self.build_artifact(target, ctx).map(|()| AppState::Built),
                AppState::Built => self
                    .connect(target, ctx)
                    .map(|connection| AppState::Connected(Box::new(connection))),
            };
            let next = step.unwrap_or_else(AppState::Failed);
            debug!(
                target: APP_TARGET,
                reference = %self.entry.path,
                from = self.state.label(),
                to = next.label(),
                "app transition"
            );
            if let AppState::Failed(error) = &next {
                warn!(target: APP_TARGET, reference = %self.entry.path, error = %error, "app failed to load");
            }
            self.state = next;
        }
    }

    fn fetch_sources(&self, target: &ResolvedApp, ctx: &CallContext) -> Result<(), AppError> {
        if target.src_path().exists() {
            return Ok(());
        }
        pipeline::fetch(self.env.fetcher.as_ref(), target, ctx)?;
        Ok(())
    }

    fn build_artifact(&self, target: &ResolvedApp, ctx: &CallContext) -> Result<(), AppError> {
        if pipeline::needs_build(target)? {
            pipeline::build(self.env.toolchain.as_ref(), target, ctx)?;
        }
        Ok(())
    }

    fn connect(&self, target: &ResolvedApp, ctx: &CallContext) -> Result<Connection, AppError> {
        let coordinator = self.env.coordinator();
        let reference = self.reference();
        let planned = coordinator.plan(reference).map_err(AppError::Plan)?;
        let (attachment, mut session) = match planned {
            Attachment::Reattach(descriptor) => {
                match self.env.connector.reattach(&descriptor, ctx) {
                    Ok(session) => (Attachment::Reattach(descriptor), session),
                    Err(failure) => {
                        coordinator
                            .clear_stale(reference, &descriptor, &failure)
                            .map_err(AppError::Connect)?;
                        (Attachment::Launch, self.launch(target, ctx)?)
                    }
                }
            }
            Attachment::Launch => (Attachment::Launch, self.launch(target, ctx)?),
        };

        match self.handshake(target, &attachment, session.as_mut(), ctx) {
            Ok((interface, manifest, role)) => {
                info!(
                    target: APP_TARGET,
                    reference,
                    pid = session.descriptor().pid,
                    role = ?role,
                    "app connected"
                );
                Ok(Connection {
                    session,
                    interface,
                    manifest,
                    role,
                })
            }
            Err(error) => {
                session.terminate(self.env.terminate_grace);
                Err(error)
            }
        }
    }

    fn launch(&self, target: &ResolvedApp, ctx: &CallContext) -> Result<Box<dyn Session>, AppError> {
        let artifact = target.artifact_path();
        let request = LaunchRequest {
            artifact: &artifact,
            name: target.name(),
            sinks: self.env.sinks.clone(),
        };
        self.env
            .connector
            .launch(&request, ctx)
            .map_err(AppError::Connect)
    }

    /// Dispenses the app's service, fetches its manifest and settles
    /// ownership of the process.
    fn handshake(
        &self,
        target: &ResolvedApp,
        attachment: &Attachment,
        session: &mut dyn Session,
        ctx: &CallContext,
    ) -> Result<(Arc<dyn AppInterface>, Manifest, Ownership), AppError> {
        let interface = session
            .dispense(target.name(), ctx)
            .map_err(AppError::Dispense)?;
        let manifest = interface.manifest(ctx).map_err(AppError::Manifest)?;
        let role = self
            .env
            .coordinator()
            .settle(
                self.reference(),
                attachment,
                manifest.shared_host,
                &session.descriptor(),
            )
            .map_err(AppError::Publish)?;
        Ok((interface, manifest, role))
    }

    /// Stops using the app process.
    ///
    /// Guests of a shared host only disconnect. Otherwise the process is
    /// asked to shut down, killed after the grace period, and reaped; an
    /// owner also withdraws its published descriptor. Safe to call on apps
    /// that never loaded and idempotent.
    pub fn kill_client(&mut self) {
        match std::mem::replace(&mut self.state, AppState::Built) {
            AppState::Connected(mut connection) => self.release(&mut connection),
            other => self.state = other,
        }
    }

    fn release(&self, connection: &mut Connection) {
        let pid = connection.session.descriptor().pid;
        if !connection.role.stops_process() {
            debug!(target: APP_TARGET, reference = %self.entry.path, pid, "leaving shared host");
            connection.session.close();
            return;
        }
        debug!(target: APP_TARGET, reference = %self.entry.path, pid, "stopping app process");
        connection.session.terminate(self.env.terminate_grace);
        if let Err(error) = self
            .env
            .coordinator()
            .release(self.reference(), connection.role, pid)
        {
            warn!(
                target: APP_TARGET,
                reference = %self.entry.path,
                error = %error,
                "failed to withdraw shared host descriptor"
            );
        }
    }

    /// Records `error` as the app's terminal error, stopping the process
    /// first when connected.
    pub fn fail(&mut self, error: AppError) {
        self.kill_client();
        self.state = AppState::Failed(error);
    }

    /// Removes the clone directory of a remote app so the next load fetches
    /// it again. Failed and local apps are left alone.
    ///
    /// # Errors
    ///
    /// Returns the removal failure without recording it.
    pub fn clean(&mut self) -> Result<(), AppError> {
        if matches!(self.state, AppState::Failed(_)) {
            return Ok(());
        }
        let Ok(target) = &self.target else {
            return Ok(());
        };
        pipeline::clean(target)?;
        if !target.is_local() {
            self.kill_client();
            self.state = AppState::Resolved;
        }
        Ok(())
    }

    /// Clones the sources of a remote app that has none. Failed apps are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns and records the clone failure.
    pub fn fetch(&mut self, ctx: &CallContext) -> Result<(), AppError> {
        if !matches!(self.state, AppState::Resolved) {
            return Ok(());
        }
        let Ok(target) = &self.target else {
            return Ok(());
        };
        match self.fetch_sources(target, ctx) {
            Ok(()) => {
                self.state = AppState::Fetched;
                Ok(())
            }
            Err(error) => {
                self.state = AppState::Failed(error.clone());
                Err(error)
            }
        }
    }

    /// Cleans then fetches the app again.
    ///
    /// # Errors
    ///
    /// Returns the first failure of [`App::clean`] or [`App::fetch`].
    pub fn update(&mut self, ctx: &CallContext) -> Result<(), AppError> {
        self.clean()?;
        self.fetch(ctx)
    }

    /// Asks the connected app for its manifest again.
    ///
    /// # Errors
    ///
    /// Fails when the app is not loaded or the call fails.
    pub fn current_manifest(&self, ctx: &CallContext) -> Result<Manifest, AppError> {
        match &self.state {
            AppState::Connected(connection) => connection
                .interface
                .manifest(ctx)
                .map_err(AppError::Manifest),
            AppState::Failed(error) => Err(error.clone()),
            _ => Err(AppError::Link(LinkError::NotLoaded {
                app: self.entry.path.clone(),
            })),
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("reference", &self.entry.path)
            .field("state", &self.state.label())
            .finish_non_exhaustive()
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.kill_client();
    }
}
