//! The apps loaded by one invocation.
//!
//! [`LoadedApps`] is owned by whoever drives the invocation and passed to the
//! code that needs it; there is no process-wide list. Apps keep
//! configuration order, which is also the order their commands are grafted
//! in.

use std::sync::Arc;

use tracing::debug;
use trellis_config::AppEntry;

use crate::app::{App, AppEnvironment};
use crate::context::CallContext;
use crate::error::AppError;


const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");

/// Apps of one invocation, in configuration order.
#[derive(Debug)]
pub struct LoadedApps {
    env: Arc<AppEnvironment>,
    apps: Vec<App>,
}

impl LoadedApps {
    /// Creates an empty set sharing `env`.
    #[must_use]
    pub const fn new(env: Arc<AppEnvironment>) -> Self {
        Self {
            env,
            apps: Vec::new(),
        }
    }

    /// Resolves and loads every entry in order. Failures stay recorded on
    /// the individual apps.
    #[must_use]
    pub fn load_all(
        env: Arc<AppEnvironment>,
        entries: impl IntoIterator<Item = AppEntry>,
        ctx: &CallContext,
    ) -> Self {
        let mut loaded = Self::new(env);
        for entry in entries {
            if let Err(error) = loaded.load(entry, ctx) {
                debug!(target: REGISTRY_TARGET, error = %error, "app left unloaded");
            }
        }
        loaded
    }

    /// Resolves and loads one more app. The app is kept even when loading
    /// fails.
    ///
    /// # Errors
    ///
    /// Returns the error recorded on the app.
    pub fn load(&mut self, entry: AppEntry, ctx: &CallContext) -> Result<(), AppError> {
        let mut app = App::resolve(entry, Arc::clone(&self.env));
        let outcome = app.load(ctx);
        self.apps.push(app);
        outcome
    }

    /// Environment shared by the apps.
    #[must_use]
    pub const fn env(&self) -> &Arc<AppEnvironment> {
        &self.env
    }

    /// Apps in configuration order.
    pub fn iter(&self) -> std::slice::Iter<'_, App> {
        self.apps.iter()
    }

    /// Mutable apps in configuration order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, App> {
        self.apps.iter_mut()
    }

    /// Looks an app up by its configured reference.
    #[must_use]
    pub fn find(&self, reference: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.reference() == reference)
    }

    /// Mutable lookup by configured reference.
    pub fn find_mut(&mut self, reference: &str) -> Option<&mut App> {
        self.apps.iter_mut().find(|app| app.reference() == reference)
    }

    /// Removes an app, stopping its process.
    pub fn remove(&mut self, reference: &str) -> Option<App> {
        let index = self
            .apps
            .iter()
            .position(|app| app.reference() == reference)?;
        let mut app = self.apps.remove(index);
        app.kill_client();
        Some(app)
    }

    /// Number of apps, failed ones included.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.apps.len()
    }

    /// Returns `true` when no app is configured.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Stops every app process this invocation is responsible for.
    pub fn unload_all(&mut self) {
        for app in &mut self.apps {
            app.kill_client();
        }
    }
}

impl<'a> IntoIterator for &'a LoadedApps {
    type Item = &'a App;
    type IntoIter = std::slice::Iter<'a, App>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
