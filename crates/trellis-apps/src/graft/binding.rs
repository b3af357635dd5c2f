//! Tree actions that forward to an app process.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::action::{CommandBody, CommandHook, Invocation};
use crate::client::ClientApi;
use crate::error::{CommandError, HostError};
use crate::host::AppInterface;
use crate::protocol::{ExecutedHook, HookSpec};

/// What a grafted action needs to reach its app.
#[derive(Clone)]
pub struct AppBinding {
    reference: String,
    interface: Arc<dyn AppInterface>,
    with: BTreeMap<String, String>,
    api: Arc<dyn ClientApi>,
}

impl AppBinding {
    /// Binds the app known as `reference`.
    #[must_use]
    pub fn new(
        reference: impl Into<String>,
        interface: Arc<dyn AppInterface>,
        with: BTreeMap<String, String>,
        api: Arc<dyn ClientApi>,
    ) -> Self {
        Self {
            reference: reference.into(),
            interface,
            with,
            api,
        }
    }

    /// Configured app reference.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn wrap(&self, call: &'static str, outcome: Result<(), HostError>) -> Result<(), CommandError> {
        outcome.map_err(|source| CommandError::App {
            app: self.reference.clone(),
            call,
            source,
        })
    }
}

impl std::fmt::Debug for AppBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppBinding")
            .field("reference", &self.reference)
            .field("with", &self.with)
            .finish_non_exhaustive()
    }
}

/// Body of a command contributed by an app.
pub(crate) struct AppCommand {
    binding: AppBinding,
}

impl AppCommand {
    pub(crate) const fn new(binding: AppBinding) -> Self {
        Self { binding }
    }
}

impl CommandBody for AppCommand {
    fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let command = invocation.executed_command(&self.binding.with);
        let outcome = self.binding.interface.execute(
            &invocation.ctx,
            &command,
            self.binding.api.as_ref(),
        );
        self.binding.wrap("execute", outcome)
    }
}

/// Hook contributed by an app.
pub(crate) struct AppHook {
    binding: AppBinding,
    spec: HookSpec,
}

impl AppHook {
    pub(crate) const fn new(binding: AppBinding, spec: HookSpec) -> Self {
        Self { binding, spec }
    }

    fn executed(&self, invocation: &Invocation) -> ExecutedHook {
        ExecutedHook {
            hook: self.spec.clone(),
            command: invocation.executed_command(&self.binding.with),
        }
    }
}

impl CommandHook for AppHook {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn pre(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let hook = self.executed(invocation);
        let outcome = self.binding.interface.execute_hook_pre(
            &invocation.ctx,
            &hook,
            self.binding.api.as_ref(),
        );
        self.binding.wrap("hook_pre", outcome)
    }

    fn post(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let hook = self.executed(invocation);
        let outcome = self.binding.interface.execute_hook_post(
            &invocation.ctx,
            &hook,
            self.binding.api.as_ref(),
        );
        self.binding.wrap("hook_post", outcome)
    }

    fn cleanup(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let hook = self.executed(invocation);
        let outcome = self.binding.interface.execute_hook_cleanup(
            &invocation.ctx,
            &hook,
            self.binding.api.as_ref(),
        );
        self.binding.wrap("hook_cleanup", outcome)
    }
}
