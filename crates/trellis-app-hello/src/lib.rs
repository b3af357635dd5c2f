//! Reference app served to the `trellis` host.
//!
//! Contributes a `hello` command, a dispatch-only `greetings` group and a
//! hook on `trellis app list`. It runs as a shared host, so concurrent
//! invocations on one machine talk to the same process.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use tracing::debug;
use trellis_apps::{
    AppService, ClientApi, CommandSpec, ExecutedCommand, ExecutedHook, FlagKind, FlagSpec,
    HookSpec, Manifest, ServiceError,
};

/// Name the app serves under.
pub const APP_NAME: &str = "hello";

const HELLO_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::service");

/// The `hello` app.
pub struct HelloApp {
    output: Mutex<Box<dyn Write + Send>>,
}

impl HelloApp {
    /// Writes to this process's stdout, which the host forwards.
    #[must_use]
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Writes to `output` instead of stdout.
    #[must_use]
    pub const fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }

    fn say(&self, text: &str) -> Result<(), ServiceError> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(output, "{text}")
            .and_then(|()| output.flush())
            .map_err(|error| ServiceError::new(format!("failed to write output: {error}")))
    }

    fn greet(&self, command: &ExecutedCommand) -> Result<(), ServiceError> {
        let name = command.args.first().map_or("world", String::as_str);
        let greeting = command
            .with
            .get("greeting")
            .map_or("Hello", String::as_str);
        let mut line = format!("{greeting}, {name}!");
        if command.flag_bool("shout") {
            line = line.to_uppercase();
        }
        let times = command.flag_int("times").unwrap_or(1).max(1);
        for _ in 0..times {
            self.say(&line)?;
        }
        Ok(())
    }

    fn chain(&self, api: &dyn ClientApi) -> Result<(), ServiceError> {
        let info = api.chain_info()?;
        self.say(&format!("chain {} at {}", info.chain_id, info.app_path))
    }
}

impl Default for HelloApp {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HelloApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloApp").finish_non_exhaustive()
    }
}

impl AppService for HelloApp {
    fn manifest(&self) -> Result<Manifest, ServiceError> {
        Ok(Manifest::new(APP_NAME)
            .with_shared_host(true)
            .with_command(
                CommandSpec::new("hello [name]")
                    .with_short("Print a greeting")
                    .with_flag(
                        FlagSpec::new("shout", FlagKind::Bool).with_usage("greet in upper case"),
                    )
                    .with_flag(
                        FlagSpec::new("times", FlagKind::Int)
                            .with_usage("number of greetings")
                            .with_default("1"),
                    ),
            )
            .with_command(
                CommandSpec::new("greetings")
                    .with_short("Greetings that need a chain")
                    .with_command(
                        CommandSpec::new("chain").with_short("Greet the chain the host runs on"),
                    ),
            )
            .with_hook(HookSpec::new("announce", "app list")))
    }

    fn execute(&self, command: &ExecutedCommand, api: &dyn ClientApi) -> Result<(), ServiceError> {
        debug!(target: HELLO_TARGET, path = %command.path, "executing");
        match command.path.rsplit(' ').next() {
            Some("hello") => self.greet(command),
            Some("chain") => self.chain(api),
            _ => Err(ServiceError::new(format!(
                "unknown command {:?}",
                command.path
            ))),
        }
    }

    fn execute_hook_pre(
        &self,
        hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), ServiceError> {
        self.say(&format!("[{}] before {}", hook.hook.name, hook.command.path))
    }

    fn execute_hook_post(
        &self,
        hook: &ExecutedHook,
        _api: &dyn ClientApi,
    ) -> Result<(), ServiceError> {
        self.say(&format!("[{}] after {}", hook.hook.name, hook.command.path))
    }
}
