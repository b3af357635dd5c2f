//! Command-line runtime of the `trellis` host.
//!
//! A run loads configuration, installs telemetry, loads every app listed in
//! the local and global apps files and grafts their commands and hooks onto
//! the built-in tree. The command line is then parsed against the resulting
//! tree and the selected command executed. Every app process this run is
//! responsible for is stopped before returning.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use trellis_apps::{
    AppEnvironment, CallContext, ClientApi, CommandError, HostClientApi, LoadedApps, link_apps,
};
use trellis_config::{AppEntry, AppsFile, AppsFileError, Config, merge_unique};

mod commands;
mod config;
mod console;
mod dispatch;
pub mod telemetry;

use self::commands::{Builtins, app_table, builtin_tree};
use self::config::{ConfigLoader, OrthoConfigLoader, split_config_arguments};
pub use self::console::Console;
use self::telemetry::TelemetryError;

const CLI_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::run");

/// Failures that end a run.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to determine the working directory: {0}")]
    WorkingDirectory(String),
    #[error(transparent)]
    AppsFile(#[from] AppsFileError),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Runs the host with the given arguments, writing command output to
/// `stdout` and diagnostics to `stderr`.
#[must_use]
pub fn run<I, E>(args: I, stdout: Console, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
{
    run_with_loader(args, &stdout, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, E, L>(args: I, stdout: &Console, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    match execute(&args, stdout, stderr, loader) {
        Ok(code) => code,
        Err(error) => {
            let _ = writeln!(stderr, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn execute<E, L>(
    args: &[OsString],
    stdout: &Console,
    stderr: &mut E,
    loader: &L,
) -> Result<ExitCode, CliError>
where
    E: Write,
    L: ConfigLoader,
{
    let split = split_config_arguments(args);
    let config = loader.load(&split.config_arguments)?;
    telemetry::initialise(&config)?;

    let working_dir = working_dir()?;
    let entries = configured_apps(&config, &working_dir)?;
    let env = Arc::new(AppEnvironment::from_config(&config));
    let ctx = CallContext::background();
    let apps = Arc::new(Mutex::new(LoadedApps::load_all(env, entries, &ctx)));

    let builtins = Builtins {
        apps: Arc::clone(&apps),
        console: stdout.clone(),
        global_dir: config.apps_dir().to_path_buf(),
        local_dir: working_dir,
    };
    let outcome = run_command(&split.command_arguments, args, builtins, &apps, stdout, stderr);
    lock(&apps).unload_all();
    outcome
}

fn run_command<E: Write>(
    command_arguments: &[OsString],
    os_args: &[OsString],
    builtins: Builtins,
    apps: &Mutex<LoadedApps>,
    stdout: &Console,
    stderr: &mut E,
) -> Result<ExitCode, CliError> {
    let mut tree = builtin_tree(builtins);
    let api: Arc<dyn ClientApi> = Arc::new(HostClientApi::new());
    let linked = link_apps(&mut tree, &mut lock(apps), &api);
    if let Err(failures) = linked {
        let table = app_table(&lock(apps), &CallContext::background());
        let _ = write!(stderr, "{table}");
        let _ = writeln!(stderr, "{failures}");
        warn!(target: CLI_TARGET, "continuing with built-in commands only");
    }

    let matches = match dispatch::build_command(&tree).try_get_matches_from(command_arguments) {
        Ok(matches) => matches,
        Err(error) if !error.use_stderr() => {
            let _ = write!(stdout, "{}", error.render());
            return Ok(ExitCode::SUCCESS);
        }
        Err(error) => return Err(CliError::Usage(error.render().to_string().trim_end().to_owned())),
    };
    let invocation = dispatch::invocation(&tree, &matches, os_args);
    debug!(target: CLI_TARGET, path = %invocation.path, "executing command");
    tree.execute(&invocation)?;
    Ok(ExitCode::SUCCESS)
}

fn working_dir() -> Result<Utf8PathBuf, CliError> {
    let dir = std::env::current_dir().map_err(|error| CliError::WorkingDirectory(error.to_string()))?;
    Utf8PathBuf::from_path_buf(dir).map_err(|dir| {
        CliError::WorkingDirectory(format!("{} is not valid UTF-8", dir.display()))
    })
}

/// Local entries first, then global ones not already listed locally. An
/// unreadable global file is skipped so the local apps still load.
fn configured_apps(config: &Config, working_dir: &Utf8Path) -> Result<Vec<AppEntry>, CliError> {
    let local = AppsFile::load(working_dir, false)?;
    let global = AppsFile::load(config.apps_dir(), true).map_or_else(
        |error| {
            warn!(target: CLI_TARGET, error = %error, "ignoring global apps file");
            Vec::new()
        },
        |file| file.entries().to_vec(),
    );
    Ok(merge_unique(local.entries().to_vec(), global))
}

fn lock(apps: &Mutex<LoadedApps>) -> MutexGuard<'_, LoadedApps> {
    apps.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
