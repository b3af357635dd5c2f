//! `trellis app`: inspecting and maintaining installed apps.

use std::fmt::Display;
use std::sync::Arc;

use trellis_apps::graft::normalize_path;
use trellis_apps::{
    App, CallContext, CommandError, CommandNode, FlagKind, FlagSpec, Invocation, LoadedApps,
};
use trellis_config::{APPS_FILE_NAME, AppEntry, AppsFile};

use super::{Builtins, ROOT_COMMAND};

type Run = fn(&Builtins, &Invocation) -> Result<(), CommandError>;

pub(super) fn app_group(builtins: &Arc<Builtins>) -> CommandNode {
    let global = FlagSpec::new("global", FlagKind::Bool)
        .with_shorthand('g')
        .with_usage(format!(
            "use global apps configuration ({}/{APPS_FILE_NAME})",
            builtins.global_dir
        ));

    CommandNode::group("app [command]")
        .with_short("Create and manage trellis apps")
        .with_child(runnable("list", builtins, Builtins::list).with_short("List installed apps"))
        .with_child(
            runnable("describe [path]", builtins, Builtins::describe)
                .with_short("Print information about installed apps"),
        )
        .with_child(
            runnable("update [path]", builtins, Builtins::update)
                .with_short("Update app")
                .with_long("Updates the app at path, or every declared app when no path is given."),
        )
        .with_child(
            runnable("install [path] [key=value]...", builtins, Builtins::install)
                .with_short("Install app")
                .with_long(
                    "Installs an app. Key value pairs after the path are stored with the \
                     app and passed to it on every call.",
                )
                .with_flag(global.clone()),
        )
        .with_child(
            runnable("uninstall [path]", builtins, Builtins::uninstall)
                .with_short("Uninstall app")
                .with_aliases(["rm"])
                .with_flag(global),
        )
}

fn runnable(usage: &str, builtins: &Arc<Builtins>, run: Run) -> CommandNode {
    let shared = Arc::clone(builtins);
    CommandNode::runnable(
        usage,
        Arc::new(move |invocation: &Invocation| run(&shared, invocation)),
    )
}

fn failed(error: impl Display) -> CommandError {
    CommandError::failed(error.to_string())
}

fn output_failed(error: impl Display) -> CommandError {
    CommandError::failed(format!("failed to write output: {error}"))
}

fn exact_args(expected: usize, args: &[String]) -> CommandError {
    failed(format!("accepts {expected} arg(s), received {}", args.len()))
}

impl Builtins {
    fn list(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let table = app_table(&self.apps(), &invocation.ctx);
        write!(self.console, "{table}").map_err(output_failed)
    }

    fn describe(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let [reference] = invocation.args.as_slice() else {
            return Err(exact_args(1, &invocation.args));
        };
        let manifest = {
            let apps = self.apps();
            let app = apps
                .find(reference)
                .ok_or_else(|| failed(format!("App {reference:?} not found")))?;
            app.current_manifest(&invocation.ctx)
                .map_err(|error| failed(format!("error while loading app manifest: {error}")))?
        };

        let mut text = String::new();
        if !manifest.commands.is_empty() {
            text.push_str("Commands:\n");
            for (index, command) in manifest.commands.iter().enumerate() {
                let path = normalize_path(ROOT_COMMAND, &command.place_command_under);
                text.push_str(&format!("  {}) {path} {}\n", index + 1, command.usage));
            }
        }
        if !manifest.hooks.is_empty() {
            text.push_str("Hooks:\n");
            for (index, hook) in manifest.hooks.iter().enumerate() {
                let path = normalize_path(ROOT_COMMAND, &hook.place_hook_on);
                text.push_str(&format!(
                    "  {}) '{}' on command '{path}'\n",
                    index + 1,
                    hook.name
                ));
            }
        }
        write!(self.console, "{text}").map_err(output_failed)
    }

    fn update(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let message = {
            let mut apps = self.apps();
            match invocation.args.as_slice() {
                [] => {
                    for app in apps.iter_mut() {
                        app.update(&invocation.ctx).map_err(failed)?;
                    }
                    "All apps updated.".to_owned()
                }
                [reference] => {
                    let app = apps
                        .find_mut(reference)
                        .ok_or_else(|| failed(format!("App {reference:?} not found")))?;
                    app.update(&invocation.ctx).map_err(failed)?;
                    format!("App {reference:?} updated.")
                }
                args => {
                    return Err(failed(format!(
                        "accepts at most 1 arg(s), received {}",
                        args.len()
                    )));
                }
            }
        };
        writeln!(self.console, "{message}").map_err(output_failed)
    }

    fn install(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let Some((reference, pairs)) = invocation.args.split_first() else {
            return Err(failed("requires at least 1 arg(s), only received 0"));
        };
        let global = invocation.flag_enabled("global");
        let mut file = AppsFile::load(self.apps_dir(global), global).map_err(failed)?;
        if file.contains(reference) {
            return Err(failed(format!("app {reference} is already installed")));
        }
        let entry = pairs
            .iter()
            .try_fold(AppEntry::new(reference.clone()), |entry, pair| {
                parse_pair(pair).map(|(key, value)| entry.with_param(key, value))
            })?;

        let env = Arc::clone(self.apps().env());
        let mut app = App::resolve(entry.clone(), env);
        let loaded = app.load(&invocation.ctx);
        app.kill_client();
        loaded.map_err(|error| failed(format!("error while loading app {reference:?}: {error}")))?;
        writeln!(self.console, "Done loading apps").map_err(output_failed)?;

        file.add(entry).map_err(failed)?;
        file.save().map_err(failed)?;
        writeln!(self.console, "Installed {reference}").map_err(output_failed)
    }

    fn uninstall(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let [reference] = invocation.args.as_slice() else {
            return Err(exact_args(1, &invocation.args));
        };
        let global = invocation.flag_enabled("global");
        let mut file = AppsFile::load(self.apps_dir(global), global).map_err(failed)?;
        file.remove(reference).map_err(failed)?;
        file.save().map_err(failed)?;
        writeln!(self.console, "{reference} uninstalled\n\t{} updated", file.path())
            .map_err(output_failed)
    }
}

fn parse_pair(pair: &str) -> Result<(&str, &str), CommandError> {
    let mut parts = pair.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) => Ok((key, value)),
        _ => Err(failed(format!("malformed key=value arg: {pair}"))),
    }
}

/// Renders the `Path`, `Config`, `Status` table of every app, probing the
/// manifest of loaded ones.
pub(crate) fn app_table(apps: &LoadedApps, ctx: &CallContext) -> String {
    let rows: Vec<[String; 3]> = apps
        .iter()
        .map(|app| {
            let location = if app.entry().global { "global" } else { "local" };
            [app.reference().to_owned(), location.to_owned(), status(app, ctx)]
        })
        .collect();
    render_table(["Path", "Config", "Status"], &rows)
}

fn status(app: &App, ctx: &CallContext) -> String {
    if let Some(error) = app.error() {
        return format!("Error: {error}");
    }
    match app.current_manifest(ctx) {
        Ok(_) => "Loaded".to_owned(),
        Err(error) => format!("Error: manifest() returned {error}"),
    }
}

pub(super) fn render_table(headers: [&str; 3], rows: &[[String; 3]]) -> String {
    let mut widths = headers.map(|header| header.chars().count());
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut text = String::new();
    let header_cells = headers.map(str::to_owned);
    for row in std::iter::once(&header_cells).chain(rows) {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        text.push_str(line.trim_end());
        text.push('\n');
    }
    text
}
