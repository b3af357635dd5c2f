//! Splices app commands and hooks into the host's command tree.
//!
//! Apps declare where their commands belong with an attachment path: the
//! space-joined names from the root, root name optional. Commands may only
//! be placed under dispatch-only nodes, and hooks only on runnable ones.
//! Linking works on staged copies of the tree, so a failing app never
//! leaves part of its commands behind.

mod action;
mod binding;
mod tree;


use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

pub use self::action::{Action, CommandBody, CommandHook, Invocation};
pub use self::binding::AppBinding;
use self::binding::{AppCommand, AppHook};
pub use self::tree::{CommandNode, CommandTree, normalize_path};
use crate::client::ClientApi;
use crate::error::{AppError, LinkError, LinkFailures};
use crate::protocol::{CommandSpec, HookSpec};
use crate::registry::LoadedApps;

const GRAFT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::graft");

/// Adds an app's commands to the tree, each under its attachment path.
///
/// Commands with children become dispatch-only nodes and their children are
/// linked beneath them; leaves become runnable nodes calling the app.
///
/// # Errors
///
/// Fails on the first command whose attachment path is unknown, names a
/// runnable command, or already holds a sibling with the same name, and on
/// flags that are malformed, reserved, or declared twice on one command. Nodes
/// added before the failure stay in the tree.
pub fn link_commands(
    tree: &mut CommandTree,
    binding: &AppBinding,
    commands: &[CommandSpec],
) -> Result<(), LinkError> {
    for spec in commands {
        let path = tree.normalize_path(&spec.place_command_under);
        link_command(tree, binding, spec, &path)?;
    }
    Ok(())
}

fn link_command(
    tree: &mut CommandTree,
    binding: &AppBinding,
    spec: &CommandSpec,
    path: &str,
) -> Result<(), LinkError> {
    let parent = tree
        .find_mut(path)
        .ok_or_else(|| LinkError::CommandPathNotFound {
            path: path.to_owned(),
            app: binding.reference().to_owned(),
        })?;
    if parent.is_runnable() {
        return Err(LinkError::RunnableParent {
            command: spec.usage.clone(),
            path: path.to_owned(),
        });
    }
    if parent.child(spec.name()).is_some() {
        return Err(LinkError::CommandExists {
            name: spec.name().to_owned(),
            parent: path.to_owned(),
        });
    }
    check_flags(spec, path)?;

    let base = if spec.is_runnable() {
        CommandNode::runnable(spec.usage.clone(), Arc::new(AppCommand::new(binding.clone())))
    } else {
        CommandNode::group(spec.usage.clone())
    };
    let node = spec.flags.iter().cloned().fold(
        base.with_short(spec.short.clone())
            .with_long(spec.long.clone())
            .with_aliases(spec.aliases.iter().cloned()),
        CommandNode::with_flag,
    );
    parent.add_child(node);
    debug!(
        target: GRAFT_TARGET,
        app = binding.reference(),
        command = spec.name(),
        under = path,
        "command linked"
    );

    let own_path = format!("{path} {}", spec.name());
    for child in &spec.commands {
        link_command(tree, binding, child, &own_path)?;
    }
    Ok(())
}

/// Flag names and shorthands the parser already reserves on every command.
const RESERVED_FLAGS: [&str; 2] = ["help", "version"];
const RESERVED_SHORTHANDS: [char; 2] = ['h', 'V'];

fn check_flags(spec: &CommandSpec, path: &str) -> Result<(), LinkError> {
    let conflict = |flag: &str, reason: &str| LinkError::FlagConflict {
        command: format!("{path} {}", spec.name()),
        flag: flag.to_owned(),
        reason: reason.to_owned(),
    };
    let mut names = HashSet::new();
    let mut shorthands = HashSet::new();
    for flag in &spec.flags {
        let name = flag.name.as_str();
        if name.is_empty() || name.starts_with('-') || name.contains(char::is_whitespace) {
            return Err(conflict(name, "not a valid flag name"));
        }
        if RESERVED_FLAGS.contains(&name) {
            return Err(conflict(name, "name is reserved"));
        }
        if !names.insert(name) {
            return Err(conflict(name, "name is declared twice"));
        }
        let Some(shorthand) = flag.shorthand else {
            continue;
        };
        if !shorthand.is_ascii_alphanumeric() {
            return Err(conflict(name, "shorthand must be a letter or digit"));
        }
        if RESERVED_SHORTHANDS.contains(&shorthand) {
            return Err(conflict(name, "shorthand is reserved"));
        }
        if !shorthands.insert(shorthand) {
            return Err(conflict(name, "shorthand is declared twice"));
        }
    }
    Ok(())
}

/// Appends an app's hooks to the runnable commands they name.
///
/// # Errors
///
/// Fails on the first hook whose attachment path is unknown or names a
/// dispatch-only command.
pub fn link_hooks(
    tree: &mut CommandTree,
    binding: &AppBinding,
    hooks: &[HookSpec],
) -> Result<(), LinkError> {
    for spec in hooks {
        let path = tree.normalize_path(&spec.place_hook_on);
        let node = tree
            .find_mut(&path)
            .ok_or_else(|| LinkError::HookPathNotFound {
                path: path.clone(),
                hook: spec.name.clone(),
            })?;
        let action = node
            .action_mut()
            .ok_or_else(|| LinkError::HookOnDispatchOnly {
                hook: spec.name.clone(),
                path: spec.place_hook_on.clone(),
            })?;
        action.add_hook(Arc::new(AppHook::new(binding.clone(), spec.clone())));
        debug!(
            target: GRAFT_TARGET,
            app = binding.reference(),
            hook = %spec.name,
            on = %path,
            "hook linked"
        );
    }
    Ok(())
}

/// Links every loaded app into the tree, hooks first, in load order.
///
/// Each app is linked against a staged copy of what the previous apps
/// produced. Apps that failed to load are skipped. A link failure is
/// recorded on the app; once every app has been attempted, any failure
/// leaves `tree` untouched and unloads every app.
///
/// # Errors
///
/// Returns every link failure, in load order.
pub fn link_apps(
    tree: &mut CommandTree,
    apps: &mut LoadedApps,
    api: &Arc<dyn ClientApi>,
) -> Result<(), LinkFailures> {
    let mut working = tree.clone();
    let mut failures = Vec::new();

    for app in apps.iter_mut() {
        let (Some(interface), Some(manifest)) = (app.interface(), app.manifest().cloned()) else {
            debug!(target: GRAFT_TARGET, reference = app.reference(), "skipping unloaded app");
            continue;
        };
        let binding = AppBinding::new(
            app.reference(),
            interface,
            app.entry().with.clone(),
            Arc::clone(api),
        );
        let mut staged = working.clone();
        let linked = link_hooks(&mut staged, &binding, &manifest.hooks)
            .and_then(|()| link_commands(&mut staged, &binding, &manifest.commands));
        match linked {
            Ok(()) => working = staged,
            Err(error) => {
                warn!(
                    target: GRAFT_TARGET,
                    reference = app.reference(),
                    error = %error,
                    "app failed to link"
                );
                failures.push((app.reference().to_owned(), AppError::Link(error.clone())));
                app.fail(AppError::Link(error));
            }
        }
    }

    if failures.is_empty() {
        *tree = working;
        Ok(())
    } else {
        apps.unload_all();
        Err(LinkFailures { failures })
    }
}
