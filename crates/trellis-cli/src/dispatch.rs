//! Bridges the command tree and `clap`.
//!
//! The tree changes with every installed app, so the parser is built at run
//! time from its nodes. Matches are mapped back to the node path, positional
//! arguments and declared flags of the selected node.

use std::ffi::OsString;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use trellis_apps::{CommandNode, CommandTree, ExecutedFlag, FlagKind, FlagSpec, Invocation};

/// Argument id collecting positional arguments. Contains a space so it can
/// never clash with a declared flag.
const POSITIONAL: &str = "positional args";

/// Builds the parser for the whole tree.
pub(crate) fn build_command(tree: &CommandTree) -> Command {
    node_command(tree.root()).version(env!("CARGO_PKG_VERSION"))
}

fn node_command(node: &CommandNode) -> Command {
    let mut command = Command::new(node.name().to_owned())
        .visible_aliases(node.aliases().iter().cloned());
    if !node.short().is_empty() {
        command = command.about(node.short().to_owned());
    }
    if !node.long().is_empty() {
        command = command.long_about(node.long().to_owned());
    }
    command = node
        .flags()
        .iter()
        .fold(command, |command, flag| command.arg(flag_arg(flag)));

    if node.is_runnable() {
        command = command.arg(
            Arg::new(POSITIONAL)
                .value_name(positional_name(node.usage()))
                .action(ArgAction::Append)
                .num_args(0..),
        );
    } else {
        command = command
            .subcommand_required(true)
            .arg_required_else_help(true);
    }
    node.children()
        .iter()
        .fold(command, |command, child| command.subcommand(node_command(child)))
}

fn positional_name(usage: &str) -> String {
    usage
        .split_once(' ')
        .map_or_else(|| "ARGS".to_owned(), |(_, rest)| rest.trim().to_owned())
}

fn flag_arg(flag: &FlagSpec) -> Arg {
    let mut arg = Arg::new(flag.name.clone()).long(flag.name.clone());
    if let Some(short) = flag.shorthand {
        arg = arg.short(short);
    }
    if !flag.usage.is_empty() {
        arg = arg.help(flag.usage.clone());
    }
    arg = match flag.kind {
        FlagKind::Bool => arg.action(ArgAction::SetTrue),
        FlagKind::Int => arg.value_parser(value_parser!(i64)),
        FlagKind::Uint => arg.value_parser(value_parser!(u64)),
        FlagKind::String => arg,
        FlagKind::StringSlice => arg.action(ArgAction::Append).value_delimiter(','),
    };
    if flag.kind != FlagKind::Bool && !flag.default_value.is_empty() {
        arg = arg.default_value(flag.default_value.clone());
    }
    arg
}

/// Maps parser matches onto an invocation of the selected node.
pub(crate) fn invocation(
    tree: &CommandTree,
    matches: &ArgMatches,
    os_args: &[OsString],
) -> Invocation {
    let mut node = tree.root();
    let mut path = node.name().to_owned();
    let mut selected = matches;
    while let Some((name, sub)) = selected.subcommand() {
        let Some(child) = node.child(name) else {
            break;
        };
        node = child;
        path.push(' ');
        path.push_str(name);
        selected = sub;
    }

    let args = selected
        .try_get_many::<String>(POSITIONAL)
        .ok()
        .flatten()
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let flags = node
        .flags()
        .iter()
        .map(|flag| ExecutedFlag {
            name: flag.name.clone(),
            value: flag_value(selected, flag),
            kind: flag.kind,
        })
        .collect();

    Invocation {
        path,
        usage: node.usage().to_owned(),
        args,
        os_args: os_args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
        flags,
        ..Invocation::default()
    }
}

/// Text form of a flag as the user gave it, comma-joined for slices.
fn flag_value(matches: &ArgMatches, flag: &FlagSpec) -> String {
    matches
        .get_raw(&flag.name)
        .map(|values| {
            values
                .map(|value| value.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_else(|| flag.default_value.clone())
}
