//! Configuration loading for the `trellis` binary.
//!
//! Leading configuration flags are routed to `ortho_config`; everything from
//! the first other token onwards is the command line proper.

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use trellis_config::Config;

use crate::CliError;

/// Flags recognised by the configuration loader. Kept in sync with the
/// fields of [`Config`] that are set from the command line.
const CONFIG_CLI_FLAGS: &[&str] = &["--config-path", "--apps-dir", "--log-filter", "--log-format"];

pub(crate) trait ConfigLoader {
    /// Loads configuration from the routed flags.
    ///
    /// Configuration flags must precede the command; later occurrences are
    /// left to the command line.
    fn load(&self, args: &[OsString]) -> Result<Config, CliError>;
}

pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, CliError> {
        Config::load_from_iter(args.iter().cloned()).map_err(CliError::LoadConfiguration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Stop,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    let (flag, inline) = text
        .split_once('=')
        .map_or((text.as_ref(), false), |(flag, _)| (flag, true));
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline,
        }
    } else {
        FlagAction::Stop
    }
}

/// Arguments split between the loader and the command line.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigArgumentSplit {
    /// Program name followed by the configuration flags.
    pub(crate) config_arguments: Vec<OsString>,
    /// Program name followed by the command line.
    pub(crate) command_arguments: Vec<OsString>,
}

pub(crate) fn split_config_arguments(args: &[OsString]) -> ConfigArgumentSplit {
    let Some((program, rest)) = args.split_first() else {
        return ConfigArgumentSplit::default();
    };

    let mut config_arguments = vec![program.clone()];
    let mut pending_value = false;
    let mut consumed = 0;
    for argument in rest {
        if pending_value {
            config_arguments.push(argument.clone());
            pending_value = false;
        } else {
            match classify(argument) {
                FlagAction::Include { needs_value } => {
                    config_arguments.push(argument.clone());
                    pending_value = needs_value;
                }
                FlagAction::Stop => break,
            }
        }
        consumed += 1;
    }

    let command_arguments = std::iter::once(program.clone())
        .chain(rest.iter().skip(consumed).cloned())
        .collect();
    ConfigArgumentSplit {
        config_arguments,
        command_arguments,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[rstest]
    #[case::inline_value("--log-filter=debug", FlagAction::Include { needs_value: false })]
    #[case::separate_value("--apps-dir", FlagAction::Include { needs_value: true })]
    #[case::command("app", FlagAction::Stop)]
    #[case::unknown_flag("--global", FlagAction::Stop)]
    fn flags_are_classified(#[case] argument: &str, #[case] expected: FlagAction) {
        assert_eq!(classify(OsStr::new(argument)), expected);
    }

    #[test]
    fn leading_flags_go_to_the_loader() {
        let split = split_config_arguments(&os(&[
            "trellis",
            "--apps-dir",
            "/srv/apps",
            "--log-format=json",
            "app",
            "list",
            "--log-filter",
            "debug",
        ]));

        assert_eq!(
            split.config_arguments,
            os(&["trellis", "--apps-dir", "/srv/apps", "--log-format=json"])
        );
        assert_eq!(
            split.command_arguments,
            os(&["trellis", "app", "list", "--log-filter", "debug"])
        );
    }

    #[test]
    fn empty_arguments_split_to_nothing() {
        assert_eq!(split_config_arguments(&[]), ConfigArgumentSplit::default());
    }
}
