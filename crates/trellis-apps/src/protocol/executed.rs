//! Payloads describing a command or hook the host is running.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::manifest::{FlagKind, HookSpec};

/// A flag as parsed from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedFlag {
    /// Long name.
    pub name: String,
    /// Value in text form; slices are comma-joined.
    pub value: String,
    /// Declared value type.
    pub kind: FlagKind,
}

/// A command invocation forwarded to an app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedCommand {
    /// Usage line of the command.
    pub usage: String,
    /// Full command path, root included.
    pub path: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// The host's full argument vector.
    #[serde(default)]
    pub os_args: Vec<String>,
    /// Install-time parameters of the app.
    #[serde(default)]
    pub with: BTreeMap<String, String>,
    /// Parsed flags.
    #[serde(default)]
    pub flags: Vec<ExecutedFlag>,
}

impl ExecutedCommand {
    /// Text value of the named flag.
    #[must_use]
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|flag| flag.name == name)
            .map(|flag| flag.value.as_str())
    }

    /// Whether the named flag is set to `true`.
    #[must_use]
    pub fn flag_bool(&self, name: &str) -> bool {
        self.flag_value(name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    /// Integer value of the named flag, when present and numeric.
    #[must_use]
    pub fn flag_int(&self, name: &str) -> Option<i64> {
        self.flag_value(name)?.parse().ok()
    }
}

/// A hook invocation: the hook and the command it decorates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedHook {
    /// The hook as declared.
    pub hook: HookSpec,
    /// The decorated command invocation.
    pub command: ExecutedCommand,
}

/// Description of the chain the host operates on, served to apps through
/// the client API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    /// Chain identifier.
    pub chain_id: String,
    /// Root directory of the chain project.
    pub app_path: String,
    /// Chain configuration file.
    pub config_path: String,
    /// Node home directory.
    pub home: String,
    /// RPC listen address.
    pub rpc_address: String,
}
