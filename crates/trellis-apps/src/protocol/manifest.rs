//! What an app declares about itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Self-description returned by an app's `manifest` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// App name.
    pub name: String,
    /// Whether one process may serve every invocation on this machine.
    #[serde(default)]
    pub shared_host: bool,
    /// Commands to graft, in declaration order.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    /// Hooks to attach, in declaration order.
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Marks the app as a shared host.
    #[must_use]
    pub const fn with_shared_host(mut self, shared: bool) -> Self {
        self.shared_host = shared;
        self
    }

    /// Appends a command.
    #[must_use]
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Appends a hook.
    #[must_use]
    pub fn with_hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }
}

/// A command an app contributes to the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Usage line; its first token is the command name.
    pub usage: String,
    /// One-line help.
    #[serde(default)]
    pub short: String,
    /// Long help.
    #[serde(default)]
    pub long: String,
    /// Alternative names.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Flags accepted by the command.
    #[serde(default)]
    pub flags: Vec<FlagSpec>,
    /// Attachment path; empty means the root.
    #[serde(default)]
    pub place_command_under: String,
    /// Children. A command with children only dispatches.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

impl CommandSpec {
    /// Creates a command with the given usage line.
    #[must_use]
    pub fn new(usage: impl Into<String>) -> Self {
        Self {
            usage: usage.into(),
            ..Self::default()
        }
    }

    /// Command name: the first token of the usage line.
    #[must_use]
    pub fn name(&self) -> &str {
        self.usage.split_whitespace().next().unwrap_or_default()
    }

    /// Whether the command runs rather than dispatches.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sets the one-line help.
    #[must_use]
    pub fn with_short(mut self, short: impl Into<String>) -> Self {
        self.short = short.into();
        self
    }

    /// Sets the long help.
    #[must_use]
    pub fn with_long(mut self, long: impl Into<String>) -> Self {
        self.long = long.into();
        self
    }

    /// Adds an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Adds a flag.
    #[must_use]
    pub fn with_flag(mut self, flag: FlagSpec) -> Self {
        self.flags.push(flag);
        self
    }

    /// Sets the attachment path.
    #[must_use]
    pub fn placed_under(mut self, path: impl Into<String>) -> Self {
        self.place_command_under = path.into();
        self
    }

    /// Adds a child command.
    #[must_use]
    pub fn with_command(mut self, child: Self) -> Self {
        self.commands.push(child);
        self
    }
}

/// Value type of a flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    /// Free text.
    #[default]
    String,
    /// Switch without a value.
    Bool,
    /// Signed integer.
    Int,
    /// Unsigned integer.
    Uint,
    /// Repeatable text.
    StringSlice,
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::StringSlice => "strings",
        };
        f.write_str(label)
    }
}

/// A flag declared by an app command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSpec {
    /// Long name without dashes.
    pub name: String,
    /// Single-character short form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shorthand: Option<char>,
    /// Help text.
    #[serde(default)]
    pub usage: String,
    /// Default value in text form.
    #[serde(default)]
    pub default_value: String,
    /// Value type.
    #[serde(default)]
    pub kind: FlagKind,
}

impl FlagSpec {
    /// Creates a flag of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FlagKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    /// Sets the short form.
    #[must_use]
    pub const fn with_shorthand(mut self, shorthand: char) -> Self {
        self.shorthand = Some(shorthand);
        self
    }

    /// Sets the help text.
    #[must_use]
    pub fn with_usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = value.into();
        self
    }
}

/// A hook an app attaches to an existing runnable command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Hook name.
    pub name: String,
    /// Attachment path of the hooked command.
    pub place_hook_on: String,
}

impl HookSpec {
    /// Creates a hook on `place_hook_on`.
    #[must_use]
    pub fn new(name: impl Into<String>, place_hook_on: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            place_hook_on: place_hook_on.into(),
        }
    }
}
