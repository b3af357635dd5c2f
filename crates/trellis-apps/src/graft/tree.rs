//! The host's command tree.

use std::sync::Arc;

use super::action::{Action, CommandBody, Invocation};
use crate::error::CommandError;
use crate::protocol::FlagSpec;

/// One command: a dispatch-only group when it has no action, runnable
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct CommandNode {
    usage: String,
    short: String,
    long: String,
    aliases: Vec<String>,
    flags: Vec<FlagSpec>,
    children: Vec<CommandNode>,
    action: Option<Action>,
}

impl CommandNode {
    /// Dispatch-only command.
    #[must_use]
    pub fn group(usage: impl Into<String>) -> Self {
        Self {
            usage: usage.into(),
            ..Self::default()
        }
    }

    /// Runnable command executing `body`.
    #[must_use]
    pub fn runnable(usage: impl Into<String>, body: Arc<dyn CommandBody>) -> Self {
        Self {
            usage: usage.into(),
            action: Some(Action::new(body)),
            ..Self::default()
        }
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

    /// Adds aliases.
    #[must_use]
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Adds a flag.
    #[must_use]
    pub fn with_flag(mut self, flag: FlagSpec) -> Self {
        self.flags.push(flag);
        self
    }

    /// Adds a child command.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Replaces the action, making the node runnable.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Command name: the first token of the usage line.
    #[must_use]
    pub fn name(&self) -> &str {
        self.usage.split_whitespace().next().unwrap_or_default()
    }

    /// Usage line.
    #[must_use]
    pub fn usage(&self) -> &str {
        &self.usage
    }

    /// One-line help.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.short
    }

    /// Long help.
    #[must_use]
    pub fn long(&self) -> &str {
        &self.long
    }

    /// Alternative names.
    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Declared flags.
    #[must_use]
    pub fn flags(&self) -> &[FlagSpec] {
        &self.flags
    }

    /// Children in insertion order.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Child by name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.name() == name)
    }

    /// Whether invoking the node runs something.
    #[must_use]
    pub const fn is_runnable(&self) -> bool {
        self.action.is_some()
    }

    /// The node's action, when runnable.
    #[must_use]
    pub const fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    pub(crate) const fn action_mut(&mut self) -> Option<&mut Action> {
        self.action.as_mut()
    }

    /// Names of the hooks attached to the node.
    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.action
            .as_ref()
            .map(Action::hook_names)
            .unwrap_or_default()
    }

    /// Appends a child.
    pub fn add_child(&mut self, child: Self) {
        self.children.push(child);
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.children.iter_mut().find(|child| child.name() == name)
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.usage);
        if self.is_runnable() {
            out.push('*');
        }
        let mut flags: Vec<&FlagSpec> = self.flags.iter().collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        for flag in flags {
            out.push_str(" --");
            out.push_str(&flag.name);
            out.push('=');
            out.push_str(&flag.kind.to_string());
        }
        out.push('\n');
        let mut children: Vec<&Self> = self.children.iter().collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        for child in children {
            child.dump_into(out, depth + 1);
        }
    }
}

/// The command tree of one invocation, rooted at the program name.
#[derive(Debug, Clone)]
pub struct CommandTree {
    root: CommandNode,
}

impl CommandTree {
    /// Creates a tree rooted at `root`.
    #[must_use]
    pub const fn new(root: CommandNode) -> Self {
        Self { root }
    }

    /// The root command.
    #[must_use]
    pub const fn root(&self) -> &CommandNode {
        &self.root
    }

    /// Name of the root command.
    #[must_use]
    pub fn root_name(&self) -> &str {
        self.root.name()
    }

    /// Attachment path in canonical form: root-prefixed, single-spaced.
    #[must_use]
    pub fn normalize_path(&self, path: &str) -> String {
        normalize_path(self.root_name(), path)
    }

    /// Node at the given path. The path is normalised first.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&CommandNode> {
        let normalized = self.normalize_path(path);
        let mut tokens = normalized.split(' ');
        tokens.next()?;
        tokens.try_fold(&self.root, |node, name| node.child(name))
    }

    /// Mutable node at the given path.
    pub fn find_mut(&mut self, path: &str) -> Option<&mut CommandNode> {
        let normalized = self.normalize_path(path);
        let mut tokens = normalized.split(' ');
        tokens.next()?;
        tokens.try_fold(&mut self.root, |node, name| node.child_mut(name))
    }

    /// Indented listing of the tree: one usage line per node, `*` on
    /// runnable nodes, then the node's flags as ` --name=type`. Children
    /// and flags are sorted by name.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.root.dump_into(&mut out, 0);
        out
    }

    /// Runs the node addressed by the invocation's path.
    ///
    /// # Errors
    ///
    /// Fails when the path is unknown or dispatch-only, or when the action
    /// fails.
    pub fn execute(&self, invocation: &Invocation) -> Result<(), CommandError> {
        let node = self
            .find(&invocation.path)
            .ok_or_else(|| CommandError::NotFound {
                path: invocation.path.clone(),
            })?;
        let action = node.action().ok_or_else(|| CommandError::NotRunnable {
            path: invocation.path.clone(),
        })?;
        action.run(invocation)
    }
}

/// Prefixes `path` with `root` unless it already starts with it, and
/// collapses whitespace. An empty path addresses the root.
#[must_use]
pub fn normalize_path(root: &str, path: &str) -> String {
    let tokens: Vec<&str> = path.split_whitespace().collect();
    if tokens.first().is_some_and(|first| *first == root) {
        tokens.join(" ")
    } else {
        std::iter::once(root)
            .chain(tokens)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
