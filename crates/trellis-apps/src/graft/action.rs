//! What runs when a runnable node is invoked, and in which order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use super::GRAFT_TARGET;
use crate::context::CallContext;
use crate::error::CommandError;
use crate::protocol::{ExecutedCommand, ExecutedFlag};

/// A parsed command line aimed at one node of the tree.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Full path of the node, root name included.
    pub path: String,
    /// Usage line of the node.
    pub usage: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// The process's full argument vector.
    pub os_args: Vec<String>,
    /// Flags declared on the node, with their parsed or default values.
    pub flags: Vec<ExecutedFlag>,
    /// Deadline and cancellation for every call made on behalf of the
    /// command.
    pub ctx: CallContext,
}

impl Invocation {
    /// Creates an invocation of `path` with no arguments or flags.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Sets the positional arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Value of the named flag, when declared on the node.
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|flag| flag.name == name)
            .map(|flag| flag.value.as_str())
    }

    /// Whether the named boolean flag is set.
    #[must_use]
    pub fn flag_enabled(&self, name: &str) -> bool {
        self.flag(name).is_some_and(|value| value == "true")
    }

    /// The invocation as an app sees it, carrying the app's install-time
    /// parameters.
    #[must_use]
    pub fn executed_command(&self, with: &BTreeMap<String, String>) -> ExecutedCommand {
        ExecutedCommand {
            usage: self.usage.clone(),
            path: self.path.clone(),
            args: self.args.clone(),
            os_args: self.os_args.clone(),
            with: with.clone(),
            flags: self.flags.clone(),
        }
    }
}

/// The body, or a native phase, of a runnable command.
pub trait CommandBody: Send + Sync {
    /// Runs the command.
    ///
    /// # Errors
    ///
    /// Returns the command's failure.
    fn run(&self, invocation: &Invocation) -> Result<(), CommandError>;
}

impl<F> CommandBody for F
where
    F: Fn(&Invocation) -> Result<(), CommandError> + Send + Sync,
{
    fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        self(invocation)
    }
}

/// A decorator around a runnable command.
pub trait CommandHook: Send + Sync {
    /// Hook name, used in logs and listings.
    fn name(&self) -> &str;

    /// Runs before the body.
    ///
    /// # Errors
    ///
    /// Aborts the command.
    fn pre(&self, invocation: &Invocation) -> Result<(), CommandError>;

    /// Runs after a successful body.
    ///
    /// # Errors
    ///
    /// Fails the command; later hooks skip their post phase.
    fn post(&self, invocation: &Invocation) -> Result<(), CommandError>;

    /// Runs on every exit path once `pre` succeeded.
    ///
    /// # Errors
    ///
    /// Logged, never propagated.
    fn cleanup(&self, invocation: &Invocation) -> Result<(), CommandError>;
}

/// Behaviour of a runnable node: optional native phases around a body, and
/// the hooks attached to it in registration order.
#[derive(Clone)]
pub struct Action {
    pre: Option<Arc<dyn CommandBody>>,
    body: Arc<dyn CommandBody>,
    post: Option<Arc<dyn CommandBody>>,
    hooks: Vec<Arc<dyn CommandHook>>,
}

impl Action {
    /// Action running `body` alone.
    #[must_use]
    pub fn new(body: Arc<dyn CommandBody>) -> Self {
        Self {
            pre: None,
            body,
            post: None,
            hooks: Vec::new(),
        }
    }

    /// Adds a native phase run before the hooks' pre phases.
    #[must_use]
    pub fn with_pre(mut self, pre: Arc<dyn CommandBody>) -> Self {
        self.pre = Some(pre);
        self
    }

    /// Adds a native phase run before the hooks' post phases.
    #[must_use]
    pub fn with_post(mut self, post: Arc<dyn CommandBody>) -> Self {
        self.post = Some(post);
        self
    }

    /// Appends a hook; hooks run in the order they were added.
    pub fn add_hook(&mut self, hook: Arc<dyn CommandHook>) {
        self.hooks.push(hook);
    }

    /// Names of the attached hooks in registration order.
    #[must_use]
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    /// Runs the native pre phase, every hook's pre phase, the body, the
    /// native post phase, then each hook's post phase followed by its
    /// cleanup.
    ///
    /// Hooks whose pre phase succeeded are always cleaned up, in
    /// registration order, whatever fails afterwards. Once a post phase
    /// fails the remaining hooks only clean up.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a pre phase, the body, the native post
    /// phase or a hook's post phase.
    pub fn run(&self, invocation: &Invocation) -> Result<(), CommandError> {
        if let Some(pre) = &self.pre {
            pre.run(invocation)?;
        }
        let mut scope = HookScope::new(invocation);
        for hook in &self.hooks {
            hook.pre(invocation)?;
            scope.enter(Arc::clone(hook));
        }
        self.body.run(invocation)?;
        if let Some(post) = &self.post {
            post.run(invocation)?;
        }

        let mut failure = None;
        for hook in scope.take() {
            if failure.is_none() {
                failure = hook.post(invocation).err();
            } else {
                debug!(target: GRAFT_TARGET, hook = hook.name(), "post skipped after earlier failure");
            }
            cleanup(hook.as_ref(), invocation);
        }
        failure.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("hooks", &self.hook_names())
            .finish_non_exhaustive()
    }
}

/// Hooks whose pre phase succeeded; dropping the scope cleans them up.
struct HookScope<'a> {
    invocation: &'a Invocation,
    entered: Vec<Arc<dyn CommandHook>>,
}

impl<'a> HookScope<'a> {
    const fn new(invocation: &'a Invocation) -> Self {
        Self {
            invocation,
            entered: Vec::new(),
        }
    }

    fn enter(&mut self, hook: Arc<dyn CommandHook>) {
        self.entered.push(hook);
    }

    /// Hands the entered hooks to the caller, who becomes responsible for
    /// their cleanup.
    fn take(&mut self) -> Vec<Arc<dyn CommandHook>> {
        std::mem::take(&mut self.entered)
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        for hook in self.entered.drain(..) {
            cleanup(hook.as_ref(), self.invocation);
        }
    }
}

fn cleanup(hook: &dyn CommandHook, invocation: &Invocation) {
    if let Err(failure) = hook.cleanup(invocation) {
        error!(
            target: GRAFT_TARGET,
            hook = hook.name(),
            command = %invocation.path,
            error = %failure,
            "hook cleanup failed"
        );
    }
}
