//! Built-in commands of the host.

mod app;


use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use trellis_apps::{CommandNode, CommandTree, LoadedApps};

pub(crate) use self::app::app_table;
use crate::Console;

/// Name of the root command.
pub(crate) const ROOT_COMMAND: &str = "trellis";

/// State the built-in commands act on.
#[derive(Debug)]
pub(crate) struct Builtins {
    /// Apps loaded for this run.
    pub(crate) apps: Arc<Mutex<LoadedApps>>,
    /// Where command output goes.
    pub(crate) console: Console,
    /// Directory of the global apps file.
    pub(crate) global_dir: Utf8PathBuf,
    /// Directory of the local apps file.
    pub(crate) local_dir: Utf8PathBuf,
}

impl Builtins {
    fn apps(&self) -> MutexGuard<'_, LoadedApps> {
        self.apps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apps_dir(&self, global: bool) -> &Utf8Path {
        if global {
            &self.global_dir
        } else {
            &self.local_dir
        }
    }
}

/// The tree before any app is grafted onto it.
pub(crate) fn builtin_tree(builtins: Builtins) -> CommandTree {
    let shared = Arc::new(builtins);
    CommandTree::new(
        CommandNode::group(ROOT_COMMAND)
            .with_short("Extensible command line hosting trellis apps")
            .with_child(app::app_group(&shared)),
    )
}
