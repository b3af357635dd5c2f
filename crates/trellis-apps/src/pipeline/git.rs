//! Fetching remote app sources with the `git` client.

use std::path::PathBuf;

use super::SourceFetcher;
use super::tool;
use crate::context::CallContext;
use crate::error::ToolError;
use crate::reference::RemoteSource;

/// [`SourceFetcher`] that shells out to `git`.
#[derive(Debug, Clone, Default)]
pub struct GitFetcher {
    program: Option<PathBuf>,
}

impl GitFetcher {
    /// Uses the `git` found on `PATH` at fetch time.
    #[must_use]
    pub const fn new() -> Self {
        Self { program: None }
    }

    /// Uses a specific `git` executable.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf, ToolError> {
        self.program
            .as_ref()
            .map_or_else(|| tool::locate("git"), |program| Ok(program.clone()))
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, source: &RemoteSource, ctx: &CallContext) -> Result<(), ToolError> {
        let git = self.program()?;
        let clone_dir = source.clone_dir().as_str();
        tool::run(
            &git,
            &["clone", "--quiet", source.clone_url(), clone_dir],
            None,
            ctx,
        )?;
        if let Some(revision) = source.revision() {
            tool::run(
                &git,
                &["-C", clone_dir, "checkout", "--quiet", revision],
                None,
                ctx,
            )?;
        }
        Ok(())
    }
}
