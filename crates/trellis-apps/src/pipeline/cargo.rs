//! Building app binaries with `cargo`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use super::Toolchain;
use super::tool;
use crate::context::CallContext;
use crate::error::ToolError;

/// [`Toolchain`] that shells out to `cargo`.
#[derive(Debug, Clone, Default)]
pub struct CargoToolchain {
    program: Option<PathBuf>,
}

impl CargoToolchain {
    /// Uses the `cargo` found on `PATH` at build time.
    #[must_use]
    pub const fn new() -> Self {
        Self { program: None }
    }

    /// Uses a specific `cargo` executable.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf, ToolError> {
        self.program
            .as_ref()
            .map_or_else(|| tool::locate("cargo"), |program| Ok(program.clone()))
    }
}

impl Toolchain for CargoToolchain {
    fn tidy(&self, src: &Utf8Path, ctx: &CallContext) -> Result<(), ToolError> {
        let cargo = self.program()?;
        tool::run(&cargo, &["fetch", "--quiet"], Some(src), ctx)?;
        Ok(())
    }

    fn compile(
        &self,
        src: &Utf8Path,
        name: &str,
        artifact: &Utf8Path,
        ctx: &CallContext,
    ) -> Result<(), ToolError> {
        let cargo = self.program()?;
        let output = tool::run(
            &cargo,
            &[
                "build",
                "--release",
                "--message-format=json-render-diagnostics",
            ],
            Some(src),
            ctx,
        )?;
        let executables = built_executables(&String::from_utf8_lossy(&output.stdout));
        let executable = pick_executable(&executables, name)?;
        install(executable, artifact)
    }
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    executable: Option<Utf8PathBuf>,
}

/// Executables reported by `cargo build --message-format=json` output, in
/// build order.
pub(crate) fn built_executables(stdout: &str) -> Vec<Utf8PathBuf> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter(|message| message.reason == "compiler-artifact")
        .filter_map(|message| message.executable)
        .collect()
}

/// Chooses the executable named after the app, or the only one built.
pub(crate) fn pick_executable<'a>(
    executables: &'a [Utf8PathBuf],
    name: &str,
) -> Result<&'a Utf8Path, ToolError> {
    if let Some(named) = executables
        .iter()
        .find(|path| path.file_stem() == Some(name))
    {
        return Ok(named);
    }
    match executables {
        [only] => Ok(only),
        [] => Err(ToolError::MissingArtifact {
            message: "cargo reported no executable".to_owned(),
        }),
        _ => Err(ToolError::MissingArtifact {
            message: format!(
                "{} executables built and none is named {name:?}",
                executables.len()
            ),
        }),
    }
}

/// Copies the built executable next to the sources, replacing any previous
/// artifact in one rename.
fn install(executable: &Utf8Path, artifact: &Utf8Path) -> Result<(), ToolError> {
    let staging = artifact.with_extension("app.partial");
    let io_error = |path: &Utf8Path, source| ToolError::Io {
        path: path.to_path_buf(),
        source: Arc::new(source),
    };
    fs::copy(executable, &staging).map_err(|source| io_error(executable, source))?;
    fs::rename(&staging, artifact).map_err(|source| io_error(artifact, source))?;
    Ok(())
}
