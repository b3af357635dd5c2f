//! Fetching and building app sources.
//!
//! Remote apps are cloned once under the apps directory and built only when
//! their artifact is missing. Local apps are used in place and rebuilt
//! whenever a source file is newer than the artifact. The external tools sit
//! behind [`SourceFetcher`] and [`Toolchain`] so loaders can be exercised
//! without `git` or `cargo`.

mod cargo;
mod git;
mod tool;

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use camino::Utf8Path;
use tracing::{debug, info, warn};

pub use self::cargo::CargoToolchain;
pub use self::git::GitFetcher;
use crate::context::CallContext;
use crate::error::{BuildStep, PipelineError, ToolError};
use crate::reference::{RemoteSource, ResolvedApp};

const PIPELINE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pipeline");

/// Directories never considered when checking whether sources changed.
const SKIPPED_DIRS: [&str; 2] = [".git", "target"];

/// Obtains the sources of a remote app.
pub trait SourceFetcher: Send + Sync {
    /// Populates `source.clone_dir()`, checking out the pinned revision.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying tool.
    fn fetch(&self, source: &RemoteSource, ctx: &CallContext) -> Result<(), ToolError>;
}

/// Turns app sources into an executable artifact.
pub trait Toolchain: Send + Sync {
    /// Resolves the dependencies of the sources in `src`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying tool.
    fn tidy(&self, src: &Utf8Path, ctx: &CallContext) -> Result<(), ToolError>;

    /// Compiles `src` and installs the executable for app `name` at
    /// `artifact`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying tool, or a missing-artifact
    /// error when nothing suitable was built.
    fn compile(
        &self,
        src: &Utf8Path,
        name: &str,
        artifact: &Utf8Path,
        ctx: &CallContext,
    ) -> Result<(), ToolError>;
}

/// Clones a remote app unless its clone directory already exists.
///
/// Local apps are never fetched. A failed clone leaves no directory behind so
/// the next attempt starts clean.
///
/// # Errors
///
/// Returns [`PipelineError::Fetch`] naming the repository key.
pub fn fetch(
    fetcher: &dyn SourceFetcher,
    app: &ResolvedApp,
    ctx: &CallContext,
) -> Result<(), PipelineError> {
    let Some(source) = app.remote_source() else {
        return Ok(());
    };
    if source.clone_dir().exists() {
        debug!(
            target: PIPELINE_TARGET,
            repository = source.repository(),
            "sources already present"
        );
        return Ok(());
    }
    let fetch_error = |error: ToolError| PipelineError::Fetch {
        repository: source.repository().to_owned(),
        source: error,
    };
    if let Some(parent) = source.clone_dir().parent() {
        fs::create_dir_all(parent).map_err(|error| {
            fetch_error(ToolError::Io {
                path: parent.to_path_buf(),
                source: Arc::new(error),
            })
        })?;
    }

    info!(
        target: PIPELINE_TARGET,
        repository = source.repository(),
        dir = %source.clone_dir(),
        "cloning app sources"
    );
    if let Err(error) = fetcher.fetch(source, ctx) {
        discard_partial_clone(source.clone_dir());
        return Err(fetch_error(error));
    }
    Ok(())
}

fn discard_partial_clone(dir: &Utf8Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            target: PIPELINE_TARGET,
            dir = %dir,
            error = %error,
            "failed to remove partial clone"
        ),
    }
}

/// Whether `app` has to be built before it can be launched.
///
/// Remote apps are built once; local apps whenever they are outdated.
///
/// # Errors
///
/// Returns [`PipelineError::Inspect`] when the source tree cannot be walked.
pub fn needs_build(app: &ResolvedApp) -> Result<bool, PipelineError> {
    let artifact = app.artifact_path();
    if app.is_local() {
        is_outdated(app.src_path(), &artifact)
    } else {
        Ok(!artifact.exists())
    }
}

/// Runs the dependency step and then the compile step for `app`.
///
/// # Errors
///
/// Returns [`PipelineError::Build`] naming the step that failed.
pub fn build(
    toolchain: &dyn Toolchain,
    app: &ResolvedApp,
    ctx: &CallContext,
) -> Result<(), PipelineError> {
    let src = app.src_path();
    let artifact = app.artifact_path();
    info!(
        target: PIPELINE_TARGET,
        app = app.name(),
        artifact = %artifact,
        "building app"
    );
    toolchain
        .tidy(src, ctx)
        .map_err(|source| PipelineError::Build {
            step: BuildStep::Tidy,
            source,
        })?;
    toolchain
        .compile(src, app.name(), &artifact, ctx)
        .map_err(|source| PipelineError::Build {
            step: BuildStep::Compile,
            source,
        })
}

/// Whether `artifact` is missing or older than any file under `source`.
///
/// `.git` and `target` directories are ignored, as is the artifact itself.
///
/// # Errors
///
/// Returns [`PipelineError::Inspect`] when the tree or a file's metadata
/// cannot be read.
pub fn is_outdated(source: &Utf8Path, artifact: &Utf8Path) -> Result<bool, PipelineError> {
    let built_at = match fs::metadata(artifact).and_then(|meta| meta.modified()) {
        Ok(time) => time,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(error) => return Err(inspect_error(artifact, &error)),
    };
    Ok(newest_source(source, artifact)?.is_some_and(|newest| newest > built_at))
}

fn newest_source(
    source: &Utf8Path,
    artifact: &Utf8Path,
) -> Result<Option<SystemTime>, PipelineError> {
    let mut newest = None;
    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_entry(|entry| !should_skip(entry))
    {
        let entry = entry.map_err(|error| PipelineError::Inspect {
            path: source.to_path_buf(),
            message: error.to_string(),
        })?;
        if !entry.file_type().is_file() || entry.path() == artifact.as_std_path() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|error| PipelineError::Inspect {
                path: source.to_path_buf(),
                message: error.to_string(),
            })?
            .modified()
            .map_err(|error| inspect_error(source, &error))?;
        if newest.is_none_or(|current| modified > current) {
            newest = Some(modified);
        }
    }
    Ok(newest)
}

fn should_skip(entry: &walkdir::DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn inspect_error(path: &Utf8Path, error: &io::Error) -> PipelineError {
    PipelineError::Inspect {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

/// Removes the clone directory of a remote app. Local apps are left alone.
///
/// # Errors
///
/// Returns [`PipelineError::Clean`] when the directory exists but cannot be
/// removed.
pub fn clean(app: &ResolvedApp) -> Result<(), PipelineError> {
    let Some(source) = app.remote_source() else {
        return Ok(());
    };
    let dir = source.clone_dir();
    match fs::remove_dir_all(dir) {
        Ok(()) => {
            info!(target: PIPELINE_TARGET, dir = %dir, "removed app sources");
            Ok(())
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(PipelineError::Clean {
            path: dir.to_path_buf(),
            source: Arc::new(error),
        }),
    }
}
