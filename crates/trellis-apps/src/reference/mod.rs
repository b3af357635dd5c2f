//! Resolution of configured app references.
//!
//! A reference is either an absolute local directory or a remote repository
//! path of the form `host/org/repo[/subpath...][@revision]`. Parsing is pure;
//! only [`resolve`] touches the filesystem, and only to check that a local
//! directory exists.

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ResolveError;

#[cfg(test)]
mod tests;

/// Extension of the build artifact placed in an app's source directory.
pub const ARTIFACT_EXTENSION: &str = "app";

const REPOSITORY_SEGMENTS: usize = 3;

/// Where an app's sources come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSource {
    /// A directory on this machine, used in place.
    Local,
    /// A repository cloned under the apps directory.
    Remote(RemoteSource),
}

/// Locations derived from a remote reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    repository: String,
    clone_url: String,
    clone_dir: Utf8PathBuf,
    revision: Option<String>,
    subpath: String,
}

impl RemoteSource {
    /// Repository key: `host/org/repo`, with `@revision` when pinned.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// HTTPS URL handed to the version-control client.
    #[must_use]
    pub fn clone_url(&self) -> &str {
        &self.clone_url
    }

    /// Directory the repository is cloned into.
    #[must_use]
    pub fn clone_dir(&self) -> &Utf8Path {
        &self.clone_dir
    }

    /// Branch, tag or commit to check out.
    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Path of the app inside the repository, empty for the repository root.
    #[must_use]
    pub fn subpath(&self) -> &str {
        &self.subpath
    }
}

/// Fully derived locations for one app reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApp {
    reference: String,
    source: AppSource,
    src_path: Utf8PathBuf,
    name: String,
}

impl ResolvedApp {
    /// Derives every location for `reference` without touching the
    /// filesystem.
    ///
    /// # Errors
    ///
    /// Fails for an empty reference, or a remote reference with fewer than
    /// three path segments or an empty segment. One trailing `/` is allowed.
    pub fn parse(base_dir: &Utf8Path, reference: &str) -> Result<Self, ResolveError> {
        if reference.is_empty() {
            return Err(ResolveError::MissingPath);
        }
        if reference.starts_with('/') {
            return Ok(Self::local(reference));
        }
        Self::remote(base_dir, reference)
    }

    fn local(reference: &str) -> Self {
        let path = Utf8PathBuf::from(reference);
        let name = path.file_name().unwrap_or(reference).to_owned();
        Self {
            reference: reference.to_owned(),
            source: AppSource::Local,
            src_path: path,
            name,
        }
    }

    fn remote(base_dir: &Utf8Path, reference: &str) -> Result<Self, ResolveError> {
        let (path, revision) = match reference.rsplit_once('@') {
            Some((path, revision)) if !revision.is_empty() => (path, Some(revision)),
            Some((path, _)) => (path, None),
            None => (reference, None),
        };

        let segments: Vec<&str> = path.strip_suffix('/').unwrap_or(path).split('/').collect();
        if segments.len() < REPOSITORY_SEGMENTS || segments.contains(&"") {
            return Err(ResolveError::InvalidRepository {
                path: path.to_owned(),
            });
        }
        let (repository_parts, sub_parts) = segments.split_at(REPOSITORY_SEGMENTS);
        let repository_path = repository_parts.join("/");
        let subpath = sub_parts.join("/");
        let name = segments.last().copied().unwrap_or(path).to_owned();

        let (clone_dir, repository) = match revision {
            Some(revision) => (
                base_dir.join(format!("{repository_path}-{}", revision.replace('/', "-"))),
                format!("{repository_path}@{revision}"),
            ),
            None => (base_dir.join(&repository_path), repository_path.clone()),
        };
        let src_path = if subpath.is_empty() {
            clone_dir.clone()
        } else {
            clone_dir.join(&subpath)
        };

        Ok(Self {
            reference: reference.to_owned(),
            source: AppSource::Remote(RemoteSource {
                repository,
                clone_url: format!("https://{repository_path}"),
                clone_dir,
                revision: revision.map(str::to_owned),
                subpath,
            }),
            src_path,
            name,
        })
    }

    /// The reference exactly as configured.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Local or remote origin.
    #[must_use]
    pub const fn source(&self) -> &AppSource {
        &self.source
    }

    /// Remote locations, when the app is remote.
    #[must_use]
    pub const fn remote_source(&self) -> Option<&RemoteSource> {
        match &self.source {
            AppSource::Remote(remote) => Some(remote),
            AppSource::Local => None,
        }
    }

    /// Whether the app is used in place from a local directory.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.source, AppSource::Local)
    }

    /// Directory holding the app's sources and artifact.
    #[must_use]
    pub fn src_path(&self) -> &Utf8Path {
        &self.src_path
    }

    /// Display name, which is also the service name the app exposes.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the build artifact: `<src>/<name>.app`.
    #[must_use]
    pub fn artifact_path(&self) -> Utf8PathBuf {
        self.src_path
            .join(format!("{}.{ARTIFACT_EXTENSION}", self.name))
    }
}

/// Resolves `reference` against `base_dir`, checking that local apps point
/// at an existing directory.
///
/// # Errors
///
/// Returns the parse errors of [`ResolvedApp::parse`], or a local-path error
/// when the directory is missing or not a directory.
pub fn resolve(base_dir: &Utf8Path, reference: &str) -> Result<ResolvedApp, ResolveError> {
    let resolved = ResolvedApp::parse(base_dir, reference)?;
    if resolved.is_local() {
        check_local_dir(reference)?;
    }
    Ok(resolved)
}

fn check_local_dir(reference: &str) -> Result<(), ResolveError> {
    match fs::metadata(reference) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(ResolveError::LocalNotDirectory {
            path: reference.to_owned(),
        }),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Err(ResolveError::LocalNotFound {
            path: reference.to_owned(),
        }),
        Err(error) => Err(ResolveError::LocalInspect {
            path: reference.to_owned(),
            message: error.to_string(),
        }),
    }
}
