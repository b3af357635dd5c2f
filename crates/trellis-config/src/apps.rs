//! TOML files listing installed apps.
//!
//! Two files exist: the global one in the apps directory and an optional
//! local one in the working directory. Both share the same layout:
//!
//! ```toml
//! [[apps]]
//! path = "github.com/org/app@v1"
//! with = { greeting = "hi" }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use thiserror::Error;

/// File name of an apps configuration file.
pub const APPS_FILE_NAME: &str = "trellis-apps.toml";

/// One installed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppEntry {
    /// App reference: an absolute local path or `host/org/repo[/sub][@rev]`.
    pub path: String,
    /// Install-time parameters forwarded to every app call.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
    /// Whether the entry was read from the global file.
    #[serde(skip)]
    pub global: bool,
}

impl AppEntry {
    /// Builds an entry without parameters.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            with: BTreeMap::new(),
            global: false,
        }
    }

    /// Adds an install-time parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppsDocument {
    #[serde(default)]
    apps: Vec<AppEntry>,
}

/// Errors raised while reading or updating an apps file.
#[derive(Debug, Clone, Error)]
pub enum AppsFileError {
    /// The file exists but could not be read.
    #[error("failed to read apps file '{path}': {source}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The file is not valid TOML for the apps layout.
    #[error("failed to parse apps file '{path}': {source}")]
    Parse {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying TOML error.
        #[source]
        source: Arc<toml::de::Error>,
    },
    /// The entries could not be encoded.
    #[error("failed to encode apps file '{path}': {source}")]
    Encode {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying TOML error.
        #[source]
        source: Arc<toml::ser::Error>,
    },
    /// The file could not be written.
    #[error("failed to write apps file '{path}': {source}")]
    Write {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// An entry with the same path is already present.
    #[error("app {path} is already installed")]
    AlreadyInstalled {
        /// Offending app reference.
        path: String,
    },
    /// No entry with the requested path exists.
    #[error("app {path} not found")]
    NotInstalled {
        /// Requested app reference.
        path: String,
    },
}

/// An apps file bound to its location on disk.
#[derive(Debug, Clone)]
pub struct AppsFile {
    path: Utf8PathBuf,
    global: bool,
    entries: Vec<AppEntry>,
}

impl AppsFile {
    /// Reads `dir/trellis-apps.toml`. A missing file yields an empty list
    /// that [`AppsFile::save`] will create.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn load(dir: &Utf8Path, global: bool) -> Result<Self, AppsFileError> {
        let path = dir.join(APPS_FILE_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
            Err(error) => {
                return Err(AppsFileError::Read {
                    path,
                    source: Arc::new(error),
                });
            }
        };
        let document: AppsDocument =
            toml::from_str(&text).map_err(|source| AppsFileError::Parse {
                path: path.clone(),
                source: Arc::new(source),
            })?;
        let entries = document
            .apps
            .into_iter()
            .map(|mut entry| {
                entry.global = global;
                entry
            })
            .collect();
        Ok(Self {
            path,
            global,
            entries,
        })
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Whether this is the global file.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        self.global
    }

    /// Entries in file order.
    #[must_use]
    pub fn entries(&self) -> &[AppEntry] {
        &self.entries
    }

    /// Whether an entry with exactly this reference exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`AppsFileError::AlreadyInstalled`] for a duplicate path.
    pub fn add(&mut self, mut entry: AppEntry) -> Result<(), AppsFileError> {
        if self.contains(&entry.path) {
            return Err(AppsFileError::AlreadyInstalled { path: entry.path });
        }
        entry.global = self.global;
        self.entries.push(entry);
        Ok(())
    }

    /// Removes the entry with this reference.
    ///
    /// # Errors
    ///
    /// Returns [`AppsFileError::NotInstalled`] when nothing matches.
    pub fn remove(&mut self, path: &str) -> Result<AppEntry, AppsFileError> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.path == path)
            .ok_or_else(|| AppsFileError::NotInstalled {
                path: path.to_owned(),
            })?;
        Ok(self.entries.remove(position))
    }

    /// Writes the entries back, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Fails when encoding or the atomic write fails.
    pub fn save(&self) -> Result<(), AppsFileError> {
        let document = AppsDocument {
            apps: self.entries.clone(),
        };
        let text = toml::to_string_pretty(&document).map_err(|source| AppsFileError::Encode {
            path: self.path.clone(),
            source: Arc::new(source),
        })?;
        atomic_write(&self.path, text.as_bytes()).map_err(|source| AppsFileError::Write {
            path: self.path.clone(),
            source: Arc::new(source),
        })
    }
}

/// Concatenates local then global entries, keeping the first occurrence of
/// each path.
#[must_use]
pub fn merge_unique(local: Vec<AppEntry>, global: Vec<AppEntry>) -> Vec<AppEntry> {
    let mut merged: Vec<AppEntry> = Vec::with_capacity(local.len() + global.len());
    for entry in local.into_iter().chain(global) {
        if !merged.iter().any(|existing| existing.path == entry.path) {
            merged.push(entry);
        }
    }
    merged
}

fn atomic_write(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(directory)?;

    let mut file = Builder::new()
        .prefix(path.file_name().unwrap_or(APPS_FILE_NAME))
        .tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}
