//! Persisted reattachment descriptors shared by every invocation.
//!
//! The store is a single JSON file:
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "namespaces": {
//!     "app.rpc.context": {
//!       "github.com/org/app": { "protocol_version": 1, "endpoint": { ... }, "pid": 4242 }
//!     }
//!   }
//! }
//! ```
//!
//! Reads take a snapshot without locking; the file is only ever replaced by
//! an atomic rename. Updates are read-modify-write of a single key under a
//! lock file, so concurrent invocations never clobber unrelated entries. A
//! file written by another tool version, or one that does not decode, is
//! treated as empty and replaced on the next write.

mod lock;


use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::Builder;
use tracing::{debug, warn};
use trellis_config::SocketEndpoint;

use self::lock::CacheLock;
use crate::error::CacheError;

/// Tracing target for cache operations.
const CACHE_TARGET: &str = "trellis_apps::cache";

/// Namespace holding app reattachment descriptors.
pub const REATTACH_NAMESPACE: &str = "app.rpc.context";

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(3);

/// Everything a later invocation needs to connect to a running app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachDescriptor {
    /// Protocol version spoken by the app.
    pub protocol_version: u32,
    /// Endpoint the app listens on.
    pub endpoint: SocketEndpoint,
    /// Process id of the app.
    pub pid: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    version: String,
    #[serde(default)]
    namespaces: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Handle on the reattachment cache file.
#[derive(Debug, Clone)]
pub struct ReattachStore {
    path: Utf8PathBuf,
    version: String,
    lock_wait: Duration,
}

impl ReattachStore {
    /// Binds the store to `path`, versioned by `version`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Overrides how long an update waits for the lock.
    #[must_use]
    pub const fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Location of the cache file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Version string entries are valid for.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Looks up the descriptor published for `reference`.
    ///
    /// # Errors
    ///
    /// Fails for an empty reference or an unreadable cache file.
    pub fn read(&self, reference: &str) -> Result<Option<ReattachDescriptor>, CacheError> {
        ensure_reference(reference)?;
        let mut document = self.load_document()?;
        let Some(value) = document
            .namespaces
            .get_mut(REATTACH_NAMESPACE)
            .and_then(|entries| entries.remove(reference))
        else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(error) => {
                warn!(
                    target: CACHE_TARGET,
                    reference,
                    error = %error,
                    "ignoring undecodable reattachment descriptor"
                );
                Ok(None)
            }
        }
    }

    /// Whether a descriptor is published for `reference`.
    ///
    /// # Errors
    ///
    /// See [`ReattachStore::read`].
    pub fn contains(&self, reference: &str) -> Result<bool, CacheError> {
        self.read(reference).map(|entry| entry.is_some())
    }

    /// Publishes `descriptor` under `reference`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails for an empty reference, when the lock cannot be taken, or when
    /// the file cannot be written.
    pub fn write(&self, reference: &str, descriptor: &ReattachDescriptor) -> Result<(), CacheError> {
        ensure_reference(reference)?;
        let value = serde_json::to_value(descriptor).map_err(|e| CacheError::Encode(Arc::new(e)))?;
        self.update(|entries| {
            entries.insert(reference.to_owned(), value);
            true
        })?;
        debug!(
            target: CACHE_TARGET,
            reference,
            pid = descriptor.pid,
            endpoint = %descriptor.endpoint,
            "published reattachment descriptor"
        );
        Ok(())
    }

    /// Deletes the entry for `reference`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Fails for an empty reference, when the lock cannot be taken, or when
    /// the file cannot be written.
    pub fn remove(&self, reference: &str) -> Result<bool, CacheError> {
        ensure_reference(reference)?;
        let removed = self.update(|entries| entries.remove(reference).is_some())?;
        if removed {
            debug!(target: CACHE_TARGET, reference, "removed reattachment descriptor");
        }
        Ok(removed)
    }

    /// Deletes the entry for `reference` only when it still names the
    /// process `pid`, so an instance never withdraws a descriptor another
    /// one published over its own. Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// See [`ReattachStore::remove`].
    pub fn remove_published(&self, reference: &str, pid: u32) -> Result<bool, CacheError> {
        ensure_reference(reference)?;
        let removed = self.update(|entries| {
            let published_by_pid = entries
                .get(reference)
                .and_then(|value| ReattachDescriptor::deserialize(value).ok())
                .is_some_and(|descriptor| descriptor.pid == pid);
            published_by_pid && entries.remove(reference).is_some()
        })?;
        if removed {
            debug!(target: CACHE_TARGET, reference, pid, "removed reattachment descriptor");
        } else {
            debug!(
                target: CACHE_TARGET,
                reference,
                pid,
                "reattachment descriptor belongs to another process; left in place"
            );
        }
        Ok(removed)
    }

    fn update<F>(&self, mutate: F) -> Result<bool, CacheError>
    where
        F: FnOnce(&mut BTreeMap<String, Value>) -> bool,
    {
        self.ensure_parent()?;
        let _lock = CacheLock::acquire(&self.lock_path(), self.lock_wait)?;
        let mut document = self.load_document()?;
        let entries = document
            .namespaces
            .entry(REATTACH_NAMESPACE.to_owned())
            .or_default();
        if !mutate(entries) {
            return Ok(false);
        }
        let encoded =
            serde_json::to_vec_pretty(&document).map_err(|e| CacheError::Encode(Arc::new(e)))?;
        atomic_write(&self.path, &encoded).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source: Arc::new(source),
        })?;
        Ok(true)
    }

    fn load_document(&self) -> Result<CacheDocument, CacheError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(self.empty_document());
            }
            Err(source) => {
                return Err(CacheError::Read {
                    path: self.path.clone(),
                    source: Arc::new(source),
                });
            }
        };
        let document: CacheDocument = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(error) => {
                warn!(
                    target: CACHE_TARGET,
                    file = %self.path,
                    error = %error,
                    "reattachment cache is corrupt; ignoring its entries"
                );
                return Ok(self.empty_document());
            }
        };
        if document.version != self.version {
            debug!(
                target: CACHE_TARGET,
                found = %document.version,
                expected = %self.version,
                "cache written by another version; ignoring its entries"
            );
            return Ok(self.empty_document());
        }
        Ok(document)
    }

    fn empty_document(&self) -> CacheDocument {
        CacheDocument {
            version: self.version.clone(),
            namespaces: BTreeMap::new(),
        }
    }

    fn lock_path(&self) -> Utf8PathBuf {
        let mut name = self.path.file_name().unwrap_or("cache").to_owned();
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<(), CacheError> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_str().is_empty()) else {
            return Ok(());
        };
        fs::create_dir_all(parent).map_err(|source| CacheError::Write {
            path: self.path.clone(),
            source: Arc::new(source),
        })
    }
}

fn ensure_reference(reference: &str) -> Result<(), CacheError> {
    if reference.is_empty() {
        return Err(CacheError::EmptyReference);
    }
    Ok(())
}

/// Replaces `path` with `contents` through a synced temp file and rename so
/// readers never observe a partial payload.
fn atomic_write(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));

    let mut builder = Builder::new();
    builder.prefix(path.file_name().unwrap_or("trellis-cache"));
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(Permissions::from_mode(0o600));
    }

    let mut file = builder.tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}
