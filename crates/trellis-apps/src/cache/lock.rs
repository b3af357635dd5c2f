//! Advisory lock file serialising cache updates across processes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};

use super::CACHE_TARGET;
use crate::error::CacheError;
use crate::process;

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(50);
/// A lock file without a readable pid older than this is considered
/// abandoned by a writer that crashed between create and write.
const ORPHAN_AGE: Duration = Duration::from_secs(5);

/// Held while a cache update is in progress; removes the lock file on drop.
#[derive(Debug)]
pub(super) struct CacheLock {
    path: Utf8PathBuf,
    identity: Option<FileIdentity>,
    _file: File,
}

impl CacheLock {
    pub(super) fn acquire(path: &Utf8Path, wait: Duration) -> Result<Self, CacheError> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match create_lock_file(path) {
                Ok(file) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        identity: file.metadata().ok().map(|meta| FileIdentity::of(&meta)),
                        _file: file,
                    });
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if clear_if_stale(path)? {
                        continue;
                    }
                }
                Err(source) => {
                    return Err(CacheError::Lock {
                        path: path.to_path_buf(),
                        source: Arc::new(source),
                    });
                }
            }

            let waited = started.elapsed();
            if waited >= wait {
                return Err(CacheError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_ms: waited.as_millis(),
                });
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let Ok(meta) = fs::metadata(&self.path) else {
            return;
        };
        if Some(FileIdentity::of(&meta)) != self.identity {
            warn!(
                target: CACHE_TARGET,
                file = %self.path,
                "cache lock was replaced while held; leaving it in place"
            );
            return;
        }
        if let Err(error) = fs::remove_file(&self.path)
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target: CACHE_TARGET,
                file = %self.path,
                error = %error,
                "failed to remove cache lock"
            );
        }
    }
}

/// Tells the file a lock holder created from one later put at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    device: u64,
    #[cfg(unix)]
    inode: u64,
    #[cfg(not(unix))]
    modified: Option<SystemTime>,
    #[cfg(not(unix))]
    len: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        }
    }
}

/// A lock file judged abandoned.
#[derive(Debug)]
struct StaleLock {
    holder: Option<u32>,
}

fn create_lock_file(path: &Utf8Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(file)
}

/// Removes the lock when its holder is gone. Returns whether the path is
/// free to retry.
fn clear_if_stale(path: &Utf8Path) -> Result<bool, CacheError> {
    match inspect(path) {
        Ok(Some(_)) => take_over(path),
        Ok(None) => Ok(false),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(source) => Err(lock_error(path, source)),
    }
}

fn inspect(path: &Utf8Path) -> io::Result<Option<StaleLock>> {
    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let mut text = String::new();
    let holder = file
        .read_to_string(&mut text)
        .ok()
        .and_then(|_| text.trim().parse::<u32>().ok());
    let stale = match holder {
        Some(pid) => process::is_alive(pid) == Some(false),
        None => age(&meta).is_some_and(|elapsed| elapsed > ORPHAN_AGE),
    };
    Ok(stale.then_some(StaleLock { holder }))
}

/// Moves the lock aside and judges it again there, where no other writer
/// can replace it. A lock that turns out to be live is linked back.
fn take_over(path: &Utf8Path) -> Result<bool, CacheError> {
    let aside = aside_path(path);
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(source) => return Err(lock_error(path, source)),
    }

    if let Ok(Some(stale)) = inspect(&aside) {
        debug!(
            target: CACHE_TARGET,
            file = %path,
            holder = ?stale.holder,
            "lock holder not detected; removing stale lock"
        );
        fs::remove_file(&aside).map_err(|source| lock_error(&aside, source))?;
        return Ok(true);
    }

    debug!(
        target: CACHE_TARGET,
        file = %path,
        "lock changed hands before removal; restoring it"
    );
    if let Err(error) = fs::hard_link(&aside, path)
        && error.kind() != io::ErrorKind::AlreadyExists
    {
        warn!(target: CACHE_TARGET, file = %path, error = %error, "failed to restore cache lock");
    }
    if let Err(error) = fs::remove_file(&aside) {
        warn!(target: CACHE_TARGET, file = %aside, error = %error, "failed to remove moved lock");
    }
    Ok(false)
}

fn aside_path(path: &Utf8Path) -> Utf8PathBuf {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();
    Utf8PathBuf::from(format!("{path}.stale.{}.{nanos}", std::process::id()))
}

fn lock_error(path: &Utf8Path, source: io::Error) -> CacheError {
    CacheError::Lock {
        path: path.to_path_buf(),
        source: Arc::new(source),
    }
}

fn age(meta: &fs::Metadata) -> Option<Duration> {
    let modified = meta.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Command;

    use tempfile::TempDir;

    use super::*;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("reap child");
        pid
    }

    fn lock_in(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("cache.json.lock")).expect("utf8 path")
    }

    fn leftovers(dir: &TempDir) -> usize {
        fs::read_dir(dir.path()).expect("read dir").count()
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_in(&dir);
        fs::write(&path, format!("{}\n", dead_pid())).expect("seed lock");

        assert!(clear_if_stale(&path).expect("clear"));

        assert!(!path.exists());
        assert_eq!(leftovers(&dir), 0, "moved lock is removed");
    }

    #[test]
    fn lock_replaced_after_inspection_is_kept() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_in(&dir);
        let fresh = CacheLock::acquire(&path, Duration::from_secs(1)).expect("fresh lock");

        assert!(!take_over(&path).expect("take over"));

        let holder = fs::read_to_string(&path).expect("lock restored");
        assert_eq!(holder.trim(), std::process::id().to_string());
        assert_eq!(leftovers(&dir), 1, "only the live lock remains");
        drop(fresh);
        assert!(!path.exists(), "restored lock still belongs to its holder");
    }

    #[test]
    fn live_lock_is_not_stale() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_in(&dir);
        let held = CacheLock::acquire(&path, Duration::from_secs(1)).expect("lock");

        assert!(inspect(&path).expect("inspect").is_none());
        assert!(!clear_if_stale(&path).expect("clear"));
        drop(held);
    }

    #[test]
    fn replaced_lock_is_left_on_drop() {
        let dir = TempDir::new().expect("temp dir");
        let path = lock_in(&dir);
        let held = CacheLock::acquire(&path, Duration::from_secs(1)).expect("lock");
        fs::remove_file(&path).expect("lock removed underneath");
        fs::write(&path, "1\n").expect("someone else's lock");

        drop(held);

        assert!(path.exists());
    }
}
