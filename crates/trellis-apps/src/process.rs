//! Process liveness checks.
//!
//! Used to tell a stale lock or reattachment descriptor from one whose owner
//! is still running.

/// Whether a process with this id is known to be running.
///
/// Returns `Some(false)` only when the operating system confirms the process
/// does not exist. `None` means liveness cannot be determined, and callers
/// must treat the process as possibly alive.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return Some(false);
    }
    let raw = i32::try_from(pid).ok()?;
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(Errno::ESRCH) => Some(false),
        Err(_) => None,
    }
}

/// Whether a process with this id is known to be running.
///
/// Liveness cannot be checked on this platform, so the answer is always
/// unknown.
#[cfg(not(unix))]
#[must_use]
pub const fn is_alive(_pid: u32) -> Option<bool> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert_eq!(is_alive(std::process::id()), Some(true));
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait for child");
        assert_eq!(is_alive(pid), Some(false));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert_eq!(is_alive(0), Some(false));
    }
}
