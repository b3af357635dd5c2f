//! Destinations for app process output and the drain handshake.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::HOST_TARGET;

/// A writer shared between forwarding threads.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Where an app's stdout and stderr are forwarded.
#[derive(Clone)]
pub struct OutputSinks {
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl OutputSinks {
    /// Forwards to the given writers.
    #[must_use]
    pub fn new(stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
        Self {
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
        }
    }

    /// Forwards to this process's own stdout and stderr.
    #[must_use]
    pub fn inherit() -> Self {
        Self::new(Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Discards everything.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(Box::new(io::sink()), Box::new(io::sink()))
    }

    /// Writes a chunk of app stdout.
    pub fn write_stdout(&self, bytes: &[u8]) {
        write_to(&self.stdout, bytes, "stdout");
    }

    /// Writes a chunk of app stderr.
    pub fn write_stderr(&self, bytes: &[u8]) {
        write_to(&self.stderr, bytes, "stderr");
    }
}

impl Default for OutputSinks {
    fn default() -> Self {
        Self::inherit()
    }
}

impl fmt::Debug for OutputSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSinks").finish_non_exhaustive()
    }
}

fn write_to(sink: &SharedWriter, bytes: &[u8], stream: &'static str) {
    let Ok(mut writer) = sink.lock() else {
        return;
    };
    if let Err(error) = writer.write_all(bytes).and_then(|()| writer.flush()) {
        warn!(target: HOST_TARGET, stream, error = %error, "failed to forward app output");
    }
}

/// Most tokens a monitor remembers, seen or given up on.
const DRAIN_BACKLOG: usize = 64;

/// Tracks drain markers seen on an app's stdout.
///
/// The forwarder reports each token it swallows; a caller that sent the
/// token waits here until the app's output up to that point has been
/// forwarded. A token whose wait timed out is dropped when its marker
/// finally arrives, and both sets are bounded so markers nobody waits for
/// cannot accumulate.
#[derive(Debug, Default)]
pub struct DrainMonitor {
    state: Mutex<DrainState>,
    signal: Condvar,
}

#[derive(Debug, Default)]
struct DrainState {
    seen: VecDeque<String>,
    abandoned: VecDeque<String>,
}

impl DrainState {
    fn take_seen(&mut self, token: &str) -> bool {
        take(&mut self.seen, token)
    }

    fn record_seen(&mut self, token: &str) {
        if !take(&mut self.abandoned, token) {
            remember(&mut self.seen, token);
        }
    }

    fn abandon(&mut self, token: &str) {
        remember(&mut self.abandoned, token);
    }
}

fn take(tokens: &mut VecDeque<String>, token: &str) -> bool {
    tokens
        .iter()
        .position(|held| held == token)
        .and_then(|index| tokens.remove(index))
        .is_some()
}

fn remember(tokens: &mut VecDeque<String>, token: &str) {
    if tokens.len() >= DRAIN_BACKLOG {
        tokens.pop_front();
    }
    tokens.push_back(token.to_owned());
}

impl DrainMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the marker for `token` was forwarded past.
    pub fn notify(&self, token: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.record_seen(token);
            self.signal.notify_all();
        }
    }

    /// Waits up to `timeout` for `token`. Returns whether it arrived.
    pub fn wait(&self, token: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        loop {
            if state.take_seen(token) {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                state.abandon(token);
                return false;
            }
            match self.signal.wait_timeout(state, left) {
                Ok((guard, _)) => state = guard,
                Err(_) => return false,
            }
        }
    }

    #[cfg(test)]
    fn held(&self) -> (usize, usize) {
        self.state
            .lock()
            .map(|state| (state.seen.len(), state.abandoned.len()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn wait_returns_once_token_is_seen() {
        let monitor = Arc::new(DrainMonitor::new());
        let notifier = Arc::clone(&monitor);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            notifier.notify("t1");
        });
        assert!(monitor.wait("t1", Duration::from_secs(2)));
        handle.join().expect("notifier");
        assert!(!monitor.wait("t1", Duration::from_millis(10)), "tokens are consumed");
    }

    #[test]
    fn wait_gives_up_after_timeout() {
        let monitor = DrainMonitor::new();
        monitor.notify("other");
        assert!(!monitor.wait("mine", Duration::from_millis(20)));
    }

    #[test]
    fn late_marker_is_dropped() {
        let monitor = DrainMonitor::new();
        assert!(!monitor.wait("late", Duration::ZERO));
        assert_eq!(monitor.held(), (0, 1));

        monitor.notify("late");

        assert_eq!(monitor.held(), (0, 0));
        assert!(!monitor.wait("late", Duration::ZERO), "late marker is not kept");
    }

    #[test]
    fn unclaimed_markers_are_bounded() {
        let monitor = DrainMonitor::new();
        for index in 0..DRAIN_BACKLOG * 3 {
            monitor.notify(&format!("stray-{index}"));
            assert!(!monitor.wait(&format!("lost-{index}"), Duration::ZERO));
        }

        assert_eq!(monitor.held(), (DRAIN_BACKLOG, DRAIN_BACKLOG));
        let newest = format!("stray-{}", DRAIN_BACKLOG * 3 - 1);
        assert!(monitor.wait(&newest, Duration::ZERO));
        assert!(!monitor.wait("stray-0", Duration::ZERO), "oldest marker was evicted");
    }
}
