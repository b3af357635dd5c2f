//! Shared handle on the stream command output goes to.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Cloneable writer for command output.
///
/// Built-in commands are stored in the command tree and outlive any borrowed
/// stream, so they write through this handle. `writeln!(console, ..)` works
/// on a shared reference and flushes after every write.
#[derive(Clone)]
pub struct Console(Arc<Mutex<dyn Write + Send>>);

impl Console {
    /// Wraps `writer`.
    #[must_use]
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    /// Writes formatted text and flushes.
    ///
    /// # Errors
    ///
    /// Returns the underlying write failure.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> io::Result<()> {
        let mut writer = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_fmt(args)?;
        writer.flush()
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}
