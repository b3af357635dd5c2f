//! Entry point of the `trellis` binary.
//!
//! Delegates to [`trellis_cli::run`], which loads configuration, installs
//! telemetry, loads the installed apps and dispatches the command line.

use std::io;
use std::process::ExitCode;

use trellis_cli::Console;

fn main() -> ExitCode {
    let mut stderr = io::stderr().lock();
    trellis_cli::run(std::env::args_os(), Console::new(io::stdout()), &mut stderr)
}
