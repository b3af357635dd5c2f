//! Running external tools under a call context.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8Path;
use tracing::debug;

use super::PIPELINE_TARGET;
use crate::context::CallContext;
use crate::error::ToolError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured output of a successful tool run.
#[derive(Debug, Default)]
pub(crate) struct ToolOutput {
    pub(crate) stdout: Vec<u8>,
}

/// Locates `program` on `PATH`.
pub(crate) fn locate(program: &str) -> Result<std::path::PathBuf, ToolError> {
    which::which(program).map_err(|error| ToolError::NotFound {
        program: program.to_owned(),
        message: error.to_string(),
    })
}

/// Runs `program args...` in `cwd`, killing it if `ctx` ends first.
pub(crate) fn run(
    program: &Path,
    args: &[&str],
    cwd: Option<&Utf8Path>,
    ctx: &CallContext,
) -> Result<ToolOutput, ToolError> {
    let rendered = render(program, args);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    debug!(target: PIPELINE_TARGET, command = %rendered, "running tool");
    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        command: rendered.clone(),
        source: Arc::new(source),
    })?;
    let stdout = collect(child.stdout.take());
    let stderr = collect(child.stderr.take());

    let status = loop {
        if let Err(interrupt) = ctx.check() {
            if let Err(error) = child.kill() {
                debug!(target: PIPELINE_TARGET, error = %error, "kill failed");
            }
            if let Err(error) = child.wait() {
                debug!(target: PIPELINE_TARGET, error = %error, "reap failed");
            }
            return Err(ToolError::Interrupted {
                command: rendered,
                reason: interrupt.to_string(),
            });
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                return Err(ToolError::Spawn {
                    command: rendered,
                    source: Arc::new(source),
                });
            }
        }
    };

    let stdout_bytes = join(stdout);
    let stderr_bytes = join(stderr);
    if !status.success() {
        return Err(ToolError::Failed {
            command: rendered,
            status: describe(status),
            stderr: String::from_utf8_lossy(&stderr_bytes).trim().to_owned(),
        });
    }
    Ok(ToolOutput {
        stdout: stdout_bytes,
    })
}

fn collect<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Err(error) = reader.read_to_end(&mut buffer) {
                debug!(target: PIPELINE_TARGET, error = %error, "tool output truncated");
            }
            buffer
        })
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

fn describe(status: ExitStatus) -> String {
    status.to_string()
}

fn render(program: &Path, args: &[&str]) -> String {
    let name = program
        .file_name()
        .map_or_else(|| program.display().to_string(), |n| n.to_string_lossy().into_owned());
    std::iter::once(name)
        .chain(args.iter().map(|arg| (*arg).to_owned()))
        .collect::<Vec<_>>()
        .join(" ")
}
