//! Process execution seam shared by transfer, snapshot, and script runners.
//!
//! Everything in packrat that shells out (`rsync`, `ssh`, `zfs`) goes through
//! the [`CommandRunner`] trait so tests can substitute a scripted fake. The
//! real implementation supports an optional deadline: remote scripts run with
//! a per-script timeout while bulk transfers run unbounded.

use std::ffi::OsString;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often the runner polls a child process while a deadline is armed.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages (`unknown` when the process
    /// died without one).
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors surfaced while spawning or waiting on external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// Raised when a command cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exceeds its deadline and is killed.
    #[error("{program} did not finish within {timeout_secs}s")]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Deadline that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// Raised when the runner cannot collect the command's output streams.
    #[error("failed to read output of {program}: {message}")]
    Output {
        /// Command whose output could not be read.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
///
/// Implementations must be shareable across worker threads because jobs may
/// run their per-host workflows concurrently.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// A `timeout` of `None` waits indefinitely. When a deadline is given and
    /// elapses, the child is killed and [`ExecError::Timeout`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] if the command cannot be started,
    /// [`ExecError::Timeout`] when the deadline elapses, and
    /// [`ExecError::Output`] when the output streams cannot be collected.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        match timeout {
            None => run_unbounded(program, args),
            Some(deadline) => run_with_deadline(program, args, deadline),
        }
    }
}

fn run_unbounded(program: &str, args: &[OsString]) -> Result<CommandOutput, ExecError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| ExecError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Spawns the child with piped output, drains both streams on helper threads,
/// and polls `try_wait` until completion or the deadline, killing on expiry.
///
/// The streams must be drained concurrently with the wait loop: a child that
/// fills a pipe while nobody reads it would block forever and turn every
/// deadline into a kill.
fn run_with_deadline(
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ExecError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        })?;

    let stdout_reader = spawn_stream_reader(child.stdout.take());
    let stderr_reader = spawn_stream_reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                return Err(ExecError::Output {
                    program: program.to_owned(),
                    message: err.to_string(),
                });
            }
        }
        if Instant::now() >= deadline {
            kill_child(&mut child);
            return Err(ExecError::Timeout {
                program: program.to_owned(),
                timeout_secs: timeout.as_secs(),
            });
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: join_stream_reader(stdout_reader),
        stderr: join_stream_reader(stderr_reader),
    })
}

fn spawn_stream_reader<S>(stream: Option<S>) -> Option<thread::JoinHandle<String>>
where
    S: Read + Send + 'static,
{
    stream.map(|mut source| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            match source.read_to_end(&mut buffer) {
                Ok(_) => String::from_utf8_lossy(&buffer).into_owned(),
                Err(_) => String::new(),
            }
        })
    })
}

fn join_stream_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

fn kill_child(child: &mut Child) {
    child.kill().ok();
    // Reap the zombie; the exit status itself is irrelevant after a kill.
    child.wait().ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_captures_stdout_and_exit_code() {
        let runner = ProcessCommandRunner;
        let output = runner
            .run("sh", &[OsString::from("-c"), OsString::from("echo hi")], None)
            .expect("echo should run");

        assert!(output.is_success());
        assert_eq!(output.stdout, "hi\n");
    }

    #[test]
    fn run_reports_nonzero_exit() {
        let runner = ProcessCommandRunner;
        let output = runner
            .run("sh", &[OsString::from("-c"), OsString::from("exit 3")], None)
            .expect("sh should run");

        assert!(!output.is_success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.status_text(), "3");
    }

    #[test]
    fn run_rejects_missing_program() {
        let runner = ProcessCommandRunner;
        let err = runner
            .run("packrat-test-definitely-missing", &[], None)
            .expect_err("missing binary should not spawn");

        assert!(matches!(err, ExecError::Spawn { .. }), "got {err:?}");
    }

    #[test]
    fn run_kills_process_on_deadline() {
        let runner = ProcessCommandRunner;
        let err = runner
            .run(
                "sh",
                &[OsString::from("-c"), OsString::from("sleep 30")],
                Some(Duration::from_millis(200)),
            )
            .expect_err("sleep should be killed");

        assert!(matches!(err, ExecError::Timeout { .. }), "got {err:?}");
    }

    #[test]
    fn run_with_deadline_still_captures_output() {
        let runner = ProcessCommandRunner;
        let output = runner
            .run(
                "sh",
                &[OsString::from("-c"), OsString::from("echo out; echo err >&2")],
                Some(Duration::from_secs(10)),
            )
            .expect("sh should finish well before the deadline");

        assert!(output.is_success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }
}
