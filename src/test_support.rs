//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::exec::{CommandOutput, CommandRunner, ExecError};

/// Scripted command runner driving deterministic outcomes without spawning
/// processes.
///
/// Responses are resolved in two stages: substring rules win over the FIFO
/// queue, and when at least one rule is configured any unmatched command
/// succeeds silently. This keeps multi-host scenarios readable: a test
/// states only the commands it wants to fail.
///
/// The runner is `Send + Sync` (clones share state) so it can stand in for
/// the process runner under the parallel run style.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptedState>>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    queue: VecDeque<CommandOutput>,
    rules: Vec<ResponseRule>,
    invocations: Vec<CommandInvocation>,
}

#[derive(Debug)]
struct ResponseRule {
    needle: String,
    output: CommandOutput,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Deadline the caller armed, if any.
    pub timeout: Option<Duration>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses or rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned by another test thread.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state.lock().expect("runner state").invocations.clone()
    }

    /// Returns the recorded invocations rendered as command strings.
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned by another test thread.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("runner state")
            .invocations
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status onto the FIFO queue.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with canned stderr onto the FIFO queue.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response onto the FIFO queue.
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned by another test thread.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.state
            .lock()
            .expect("runner state")
            .queue
            .push_back(CommandOutput {
                code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            });
    }

    /// Makes every command whose rendered string contains `needle` fail.
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned by another test thread.
    pub fn fail_matching(&self, needle: impl Into<String>, code: i32) {
        self.state
            .lock()
            .expect("runner state")
            .rules
            .push(ResponseRule {
                needle: needle.into(),
                output: CommandOutput {
                    code: Some(code),
                    stdout: String::new(),
                    stderr: String::from("simulated failure"),
                },
            });
    }

    /// Makes every matching command succeed with the given stdout.
    ///
    /// # Panics
    ///
    /// Panics when the internal mutex is poisoned by another test thread.
    pub fn respond_matching(&self, needle: impl Into<String>, stdout: impl Into<String>) {
        self.state
            .lock()
            .expect("runner state")
            .rules
            .push(ResponseRule {
                needle: needle.into(),
                output: CommandOutput {
                    code: Some(0),
                    stdout: stdout.into(),
                    stderr: String::new(),
                },
            });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ExecError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            timeout,
        };
        let rendered = invocation.command_string();

        let mut state = self.state.lock().map_err(|_| ExecError::Spawn {
            program: program.to_owned(),
            message: String::from("scripted runner state poisoned"),
        })?;
        state.invocations.push(invocation);

        if let Some(rule) = state
            .rules
            .iter()
            .find(|rule| rendered.contains(&rule.needle))
        {
            return Ok(rule.output.clone());
        }
        if let Some(queued) = state.queue.pop_front() {
            return Ok(queued);
        }
        if state.rules.is_empty() {
            return Err(ExecError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        }
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
