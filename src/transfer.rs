//! Transfer and remote-script executors used by jobs and backends.
//!
//! These are the two external collaborators the orchestration core shells
//! out to: `rsync` for moving data into slots (remotely sourced or local,
//! as for hardlink snapshots) and `ssh` for running pre/post scripts on
//! backed-up hosts. Argument vectors are built here so jobs never
//! concatenate command lines themselves.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tracing::debug;

use crate::exec::{CommandRunner, ExecError};

/// Default path to the `rsync` executable.
pub const DEFAULT_RSYNC_BIN: &str = "rsync";

/// Default path to the `ssh` executable.
pub const DEFAULT_SSH_BIN: &str = "ssh";

/// Default remote user for transfers and scripts.
pub const DEFAULT_REMOTE_USER: &str = "root";

/// Baseline rsync option set: archive mode, relative paths, preserve ACLs,
/// numeric uid/gid mapping.
pub const DEFAULT_RSYNC_OPTIONS: &[&str] = &["-a", "-R", "-A", "--numeric-ids"];

/// Default deadline for one remote script invocation.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// One rsync invocation: where the data comes from and where it lands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferRequest<'a> {
    /// Path to copy, on the source host when one is given.
    pub source: &'a Utf8Path,
    /// Destination directory (always local).
    pub destination: &'a Utf8Path,
    /// Remote host to pull from; `None` performs a local copy.
    pub source_host: Option<&'a str>,
    /// Remote user owning the SSH session.
    pub user: &'a str,
    /// Identity file handed to the SSH transport.
    pub private_key: Option<&'a Utf8Path>,
    /// rsync options placed before filters.
    pub options: &'a [String],
    /// `--include` filter patterns, in order.
    pub includes: &'a [String],
    /// `--exclude` filter patterns, in order.
    pub excludes: &'a [String],
}

/// One remote script invocation over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptRequest<'a> {
    /// Host the script runs on.
    pub host: &'a str,
    /// Remote user owning the SSH session.
    pub user: &'a str,
    /// Identity file handed to the SSH client.
    pub private_key: Option<&'a Utf8Path>,
    /// Command line executed remotely, passed as a single argument.
    pub command: &'a str,
    /// Deadline for the script; expiry kills the SSH client.
    pub timeout: Duration,
}

/// Errors raised by the transfer executor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when rsync exits non-zero.
    #[error("rsync of {path} from {origin} exited {status_text}: {stderr}")]
    Failed {
        /// Path that was being transferred.
        path: String,
        /// Source host, or `local` for local copies.
        origin: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from rsync.
        stderr: String,
    },
    /// Raised when rsync cannot be spawned or waited on.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Errors raised by the remote script executor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// Raised when the script exits non-zero on the remote host.
    #[error("script `{command}` on {host} exited {status_text}: {stderr}")]
    Failed {
        /// Host the script ran on.
        host: String,
        /// Command line that failed.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Stderr captured from the SSH client.
        stderr: String,
    },
    /// Raised when the script's deadline elapses.
    #[error("script `{command}` on {host} timed out after {timeout_secs}s")]
    Timeout {
        /// Host the script ran on.
        host: String,
        /// Command line that was killed.
        command: String,
        /// Deadline that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// Raised when the SSH client cannot be spawned.
    #[error(transparent)]
    Exec(ExecError),
}

/// Runs rsync transfers and remote scripts through a [`CommandRunner`].
#[derive(Clone, Debug)]
pub struct TransferExecutor<R: CommandRunner> {
    rsync_bin: String,
    ssh_bin: String,
    runner: R,
}

impl<R: CommandRunner> TransferExecutor<R> {
    /// Creates an executor using the default binary names.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            rsync_bin: String::from(DEFAULT_RSYNC_BIN),
            ssh_bin: String::from(DEFAULT_SSH_BIN),
            runner,
        }
    }

    /// Overrides the rsync and ssh binary paths.
    #[must_use]
    pub fn with_binaries(mut self, rsync_bin: impl Into<String>, ssh_bin: impl Into<String>) -> Self {
        self.rsync_bin = rsync_bin.into();
        self.ssh_bin = ssh_bin.into();
        self
    }

    /// Runs one rsync transfer.
    ///
    /// Transfers run without a deadline: only lock acquisition and remote
    /// scripts are bounded, a long transfer is allowed to take its time.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Failed`] on a non-zero rsync exit and
    /// [`TransferError::Exec`] when rsync cannot be run at all.
    pub fn transfer(&self, request: &TransferRequest<'_>) -> Result<(), TransferError> {
        let args = build_rsync_args(request);
        debug!(rsync = %self.rsync_bin, ?args, "running transfer");
        let output = self.runner.run(&self.rsync_bin, &args, None)?;
        if output.is_success() {
            return Ok(());
        }

        Err(TransferError::Failed {
            path: request.source.to_string(),
            origin: request
                .source_host
                .map_or_else(|| String::from("local"), ToOwned::to_owned),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }

    /// Runs one script on a remote host with its deadline armed.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Failed`] on a non-zero remote exit,
    /// [`ScriptError::Timeout`] when the deadline elapses, and
    /// [`ScriptError::Exec`] when the SSH client cannot be spawned.
    pub fn run_script(&self, request: &ScriptRequest<'_>) -> Result<(), ScriptError> {
        let args = build_ssh_args(request);
        debug!(host = request.host, command = request.command, "running remote script");
        let output = self
            .runner
            .run(&self.ssh_bin, &args, Some(request.timeout))
            .map_err(|err| match err {
                ExecError::Timeout { .. } => ScriptError::Timeout {
                    host: request.host.to_owned(),
                    command: request.command.to_owned(),
                    timeout_secs: request.timeout.as_secs(),
                },
                other => ScriptError::Exec(other),
            })?;
        if output.is_success() {
            return Ok(());
        }

        Err(ScriptError::Failed {
            host: request.host.to_owned(),
            command: request.command.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }
}

/// Builds the sanitized rsync argument vector for a transfer.
///
/// Sources and destinations get a trailing slash so rsync syncs directory
/// contents rather than nesting the directory one level deeper on repeat
/// runs.
fn build_rsync_args(request: &TransferRequest<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = request
        .options
        .iter()
        .map(OsString::from)
        .collect();

    for include in request.includes {
        args.push(OsString::from("--include"));
        args.push(OsString::from(include));
    }
    for exclude in request.excludes {
        args.push(OsString::from("--exclude"));
        args.push(OsString::from(exclude));
    }
    if let Some(key) = request.private_key {
        args.push(OsString::from("--rsh"));
        args.push(OsString::from(format!("ssh -i {key}")));
    }

    let source = request.source_host.map_or_else(
        || format!("{}/", request.source),
        |host| format!("{}@{}:{}/", request.user, host, request.source),
    );
    args.push(OsString::from(source));
    args.push(OsString::from(format!("{}/", request.destination)));
    args
}

/// Builds the ssh argument vector for one remote script.
///
/// The command is passed as a single trailing argument, exactly as
/// configured; quoting is the operator's responsibility.
fn build_ssh_args(request: &ScriptRequest<'_>) -> Vec<OsString> {
    let mut args = vec![OsString::from("-l"), OsString::from(request.user)];
    if let Some(key) = request.private_key {
        args.push(OsString::from("-i"));
        args.push(OsString::from(key));
    }
    args.push(OsString::from(request.host));
    args.push(OsString::from(request.command));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;

    fn string_vec(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[test]
    fn transfer_builds_remote_pull_arguments() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let executor = TransferExecutor::new(runner.clone());
        let key = Utf8PathBuf::from("/etc/packrat/backup.key");
        let options = string_vec(&["-a", "-R", "-A", "--numeric-ids"]);
        let excludes = string_vec(&["/var/log/audit*"]);

        executor
            .transfer(&TransferRequest {
                source: Utf8Path::new("/var/log"),
                destination: Utf8Path::new("/backup/slots/host01"),
                source_host: Some("host01.example.com"),
                user: DEFAULT_REMOTE_USER,
                private_key: Some(&key),
                options: &options,
                includes: &[],
                excludes: &excludes,
            })
            .expect("transfer should succeed");

        let commands = runner.commands();
        assert_eq!(
            commands,
            vec![String::from(
                "rsync -a -R -A --numeric-ids --exclude /var/log/audit* \
                 --rsh ssh -i /etc/packrat/backup.key \
                 root@host01.example.com:/var/log/ /backup/slots/host01/"
            )]
        );
    }

    #[test]
    fn transfer_supports_local_copies() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let executor = TransferExecutor::new(runner.clone());
        let options = string_vec(&["-a", "--link-dest", "/backup/slots/host01"]);

        executor
            .transfer(&TransferRequest {
                source: Utf8Path::new("/backup/slots/host01"),
                destination: Utf8Path::new("/backup/snapshots/host01-2026-01-01T00:00:00"),
                source_host: None,
                user: DEFAULT_REMOTE_USER,
                private_key: None,
                options: &options,
                includes: &[],
                excludes: &[],
            })
            .expect("local transfer should succeed");

        let invocation = runner.invocations().into_iter().next().expect("one call");
        let args = invocation.command_string();
        assert!(
            args.ends_with("/backup/slots/host01/ /backup/snapshots/host01-2026-01-01T00:00:00/"),
            "unexpected args: {args}"
        );
        assert!(!args.contains('@'), "local copy must not address a host");
    }

    #[test]
    fn transfer_failure_carries_host_and_status() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(23), "", "permission denied");
        let executor = TransferExecutor::new(runner);
        let options = string_vec(&["-a"]);

        let err = executor
            .transfer(&TransferRequest {
                source: Utf8Path::new("/var/log"),
                destination: Utf8Path::new("/backup/slots/host01"),
                source_host: Some("host01"),
                user: DEFAULT_REMOTE_USER,
                private_key: None,
                options: &options,
                includes: &[],
                excludes: &[],
            })
            .expect_err("non-zero rsync should fail");

        let TransferError::Failed {
            origin,
            status_text,
            stderr,
            ..
        } = err
        else {
            panic!("expected TransferError::Failed");
        };
        assert_eq!(origin, "host01");
        assert_eq!(status_text, "23");
        assert_eq!(stderr, "permission denied");
    }

    #[test]
    fn run_script_passes_user_key_host_and_command() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let executor = TransferExecutor::new(runner.clone());
        let key = Utf8PathBuf::from("/etc/packrat/backup.key");

        executor
            .run_script(&ScriptRequest {
                host: "host01",
                user: "root",
                private_key: Some(&key),
                command: "/usr/local/bin/my_custom_script arg1",
                timeout: DEFAULT_SCRIPT_TIMEOUT,
            })
            .expect("script should succeed");

        let invocation = runner.invocations().into_iter().next().expect("one call");
        assert_eq!(invocation.program, "ssh");
        assert_eq!(
            invocation.command_string(),
            "ssh -l root -i /etc/packrat/backup.key host01 /usr/local/bin/my_custom_script arg1"
        );
        assert_eq!(invocation.timeout, Some(DEFAULT_SCRIPT_TIMEOUT));
    }

    #[test]
    fn run_script_maps_deadline_expiry_to_timeout_error() {
        #[derive(Clone, Debug)]
        struct AlwaysTimesOut;
        impl CommandRunner for AlwaysTimesOut {
            fn run(
                &self,
                program: &str,
                _args: &[OsString],
                timeout: Option<Duration>,
            ) -> Result<crate::exec::CommandOutput, ExecError> {
                Err(ExecError::Timeout {
                    program: program.to_owned(),
                    timeout_secs: timeout.map_or(0, |t| t.as_secs()),
                })
            }
        }

        let executor = TransferExecutor::new(AlwaysTimesOut);
        let err = executor
            .run_script(&ScriptRequest {
                host: "host01",
                user: "root",
                private_key: None,
                command: "sleep 600",
                timeout: Duration::from_secs(5),
            })
            .expect_err("deadline should expire");

        assert!(matches!(err, ScriptError::Timeout { .. }), "got {err:?}");
    }
}
