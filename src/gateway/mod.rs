//! SSH command-authorization gateway.
//!
//! Deployed on backed-up hosts as an `authorized_keys` forced command, the
//! gateway inspects the command line the backup server asked for (delivered
//! through `SSH_ORIGINAL_COMMAND`, a trust boundary it never bypasses) and
//! either executes it exactly as received or rejects the session. It
//! deliberately has no cluster or job dependencies: its one decision is a
//! security property, and it goes from `Received` straight to a terminal
//! `Authorized` or `Rejected`.

use std::process::Command;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};

pub mod policy;

pub use policy::{AuthPolicy, PgsqlPolicy, PolicyOptions, RsyncPolicy};

/// Environment variable carrying the original command line.
pub const ORIGINAL_COMMAND_ENV: &str = "SSH_ORIGINAL_COMMAND";

/// Default path of the gateway policy file.
pub const DEFAULT_POLICY_CONFIG: &str = "/etc/packrat-gateway.yaml";

/// Terminal outcome of one authorization decision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    /// The command may be executed exactly as received.
    Authorized,
    /// The command must not be executed.
    Rejected {
        /// Why the command was refused.
        reason: String,
    },
}

/// Errors raised by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Raised when the policy refuses the command; nothing was executed.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Why the command was refused.
        reason: String,
    },
    /// Raised when no command line was supplied at all.
    #[error("no command provided in {ORIGINAL_COMMAND_ENV}")]
    NoCommand,
    /// Raised when the policy file cannot be loaded.
    #[error("failed to load gateway policy {path}: {message}")]
    Policy {
        /// Policy file path.
        path: String,
        /// Read or parse error message.
        message: String,
    },
    /// Raised when the policy file names an unknown plugin.
    #[error("unknown gateway policy plugin \"{name}\"")]
    UnknownPolicy {
        /// Plugin name from the policy file.
        name: String,
    },
    /// Raised when an authorized command cannot be spawned.
    #[error("failed to execute authorized command: {message}")]
    Exec {
        /// Operating system error string.
        message: String,
    },
}

/// Gateway policy file: which policy plugin to use and its allow-lists.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    /// Policy plugin name (`rsync` or `pgsql`).
    pub plugin: String,
    /// Allow-lists handed to the policy.
    #[serde(default)]
    pub options: PolicyOptions,
}

impl GatewayConfig {
    /// Loads the policy file, read-only for the lifetime of one decision.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Policy`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, GatewayError> {
        let text = crate::config::read_file(path).map_err(|err| GatewayError::Policy {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|err| GatewayError::Policy {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Builds the configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownPolicy`] for plugin names other than
    /// the built-in two.
    pub fn build_policy(self) -> Result<Box<dyn AuthPolicy>, GatewayError> {
        match self.plugin.as_str() {
            "rsync" => Ok(Box::new(RsyncPolicy::new(self.options))),
            "pgsql" => Ok(Box::new(PgsqlPolicy::new(self.options))),
            other => Err(GatewayError::UnknownPolicy {
                name: other.to_owned(),
            }),
        }
    }
}

/// Runs the authorization state machine over one received command line.
///
/// On `Authorized` the command executes with inherited stdio (rsync server
/// sessions speak over stdin/stdout) and its exit code is returned. On
/// `Rejected` nothing is executed, ever; there is no partial authorization
/// state to clean up.
///
/// # Errors
///
/// Returns [`GatewayError::Unauthorized`] on rejection,
/// [`GatewayError::NoCommand`] for an empty line, and
/// [`GatewayError::Exec`] when the authorized command cannot be spawned.
pub fn authorize_and_run(policy: &dyn AuthPolicy, cmd_line: &str) -> Result<i32, GatewayError> {
    match policy.evaluate(cmd_line) {
        Decision::Rejected { reason } => {
            error!(command = cmd_line, %reason, "rejected command");
            Err(GatewayError::Unauthorized { reason })
        }
        Decision::Authorized => execute(cmd_line),
    }
}

/// Executes the authorized command line exactly as received.
///
/// The split is the same naive whitespace split the policy used; no
/// re-quoting or mutation happens between the decision and the execution,
/// so nothing can be injected after authorization.
fn execute(cmd_line: &str) -> Result<i32, GatewayError> {
    let tokens: Vec<&str> = cmd_line.split_whitespace().collect();
    let (program, args) = tokens.split_first().ok_or(GatewayError::NoCommand)?;

    info!(command = cmd_line, "running authorized command");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|err| GatewayError::Exec {
            message: err.to_string(),
        })?;
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn script_policy(scripts: &[&str]) -> RsyncPolicy {
        RsyncPolicy::new(PolicyOptions {
            allowed_scripts: scripts.iter().map(|s| (*s).to_owned()).collect(),
            allowed_paths: Vec::new(),
        })
    }

    #[test]
    fn authorized_command_runs_and_propagates_exit_zero() {
        let policy = script_policy(&["true"]);
        let code = authorize_and_run(&policy, "true").expect("true should run");
        assert_eq!(code, 0);
    }

    #[test]
    fn authorized_command_propagates_nonzero_exit() {
        let policy = script_policy(&["false"]);
        let code = authorize_and_run(&policy, "false").expect("false should run");
        assert_eq!(code, 1);
    }

    #[test]
    fn rejected_command_is_never_executed() {
        let tmp = TempDir::new().expect("tempdir");
        let marker = tmp.path().join("executed");
        let marker_str = marker.to_str().expect("utf8 marker path");
        let policy = script_policy(&[]);

        let err = authorize_and_run(&policy, &format!("touch {marker_str}"))
            .expect_err("unlisted command must be rejected");

        assert!(matches!(err, GatewayError::Unauthorized { .. }), "got {err:?}");
        assert!(!marker.exists(), "rejected command must not run");
    }

    #[test]
    fn config_loads_and_builds_the_named_policy() {
        let tmp = TempDir::new().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("gateway.yaml"))
            .expect("temp path should be utf8");
        std::fs::write(
            path.as_std_path(),
            "plugin: rsync\noptions:\n  allowed_paths: [/opt/data]\n",
        )
        .expect("write policy file");

        let config = GatewayConfig::load(&path).expect("policy file should load");
        assert_eq!(config.plugin, "rsync");
        let policy = config.build_policy().expect("policy should build");
        assert_eq!(
            policy.evaluate("rsync --server --sender . /opt/data"),
            Decision::Authorized
        );
    }

    #[test]
    fn unknown_policy_plugin_is_rejected() {
        let config = GatewayConfig {
            plugin: String::from("telnet"),
            options: PolicyOptions::default(),
        };
        let Err(err) = config.build_policy() else {
            panic!("unknown plugin must fail");
        };
        assert!(matches!(err, GatewayError::UnknownPolicy { .. }), "got {err:?}");
    }

    #[test]
    fn missing_policy_file_is_a_policy_error() {
        let err = GatewayConfig::load(Utf8Path::new("/nonexistent/packrat-gateway.yaml"))
            .expect_err("missing file must fail");
        assert!(matches!(err, GatewayError::Policy { .. }), "got {err:?}");
    }
}
