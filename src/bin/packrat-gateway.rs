//! Remote-side SSH authorization gateway.
//!
//! Installed on backed-up hosts as the forced command of the backup
//! server's SSH key. It reads the command the server asked for from
//! `SSH_ORIGINAL_COMMAND`, consults the local policy file, and either
//! executes the command verbatim (propagating its exit code) or exits with
//! [`REJECTED_EXIT_CODE`] without executing anything. Logs go to stderr:
//! stdout belongs to the rsync protocol.

use std::env;
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use tracing::error;

use packrat::gateway::{
    DEFAULT_POLICY_CONFIG, GatewayConfig, GatewayError, ORIGINAL_COMMAND_ENV, authorize_and_run,
};

/// Exit code used when the command was rejected (never executed).
///
/// Deliberately outside the range well-behaved commands use, so the backup
/// server can tell "denied" apart from "ran and failed".
const REJECTED_EXIT_CODE: i32 = 125;

/// CLI for the gateway binary.
#[derive(Debug, Parser)]
#[command(
    name = "packrat-gateway",
    about = "Restrict what the backup server may execute on this host"
)]
struct Cli {
    /// Path to the policy file.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_POLICY_CONFIG)]
    policy: Utf8PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match run(&cli) {
        Ok(code) => code,
        Err(err @ GatewayError::Unauthorized { .. }) => {
            error!("{err}");
            REJECTED_EXIT_CODE
        }
        Err(err) => {
            error!("{err}");
            1
        }
    };
    process::exit(exit_code);
}

fn run(cli: &Cli) -> Result<i32, GatewayError> {
    let cmd_line = env::var(ORIGINAL_COMMAND_ENV).unwrap_or_default();
    let config = GatewayConfig::load(&cli.policy)?;
    let policy = config.build_policy()?;
    authorize_and_run(policy.as_ref(), &cmd_line)
}
