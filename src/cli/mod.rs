//! Command-line interface definitions for the `packrat` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page. It must stay self-contained (clap and std only) for the build
//! script include to work.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `packrat` binary.
#[derive(Debug, Parser)]
#[command(
    name = "packrat",
    about = "Orchestrate periodic cluster backups over rsync, PostgreSQL WAL shipping, and Vault snapshots",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Path to the global configuration file.
    #[arg(long, short = 'c', value_name = "PATH", default_value = "/etc/packrat.yaml")]
    pub(crate) config: String,
    /// Directory holding one YAML file per cluster.
    #[arg(long, value_name = "DIR", default_value = "/etc/packrat.d")]
    pub(crate) cluster_dir: String,
    /// Enable debug logging.
    #[arg(long, short = 'v')]
    pub(crate) verbose: bool,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Subcommands of the `packrat` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Create a backup for a configured cluster.
    #[command(name = "backup")]
    Backup(ClusterArg),
    /// Pull incremental data to shrink the next backup.
    #[command(name = "stream")]
    Stream(ClusterArg),
    /// Restore a cluster to a given snapshot.
    #[command(name = "restore")]
    Restore(RestoreArgs),
    /// Report backup health in a monitoring-friendly format.
    #[command(name = "check")]
    Check(CheckArgs),
}

/// Positional cluster name shared by backup and stream.
#[derive(Debug, Parser)]
pub(crate) struct ClusterArg {
    /// Name of the configured cluster.
    pub(crate) name: String,
}

/// Arguments for the `packrat restore` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RestoreArgs {
    /// Name of the configured cluster.
    pub(crate) name: String,
    /// Snapshot to restore.
    pub(crate) snapshot: String,
}

/// Arguments for the `packrat check` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckArgs {
    /// Clusters to check; defaults to every parseable cluster drop-in.
    pub(crate) clusters: Vec<String>,
    /// Age in days after which a report counts as unknown.
    #[arg(long, short = 'd', value_name = "DAYS", default_value_t = 1)]
    pub(crate) days: u64,
    /// Override the report directory.
    #[arg(long, value_name = "DIR")]
    pub(crate) report_dir: Option<String>,
}
