//! Binary entry point for the packrat CLI.

use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::{error, info};

use packrat::{
    Cluster, ClusterError, ConfigError, DEFAULT_REPORT_DIR, GlobalConfig, PluginRegistry,
    ReportStore, Settings, check_clusters,
};

mod cli;

use cli::{CheckArgs, Cli, CliCommand, ClusterArg, RestoreArgs};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let exit_code = match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: &Cli) -> Result<i32, CliError> {
    let global_path = Utf8PathBuf::from(&cli.config);
    let cluster_dir = Utf8PathBuf::from(&cli.cluster_dir);

    match &cli.command {
        CliCommand::Backup(args) => run_backup(args, &global_path, &cluster_dir),
        CliCommand::Stream(args) => run_stream(args, &global_path, &cluster_dir),
        CliCommand::Restore(args) => run_restore(args, &global_path, &cluster_dir),
        CliCommand::Check(args) => run_check(args, &global_path, &cluster_dir),
    }
}

fn load_cluster(
    name: &str,
    global_path: &Utf8PathBuf,
    cluster_dir: &Utf8PathBuf,
) -> Result<Cluster, CliError> {
    let settings = Settings::load(name, global_path, cluster_dir)?;
    let registry = PluginRegistry::builtin();
    Ok(Cluster::from_settings(&settings, &registry)?)
}

fn run_backup(
    args: &ClusterArg,
    global_path: &Utf8PathBuf,
    cluster_dir: &Utf8PathBuf,
) -> Result<i32, CliError> {
    let cluster = load_cluster(&args.name, global_path, cluster_dir)?;
    let report = cluster.backup()?;
    info!(cluster = %args.name, status = %report.status, "backup report written");
    Ok(0)
}

fn run_stream(
    args: &ClusterArg,
    global_path: &Utf8PathBuf,
    cluster_dir: &Utf8PathBuf,
) -> Result<i32, CliError> {
    let cluster = load_cluster(&args.name, global_path, cluster_dir)?;
    let outcomes = cluster.stream()?;
    for outcome in &outcomes {
        info!(slot = %outcome.slot, status = %outcome.status, "stream outcome");
    }
    Ok(0)
}

fn run_restore(
    args: &RestoreArgs,
    global_path: &Utf8PathBuf,
    cluster_dir: &Utf8PathBuf,
) -> Result<i32, CliError> {
    let cluster = load_cluster(&args.name, global_path, cluster_dir)?;
    cluster.restore(&args.snapshot)?;
    info!(cluster = %args.name, snapshot = %args.snapshot, "restore finished");
    Ok(0)
}

fn run_check(
    args: &CheckArgs,
    global_path: &Utf8PathBuf,
    cluster_dir: &Utf8PathBuf,
) -> Result<i32, CliError> {
    let global = GlobalConfig::load(global_path)?;
    let report_dir = args
        .report_dir
        .as_ref()
        .map(Utf8PathBuf::from)
        .or_else(|| global.report_dir.clone())
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_REPORT_DIR));
    let store = ReportStore::new(report_dir);

    let clusters = if args.clusters.is_empty() {
        Settings::list(cluster_dir)?
            .into_iter()
            .filter(|entry| entry.error.is_none())
            .map(|entry| entry.name)
            .collect()
    } else {
        args.clusters.clone()
    };

    let outcome = check_clusters(&store, &clusters, args.days);
    println!("{}", outcome.summary);
    for line in &outcome.lines {
        println!("{line}");
    }
    Ok(outcome.severity.exit_code())
}
