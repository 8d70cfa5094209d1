//! Core library for the packrat backup orchestrator.
//!
//! Packrat drives periodic backups of named clusters. Pluggable jobs (rsync
//! file sync, PostgreSQL WAL shipping, Vault snapshots) move the data,
//! pluggable backends (local filesystem, ZFS, an in-memory dummy) own the
//! per-host slots the data lands in, and the cluster orchestrator binds one
//! of each, merges per-slot outcomes, and persists a report per run. A
//! standalone SSH gateway authorizes the commands the backup server is
//! allowed to run on the hosts it backs up.

pub mod backend;
pub mod check;
pub mod cluster;
pub mod config;
pub mod exec;
pub mod gateway;
pub mod job;
pub mod outcome;
pub mod registry;
pub mod report;
pub mod test_support;
pub mod transfer;

pub use backend::{
    Backend, BackendError, DummyBackend, LocalFsBackend, SlotHandle, SlotLock, ZfsBackend,
};
pub use check::{CheckOutcome, Severity, check_clusters};
pub use cluster::{Cluster, ClusterError};
pub use config::{
    ConfigError, DEFAULT_CLUSTER_DIR, DEFAULT_GLOBAL_CONFIG, GlobalConfig, Settings,
};
pub use exec::{CommandOutput, CommandRunner, ExecError, ProcessCommandRunner};
pub use gateway::{
    AuthPolicy, DEFAULT_POLICY_CONFIG, Decision, GatewayConfig, GatewayError,
    ORIGINAL_COMMAND_ENV, authorize_and_run,
};
pub use job::{Job, JobError};
pub use outcome::{SlotOutcome, Status};
pub use registry::{PluginDescriptor, PluginError, PluginKind, PluginRegistry};
pub use report::{DEFAULT_REPORT_DIR, Report, ReportError, ReportStore};
pub use transfer::{TransferError, TransferExecutor};
