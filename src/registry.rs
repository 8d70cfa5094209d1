//! Plugin registry: resolves `(kind, name)` to a constructor.
//!
//! The registry is populated with the built-in jobs and backends at
//! construction; embedders can extend it with descriptor lists. Resolution
//! never falls back to a default: an unknown name, and likewise an attempt
//! to register over an existing one, is a fatal configuration error.
//!
//! Construction order is structural: the cluster builds its backend first
//! and hands it to the job factory. Jobs depend on backends, backends never
//! see jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_yaml::Mapping;
use thiserror::Error;
use tracing::debug;

use crate::backend::{
    Backend, DummyBackend, DummyOptions, LocalFsBackend, LocalFsOptions, ZfsBackend, ZfsOptions,
};
use crate::exec::ProcessCommandRunner;
use crate::job::Job;
use crate::job::pgsql::{PgsqlJob, PgsqlOptions};
use crate::job::rsync::{RsyncJob, RsyncOptions};
use crate::job::vault::{VaultJob, VaultOptions};

/// The two plugin roles the registry resolves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PluginKind {
    /// Transfer/backup strategies.
    Job,
    /// Storage providers.
    Backend,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Job => "job",
            Self::Backend => "backend",
        })
    }
}

/// Errors raised while resolving or constructing plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Raised when no plugin is registered under `(kind, name)`.
    #[error("could not find {kind} plugin \"{name}\"")]
    NotFound {
        /// Requested plugin kind.
        kind: PluginKind,
        /// Requested plugin name.
        name: String,
    },
    /// Raised when a registration would shadow an existing plugin.
    #[error("a {kind} plugin named \"{name}\" is already registered")]
    Duplicate {
        /// Plugin kind of the clashing registration.
        kind: PluginKind,
        /// Name of the clashing registration.
        name: String,
    },
    /// Raised when a plugin's options do not match its schema.
    #[error("invalid options for {kind} plugin \"{name}\": {message}")]
    Options {
        /// Plugin kind being constructed.
        kind: PluginKind,
        /// Plugin name being constructed.
        name: String,
        /// Deserializer error message.
        message: String,
    },
    /// Raised when a plugin constructor fails.
    #[error("failed to initialise {kind} plugin \"{name}\": {message}")]
    Init {
        /// Plugin kind being constructed.
        kind: PluginKind,
        /// Plugin name being constructed.
        name: String,
        /// Constructor error message.
        message: String,
    },
}

/// Inputs handed to a backend constructor.
#[derive(Clone, Debug)]
pub struct BackendContext<'a> {
    /// Cluster the backend will serve.
    pub cluster: &'a str,
    /// Merged backend options from the settings.
    pub options: &'a Mapping,
}

/// Inputs handed to a job constructor, including the already-built backend.
#[derive(Clone)]
pub struct JobContext<'a> {
    /// Cluster the job will serve.
    pub cluster: &'a str,
    /// Merged job options from the settings.
    pub options: &'a Mapping,
    /// Backend the job operates against.
    pub backend: Arc<dyn Backend>,
}

/// Constructor for a backend plugin.
pub type BackendFactory = fn(&BackendContext<'_>) -> Result<Arc<dyn Backend>, PluginError>;

/// Constructor for a job plugin.
pub type JobFactory = fn(&JobContext<'_>) -> Result<Box<dyn Job>, PluginError>;

/// External plugin registration: one name mapped to one factory.
#[derive(Clone, Debug)]
pub enum PluginDescriptor {
    /// Registers a job plugin.
    Job {
        /// Name resolved from configuration.
        name: &'static str,
        /// Constructor invoked with a [`JobContext`].
        factory: JobFactory,
    },
    /// Registers a backend plugin.
    Backend {
        /// Name resolved from configuration.
        name: &'static str,
        /// Constructor invoked with a [`BackendContext`].
        factory: BackendFactory,
    },
}

/// Maps plugin names to constructors, built-ins first.
#[derive(Clone, Debug, Default)]
pub struct PluginRegistry {
    jobs: BTreeMap<String, JobFactory>,
    backends: BTreeMap<String, BackendFactory>,
}

impl PluginRegistry {
    /// Creates a registry with no plugins at all; mainly for tests.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in jobs and backends.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.jobs.insert(String::from("rsync"), rsync_job as JobFactory);
        registry.jobs.insert(String::from("pgsql"), pgsql_job as JobFactory);
        registry.jobs.insert(String::from("vault"), vault_job as JobFactory);
        registry
            .backends
            .insert(String::from("dummy"), dummy_backend as BackendFactory);
        registry
            .backends
            .insert(String::from("localfs"), localfs_backend as BackendFactory);
        registry
            .backends
            .insert(String::from("zfs"), zfs_backend as BackendFactory);
        registry
    }

    /// Registers external plugins after the built-ins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Duplicate`] when a descriptor reuses a name
    /// that already resolves; the registry is left unchanged from that
    /// descriptor onwards.
    pub fn register(
        &mut self,
        descriptors: impl IntoIterator<Item = PluginDescriptor>,
    ) -> Result<(), PluginError> {
        for descriptor in descriptors {
            match descriptor {
                PluginDescriptor::Job { name, factory } => {
                    if self.jobs.contains_key(name) {
                        return Err(PluginError::Duplicate {
                            kind: PluginKind::Job,
                            name: name.to_owned(),
                        });
                    }
                    debug!(name, "registered job plugin");
                    self.jobs.insert(name.to_owned(), factory);
                }
                PluginDescriptor::Backend { name, factory } => {
                    if self.backends.contains_key(name) {
                        return Err(PluginError::Duplicate {
                            kind: PluginKind::Backend,
                            name: name.to_owned(),
                        });
                    }
                    debug!(name, "registered backend plugin");
                    self.backends.insert(name.to_owned(), factory);
                }
            }
        }
        Ok(())
    }

    /// Resolves a job constructor by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] when no job uses that name.
    pub fn job(&self, name: &str) -> Result<JobFactory, PluginError> {
        self.jobs
            .get(name)
            .copied()
            .ok_or_else(|| PluginError::NotFound {
                kind: PluginKind::Job,
                name: name.to_owned(),
            })
    }

    /// Resolves a backend constructor by name.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] when no backend uses that name.
    pub fn backend(&self, name: &str) -> Result<BackendFactory, PluginError> {
        self.backends
            .get(name)
            .copied()
            .ok_or_else(|| PluginError::NotFound {
                kind: PluginKind::Backend,
                name: name.to_owned(),
            })
    }
}

/// Deserializes a plugin's option mapping into its typed options.
fn decode_options<T: DeserializeOwned>(
    kind: PluginKind,
    name: &str,
    options: &Mapping,
) -> Result<T, PluginError> {
    serde_yaml::from_value(serde_yaml::Value::Mapping(options.clone())).map_err(|err| {
        PluginError::Options {
            kind,
            name: name.to_owned(),
            message: err.to_string(),
        }
    })
}

fn init_error(kind: PluginKind, name: &str, err: impl std::fmt::Display) -> PluginError {
    PluginError::Init {
        kind,
        name: name.to_owned(),
        message: err.to_string(),
    }
}

fn rsync_job(context: &JobContext<'_>) -> Result<Box<dyn Job>, PluginError> {
    let options: RsyncOptions = decode_options(PluginKind::Job, "rsync", context.options)?;
    let job = RsyncJob::new(options, Arc::clone(&context.backend), ProcessCommandRunner)
        .map_err(|err| init_error(PluginKind::Job, "rsync", err))?;
    Ok(Box::new(job))
}

fn pgsql_job(context: &JobContext<'_>) -> Result<Box<dyn Job>, PluginError> {
    let options: PgsqlOptions = decode_options(PluginKind::Job, "pgsql", context.options)?;
    let job = PgsqlJob::new(options, Arc::clone(&context.backend), ProcessCommandRunner)
        .map_err(|err| init_error(PluginKind::Job, "pgsql", err))?;
    Ok(Box::new(job))
}

fn vault_job(context: &JobContext<'_>) -> Result<Box<dyn Job>, PluginError> {
    let options: VaultOptions = decode_options(PluginKind::Job, "vault", context.options)?;
    let job = VaultJob::new(options, Arc::clone(&context.backend))
        .map_err(|err| init_error(PluginKind::Job, "vault", err))?;
    Ok(Box::new(job))
}

fn dummy_backend(context: &BackendContext<'_>) -> Result<Arc<dyn Backend>, PluginError> {
    let options: DummyOptions = decode_options(PluginKind::Backend, "dummy", context.options)?;
    let backend = DummyBackend::from_options(options)
        .map_err(|err| init_error(PluginKind::Backend, "dummy", err))?;
    Ok(Arc::new(backend))
}

fn localfs_backend(context: &BackendContext<'_>) -> Result<Arc<dyn Backend>, PluginError> {
    let options: LocalFsOptions = decode_options(PluginKind::Backend, "localfs", context.options)?;
    let backend = LocalFsBackend::new(context.cluster, options, ProcessCommandRunner)
        .map_err(|err| init_error(PluginKind::Backend, "localfs", err))?;
    Ok(Arc::new(backend))
}

fn zfs_backend(context: &BackendContext<'_>) -> Result<Arc<dyn Backend>, PluginError> {
    let options: ZfsOptions = decode_options(PluginKind::Backend, "zfs", context.options)?;
    let backend = ZfsBackend::new(context.cluster, options, ProcessCommandRunner)
        .map_err(|err| init_error(PluginKind::Backend, "zfs", err))?;
    Ok(Arc::new(backend))
}
