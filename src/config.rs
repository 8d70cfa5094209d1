//! Cluster and global settings.
//!
//! Configuration is plain YAML in two layers: one global file with per-plugin
//! option defaults, and one drop-in file per cluster naming its job and
//! backend. Paths are always passed in explicitly (by the CLI or by tests);
//! there is no process-wide mutable configuration state.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::Deserialize;
use serde_yaml::Mapping;
use thiserror::Error;
use tracing::debug;

use crate::report::DEFAULT_REPORT_DIR;

/// Default path of the global settings file.
pub const DEFAULT_GLOBAL_CONFIG: &str = "/etc/packrat.yaml";

/// Default directory holding one YAML file per cluster.
pub const DEFAULT_CLUSTER_DIR: &str = "/etc/packrat.d";

/// Errors raised while loading or interpreting settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Raised when a settings file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a settings file is not valid YAML for its schema.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
    /// Raised when no drop-in file exists for the requested cluster.
    #[error("unknown cluster {name}: no configuration at {path}")]
    UnknownCluster {
        /// Cluster that was requested.
        name: String,
        /// Drop-in path that was probed.
        path: Utf8PathBuf,
    },
    /// Raised when a cluster file does not name its job plugin.
    #[error("configuration error in {cluster}: attribute \"job\" missing")]
    MissingJob {
        /// Cluster with the incomplete configuration.
        cluster: String,
    },
    /// Raised when neither the cluster nor the global file names a backend.
    #[error(
        "configuration error in {cluster}: no backend defined; set \"backend\" in the cluster \
         file or \"default_backend\" in the global configuration"
    )]
    MissingBackend {
        /// Cluster with the incomplete configuration.
        cluster: String,
    },
}

/// Global settings shared by every cluster.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GlobalConfig {
    /// Backend used by clusters that do not name one themselves.
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Root directory for run reports.
    #[serde(default)]
    pub report_dir: Option<Utf8PathBuf>,
    /// Per-job-plugin option defaults, merged under cluster options.
    #[serde(default)]
    pub job_options: BTreeMap<String, Mapping>,
    /// Per-backend-plugin option defaults, merged under cluster options.
    #[serde(default)]
    pub backend_options: BTreeMap<String, Mapping>,
}

impl GlobalConfig {
    /// Loads the global settings file; a missing file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        match read_file(path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }
}

/// One cluster's drop-in configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterConfig {
    /// Job plugin name; mandatory.
    #[serde(default)]
    pub job: Option<String>,
    /// Backend plugin name; falls back to the global default.
    #[serde(default)]
    pub backend: Option<String>,
    /// Job options, overriding global defaults key by key.
    #[serde(default)]
    pub options: Mapping,
    /// Backend options, overriding global defaults key by key.
    #[serde(default)]
    pub backend_options: Mapping,
}

/// Listing entry for one cluster drop-in file.
#[derive(Clone, Debug)]
pub struct ClusterEntry {
    /// Cluster name (file stem of the drop-in).
    pub name: String,
    /// Path of the drop-in file.
    pub path: Utf8PathBuf,
    /// Parse failure, if the file could not be loaded.
    pub error: Option<String>,
}

/// Resolved settings for one cluster: its drop-in merged over the globals.
#[derive(Clone, Debug)]
pub struct Settings {
    name: String,
    cluster: ClusterConfig,
    global: GlobalConfig,
}

impl Settings {
    /// Builds settings from already-parsed parts; used by tests and
    /// embedders.
    #[must_use]
    pub fn from_parts(
        name: impl Into<String>,
        cluster: ClusterConfig,
        global: GlobalConfig,
    ) -> Self {
        Self {
            name: name.into(),
            cluster,
            global,
        }
    }

    /// Loads the settings for `name` from the global file and drop-in
    /// directory.
    ///
    /// A missing global file is treated as empty; a missing cluster drop-in
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when files cannot be read or parsed, or when
    /// the cluster has no drop-in file.
    pub fn load(
        name: &str,
        global_path: &Utf8Path,
        cluster_dir: &Utf8Path,
    ) -> Result<Self, ConfigError> {
        let global = GlobalConfig::load(global_path)?;

        let cluster_path = cluster_dir.join(format!("{name}.yaml"));
        let text = read_file(&cluster_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ConfigError::UnknownCluster {
                    name: name.to_owned(),
                    path: cluster_path.clone(),
                }
            } else {
                ConfigError::Io {
                    path: cluster_path.clone(),
                    message: err.to_string(),
                }
            }
        })?;
        let cluster: ClusterConfig =
            serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse {
                path: cluster_path,
                message: err.to_string(),
            })?;
        debug!(cluster = name, "loaded cluster configuration");

        Ok(Self::from_parts(name, cluster, global))
    }

    /// Lists every cluster drop-in under `cluster_dir` with its parse state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the directory cannot be read.
    pub fn list(cluster_dir: &Utf8Path) -> Result<Vec<ClusterEntry>, ConfigError> {
        let entries = cluster_dir.read_dir_utf8().map_err(|err| ConfigError::Io {
            path: cluster_dir.to_path_buf(),
            message: err.to_string(),
        })?;

        let mut clusters = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ConfigError::Io {
                path: cluster_dir.to_path_buf(),
                message: err.to_string(),
            })?;
            let path = entry.path().to_path_buf();
            if path.extension() != Some("yaml") {
                continue;
            }
            let Some(name) = path.file_stem() else {
                continue;
            };
            let error = match read_file(&path) {
                Ok(text) => serde_yaml::from_str::<ClusterConfig>(&text)
                    .err()
                    .map(|err| err.to_string()),
                Err(err) => Some(err.to_string()),
            };
            clusters.push(ClusterEntry {
                name: name.to_owned(),
                path,
                error,
            });
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    /// Cluster name these settings belong to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves the job plugin name and its merged options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingJob`] when the cluster names no job.
    pub fn job(&self) -> Result<(String, Mapping), ConfigError> {
        let job = self
            .cluster
            .job
            .clone()
            .ok_or_else(|| ConfigError::MissingJob {
                cluster: self.name.clone(),
            })?;
        let defaults = self.global.job_options.get(&job);
        Ok((job, merge_options(defaults, &self.cluster.options)))
    }

    /// Resolves the backend plugin name and its merged options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingBackend`] when neither the cluster nor
    /// the global configuration names one.
    pub fn backend(&self) -> Result<(String, Mapping), ConfigError> {
        let backend = self
            .cluster
            .backend
            .clone()
            .or_else(|| self.global.default_backend.clone())
            .ok_or_else(|| ConfigError::MissingBackend {
                cluster: self.name.clone(),
            })?;
        let defaults = self.global.backend_options.get(&backend);
        Ok((
            backend,
            merge_options(defaults, &self.cluster.backend_options),
        ))
    }

    /// Root directory for run reports.
    #[must_use]
    pub fn report_dir(&self) -> Utf8PathBuf {
        self.global
            .report_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_REPORT_DIR))
    }
}

/// Shallow merge: defaults first, cluster overrides key by key.
fn merge_options(defaults: Option<&Mapping>, overrides: &Mapping) -> Mapping {
    let mut merged = defaults.cloned().unwrap_or_default();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Reads a file through a capability-scoped handle on its parent directory.
pub(crate) fn read_file(path: &Utf8Path) -> io::Result<String> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path is missing a filename"))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read_to_string(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml_mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).expect("test mapping should parse")
    }

    fn utf8(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("temp path should be utf8")
    }

    #[test]
    fn job_options_merge_globals_under_cluster_overrides() {
        let global: GlobalConfig = serde_yaml::from_str(
            "job_options:\n  rsync:\n    user: root\n    private_key: /etc/packrat/backup.key\n",
        )
        .expect("global should parse");
        let cluster = ClusterConfig {
            job: Some(String::from("rsync")),
            options: yaml_mapping("user: backup\nhosts: [host01]\n"),
            ..ClusterConfig::default()
        };
        let settings = Settings::from_parts("mycluster", cluster, global);

        let (job, options) = settings.job().expect("job should resolve");
        assert_eq!(job, "rsync");
        assert_eq!(
            options.get("user"),
            Some(&serde_yaml::Value::from("backup"))
        );
        assert_eq!(
            options.get("private_key"),
            Some(&serde_yaml::Value::from("/etc/packrat/backup.key"))
        );
    }

    #[test]
    fn missing_job_is_a_configuration_error() {
        let settings = Settings::from_parts(
            "mycluster",
            ClusterConfig::default(),
            GlobalConfig::default(),
        );
        let err = settings.job().expect_err("missing job should error");
        assert!(matches!(err, ConfigError::MissingJob { .. }), "got {err:?}");
    }

    #[test]
    fn backend_falls_back_to_global_default() {
        let global: GlobalConfig =
            serde_yaml::from_str("default_backend: zfs\n").expect("global should parse");
        let settings = Settings::from_parts("mycluster", ClusterConfig::default(), global);

        let (backend, _) = settings.backend().expect("backend should resolve");
        assert_eq!(backend, "zfs");
    }

    #[test]
    fn missing_backend_everywhere_is_a_configuration_error() {
        let settings = Settings::from_parts(
            "mycluster",
            ClusterConfig::default(),
            GlobalConfig::default(),
        );
        let err = settings.backend().expect_err("missing backend should error");
        assert!(
            matches!(err, ConfigError::MissingBackend { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn load_reads_global_and_cluster_files() {
        let tmp = TempDir::new().expect("tempdir");
        let root = utf8(&tmp);
        let global_path = root.join("packrat.yaml");
        let cluster_dir = root.join("packrat.d");
        std::fs::create_dir(&cluster_dir).expect("create cluster dir");
        std::fs::write(&global_path, "default_backend: localfs\n").expect("write global");
        std::fs::write(
            cluster_dir.join("web.yaml"),
            "job: rsync\noptions:\n  hosts: [host01]\n",
        )
        .expect("write cluster");

        let settings = Settings::load("web", &global_path, &cluster_dir).expect("load");
        assert_eq!(settings.name(), "web");
        let (job, _) = settings.job().expect("job");
        assert_eq!(job, "rsync");
        let (backend, _) = settings.backend().expect("backend");
        assert_eq!(backend, "localfs");
    }

    #[test]
    fn load_without_global_file_uses_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let root = utf8(&tmp);
        let cluster_dir = root.join("packrat.d");
        std::fs::create_dir(&cluster_dir).expect("create cluster dir");
        std::fs::write(cluster_dir.join("web.yaml"), "job: rsync\n").expect("write cluster");

        let settings =
            Settings::load("web", &root.join("absent.yaml"), &cluster_dir).expect("load");
        assert_eq!(settings.report_dir(), Utf8PathBuf::from(DEFAULT_REPORT_DIR));
    }

    #[test]
    fn load_unknown_cluster_errors() {
        let tmp = TempDir::new().expect("tempdir");
        let root = utf8(&tmp);
        let cluster_dir = root.join("packrat.d");
        std::fs::create_dir(&cluster_dir).expect("create cluster dir");

        let err = Settings::load("ghost", &root.join("absent.yaml"), &cluster_dir)
            .expect_err("unknown cluster should error");
        assert!(
            matches!(err, ConfigError::UnknownCluster { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn list_reports_parse_state_per_cluster() {
        let tmp = TempDir::new().expect("tempdir");
        let root = utf8(&tmp);
        std::fs::write(root.join("good.yaml"), "job: rsync\n").expect("write good");
        std::fs::write(root.join("bad.yaml"), "job: [unclosed\n").expect("write bad");
        std::fs::write(root.join("ignored.txt"), "not yaml\n").expect("write ignored");

        let entries = Settings::list(&root).expect("list");
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["bad", "good"]);
        assert!(entries.first().is_some_and(|entry| entry.error.is_some()));
        assert!(entries.last().is_some_and(|entry| entry.error.is_none()));
    }
}
