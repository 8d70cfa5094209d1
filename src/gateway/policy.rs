//! Authorization policies for the SSH gateway.
//!
//! A policy inspects one received command line and decides whether the
//! gateway may execute it. Two checks exist: an exact match against an
//! allow-list of script strings (performed on the raw line, before any
//! tokenization), and, for rsync server invocations, containment of the
//! target path inside an allow-list of path prefixes. Path containment is
//! segment-wise: `/opt/data1` is never accepted because `/opt/data` is
//! allowed.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use super::Decision;
use crate::job::pgsql::{START_BACKUP_SCRIPT, STOP_BACKUP_SCRIPT};

/// Characters that make a whitespace-split command line ambiguous.
///
/// The raw-string script match happens before this check, so legitimately
/// quoted allow-listed scripts are unaffected; everything else carrying
/// shell syntax is rejected outright rather than misparsed.
const SHELL_METACHARACTERS: &[char] = &[
    '\'', '"', '`', '$', ';', '&', '|', '<', '>', '(', ')', '\\', '\n', '\r',
];

/// Allow-lists consumed by the built-in policies.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct PolicyOptions {
    /// Command lines executed verbatim when matched exactly.
    #[serde(default, deserialize_with = "one_or_many")]
    pub allowed_scripts: Vec<String>,
    /// Path prefixes rsync is allowed to target.
    #[serde(default, deserialize_with = "one_or_many")]
    pub allowed_paths: Vec<Utf8PathBuf>,
}

/// Accepts either a scalar or a sequence, normalising to a list.
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Pluggable authorization decision for one received command line.
pub trait AuthPolicy {
    /// Evaluates the command line; the decision is terminal.
    fn evaluate(&self, cmd_line: &str) -> Decision;
}

/// Policy for hosts backed up over rsync.
#[derive(Clone, Debug)]
pub struct RsyncPolicy {
    allowed_scripts: Vec<String>,
    allowed_paths: Vec<Utf8PathBuf>,
}

impl RsyncPolicy {
    /// Builds the policy from its allow-lists.
    #[must_use]
    pub fn new(options: PolicyOptions) -> Self {
        debug!(scripts = ?options.allowed_scripts, paths = ?options.allowed_paths, "rsync policy loaded");
        Self {
            allowed_scripts: options.allowed_scripts,
            allowed_paths: options.allowed_paths,
        }
    }

    fn path_is_allowed(&self, target: &Utf8Path) -> bool {
        self.allowed_paths
            .iter()
            .any(|allowed| target == allowed || target.starts_with(allowed))
    }
}

impl AuthPolicy for RsyncPolicy {
    fn evaluate(&self, cmd_line: &str) -> Decision {
        debug!(command = cmd_line, "checking authorization");
        if cmd_line.trim().is_empty() {
            return Decision::Rejected {
                reason: String::from("empty command line"),
            };
        }

        // Exact script match on the raw line, before any tokenization.
        if self.allowed_scripts.iter().any(|script| script == cmd_line) {
            return Decision::Authorized;
        }

        if cmd_line.contains(SHELL_METACHARACTERS) {
            return Decision::Rejected {
                reason: format!("command contains shell metacharacters: {cmd_line}"),
            };
        }

        let tokens: Vec<&str> = cmd_line.split_whitespace().collect();
        if tokens.first() == Some(&"rsync") {
            let Some(target) = tokens.last().map(Utf8Path::new) else {
                return Decision::Rejected {
                    reason: String::from("rsync command without a target path"),
                };
            };
            if self.path_is_allowed(target) {
                return Decision::Authorized;
            }
            return Decision::Rejected {
                reason: format!("unauthorized backup path requested: {target}"),
            };
        }

        Decision::Rejected {
            reason: format!("unauthorized command: {cmd_line}"),
        }
    }
}

/// Policy for PostgreSQL hosts: the rsync rules plus the two built-in
/// backup-mode markers, which replace any configured script allow-list.
#[derive(Clone, Debug)]
pub struct PgsqlPolicy {
    inner: RsyncPolicy,
}

impl PgsqlPolicy {
    /// Builds the policy; `allowed_paths` is honoured, `allowed_scripts` is
    /// overridden with the backup markers.
    #[must_use]
    pub fn new(options: PolicyOptions) -> Self {
        let inner = RsyncPolicy::new(PolicyOptions {
            allowed_scripts: vec![
                String::from(START_BACKUP_SCRIPT),
                String::from(STOP_BACKUP_SCRIPT),
            ],
            allowed_paths: options.allowed_paths,
        });
        Self { inner }
    }
}

impl AuthPolicy for PgsqlPolicy {
    fn evaluate(&self, cmd_line: &str) -> Decision {
        self.inner.evaluate(cmd_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SERVER_COMMAND: &str = "rsync --server --sender -logDtpArRe.iLsfxC --numeric-ids . ";

    fn rsync_policy(paths: &[&str]) -> RsyncPolicy {
        RsyncPolicy::new(PolicyOptions {
            allowed_scripts: Vec::new(),
            allowed_paths: paths.iter().map(Utf8PathBuf::from).collect(),
        })
    }

    fn authorized(decision: &Decision) -> bool {
        matches!(decision, Decision::Authorized)
    }

    #[rstest]
    #[case("/opt/data", true)] // exact match
    #[case("/opt/data/sub/file", true)] // descendant
    #[case("/opt/data1/x", false)] // no string-prefix confusion
    #[case("/opt/data1", false)]
    #[case("/opt", false)] // parent of the allowed path
    #[case("/etc/shadow", false)]
    fn rsync_targets_use_segment_wise_containment(#[case] target: &str, #[case] allow: bool) {
        let policy = rsync_policy(&["/opt/data"]);
        let decision = policy.evaluate(&format!("{SERVER_COMMAND}{target}"));
        assert_eq!(authorized(&decision), allow, "target {target}");
    }

    #[test]
    fn exact_script_match_is_authorized_verbatim() {
        let policy = RsyncPolicy::new(PolicyOptions {
            allowed_scripts: vec![String::from("/usr/local/bin/prepare --fast")],
            allowed_paths: Vec::new(),
        });

        assert!(authorized(
            &policy.evaluate("/usr/local/bin/prepare --fast")
        ));
        assert!(!authorized(
            &policy.evaluate("/usr/local/bin/prepare --fast --and-more")
        ));
    }

    #[test]
    fn non_rsync_commands_are_rejected() {
        let policy = rsync_policy(&["/opt/data"]);
        let decision = policy.evaluate("scp /opt/data/file remote:");
        assert!(!authorized(&decision));
    }

    #[test]
    fn empty_command_is_rejected() {
        let policy = rsync_policy(&["/opt/data"]);
        assert!(!authorized(&policy.evaluate("")));
        assert!(!authorized(&policy.evaluate("   ")));
    }

    #[rstest]
    #[case("rsync --server . /opt/data; rm -rf /")]
    #[case("rsync --server . /opt/data && curl evil")]
    #[case("rsync --server . '/opt/data'")]
    #[case("rsync --server . $(cat /etc/passwd)")]
    fn shell_metacharacters_are_rejected_outside_exact_matches(#[case] cmd: &str) {
        let policy = rsync_policy(&["/opt/data"]);
        assert!(!authorized(&policy.evaluate(cmd)), "must reject: {cmd}");
    }

    #[test]
    fn scalar_allow_lists_parse_like_sequences() {
        let options: PolicyOptions =
            serde_yaml::from_str("allowed_paths: /opt/data\n").expect("scalar should parse");
        assert_eq!(options.allowed_paths, vec![Utf8PathBuf::from("/opt/data")]);

        let options: PolicyOptions = serde_yaml::from_str("allowed_paths: [/opt/data, /srv]\n")
            .expect("sequence should parse");
        assert_eq!(options.allowed_paths.len(), 2);
    }

    #[test]
    fn pgsql_policy_authorizes_the_backup_markers() {
        let policy = PgsqlPolicy::new(PolicyOptions {
            allowed_scripts: vec![String::from("/usr/local/bin/ignored")],
            allowed_paths: vec![Utf8PathBuf::from("/opt/data")],
        });

        assert!(authorized(&policy.evaluate(START_BACKUP_SCRIPT)));
        assert!(authorized(&policy.evaluate(STOP_BACKUP_SCRIPT)));
        assert!(authorized(
            &policy.evaluate(&format!("{SERVER_COMMAND}/opt/data"))
        ));
        // The configured script list is replaced by the markers.
        assert!(!authorized(&policy.evaluate("/usr/local/bin/ignored")));
        assert!(!authorized(
            &policy.evaluate(r#"psql -c "DROP DATABASE postgres;""#)
        ));
    }
}
