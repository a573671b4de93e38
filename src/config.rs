//! treesync configuration (`treesync.toml`).
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Unknown keys are rejected so that typos surface early.
//!
//! ```toml
//! [replica]
//! data_dir = "/var/lib/treesync/replicas"
//! clone_depth = 20
//!
//! [session]
//! workspace_root = "/var/lib/treesync/workspaces"
//! auto_commit_ms = 30000
//! token_env = "TREESYNC_PUSH_TOKEN"
//!
//! [relay]
//! listen = "0.0.0.0:7410"
//!
//! [upstream]
//! base_url = "https://docs.example.com/api"
//!
//! [[repos]]
//! slug = "acme/handbook"
//! url = "https://git.example.com/acme/handbook.git"
//! path = "/srv/git/acme/handbook"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use treesync_git::Identity;

use crate::model::RepoSlug;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreesyncConfig {
    #[serde(default)]
    pub replica: ReplicaConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Repositories this process knows how to reach.
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
}

// ---------------------------------------------------------------------------
// ReplicaConfig
// ---------------------------------------------------------------------------

/// Settings for reading replicas.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaConfig {
    /// Tracked integration branch (default: `"main"`).
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Remote name inside each replica (default: `"origin"`).
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Depth of the initial shallow clone.
    #[serde(default = "default_clone_depth")]
    pub clone_depth: u32,

    /// Commits added by one deepen fetch when an object is missing.
    #[serde(default = "default_deepen_by")]
    pub deepen_by: u32,

    /// Where replicas and their `.sync.json` metadata live.
    #[serde(default = "default_replica_dir")]
    pub data_dir: PathBuf,

    /// Default number of commits returned by `history`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            remote: default_remote(),
            clone_depth: default_clone_depth(),
            deepen_by: default_deepen_by(),
            data_dir: default_replica_dir(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_branch() -> String {
    "main".to_owned()
}

fn default_remote() -> String {
    "origin".to_owned()
}

const fn default_clone_depth() -> u32 {
    20
}

const fn default_deepen_by() -> u32 {
    50
}

fn default_replica_dir() -> PathBuf {
    PathBuf::from(".treesync/replicas")
}

const fn default_history_limit() -> usize {
    50
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Settings for the write-session manager.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Parent directory of per-session worktrees.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Debounce window of the auto-commit after the last stage.
    #[serde(default = "default_auto_commit_ms")]
    pub auto_commit_ms: u64,

    /// Sessions idle for longer than this are closed by the reaper.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the reaper runs.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Maximum number of git processes running at once across all sessions.
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,

    /// Remote that session branches are pushed to.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Tracked branch that pushes update.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Author and committer of session commits.
    #[serde(default = "default_identity")]
    pub identity: Identity,

    /// Environment variable holding the push token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Username reported alongside the token.
    #[serde(default = "default_token_user")]
    pub token_user: String,

    /// Listen address of the session HTTP surface.
    #[serde(default = "default_session_listen")]
    pub listen: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            auto_commit_ms: default_auto_commit_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_concurrent_ops: default_max_concurrent_ops(),
            remote: default_remote(),
            branch: default_branch(),
            identity: default_identity(),
            token_env: default_token_env(),
            token_user: default_token_user(),
            listen: default_session_listen(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn auto_commit_delay(&self) -> Duration {
        Duration::from_millis(self.auto_commit_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".treesync/workspaces")
}

const fn default_auto_commit_ms() -> u64 {
    30_000
}

const fn default_idle_timeout_secs() -> u64 {
    15 * 60
}

const fn default_reap_interval_secs() -> u64 {
    60
}

const fn default_max_concurrent_ops() -> usize {
    4
}

fn default_identity() -> Identity {
    Identity {
        name: "treesync".to_owned(),
        email: "treesync@localhost".to_owned(),
    }
}

fn default_token_env() -> String {
    "TREESYNC_PUSH_TOKEN".to_owned()
}

fn default_token_user() -> String {
    "x-access-token".to_owned()
}

fn default_session_listen() -> String {
    "127.0.0.1:7420".to_owned()
}

// ---------------------------------------------------------------------------
// RelayConfig
// ---------------------------------------------------------------------------

/// Settings for the event relay (server side) and its clients.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Listen address of `relay serve`.
    #[serde(default = "default_relay_listen")]
    pub listen: String,

    /// Per-subscriber buffer. A subscriber that falls further behind is
    /// dropped.
    #[serde(default = "default_relay_capacity")]
    pub capacity: usize,

    /// Base URL of a remote relay. When set, writers publish over HTTP and
    /// replicas subscribe to `<url>/events`.
    #[serde(default)]
    pub url: Option<String>,

    /// Upper bound of the client reconnect backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_relay_listen(),
            capacity: default_relay_capacity(),
            url: None,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_relay_listen() -> String {
    "127.0.0.1:7410".to_owned()
}

const fn default_relay_capacity() -> usize {
    256
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// UpstreamConfig
// ---------------------------------------------------------------------------

/// The upstream hosting API (bootstrap snapshot and extended history).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

const fn default_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// RepoEntry
// ---------------------------------------------------------------------------

/// One repository: where its upstream lives and, for writers, the local
/// main repository that session worktrees hang off.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoEntry {
    pub slug: RepoSlug,

    /// Clone/push URL of the upstream origin.
    pub url: String,

    /// Writer-side main repository. Required for write sessions.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Overrides the tracked branch for this repository.
    #[serde(default)]
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// An error loading or parsing `treesync.toml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl TreesyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or duplicate
    /// repository slugs.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for repo in &self.repos {
            if !seen.insert(&repo.slug) {
                return Err(ConfigError {
                    path: None,
                    message: format!("repository '{}' is listed twice", repo.slug),
                });
            }
        }
        if self.session.max_concurrent_ops == 0 {
            return Err(ConfigError {
                path: None,
                message: "session.max_concurrent_ops must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    /// Look up a repository entry by slug.
    #[must_use]
    pub fn repo(&self, slug: &RepoSlug) -> Option<&RepoEntry> {
        self.repos.iter().find(|r| &r.slug == slug)
    }

    /// Branch tracked for `slug`: the per-repo override or the replica default.
    #[must_use]
    pub fn branch_for(&self, slug: &RepoSlug) -> &str {
        self.repo(slug)
            .and_then(|r| r.branch.as_deref())
            .unwrap_or(&self.replica.branch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_all_fields() {
        let cfg = TreesyncConfig::default();
        assert_eq!(cfg.replica.branch, "main");
        assert_eq!(cfg.replica.remote, "origin");
        assert_eq!(cfg.replica.clone_depth, 20);
        assert_eq!(cfg.session.max_concurrent_ops, 4);
        assert_eq!(cfg.session.auto_commit_delay(), Duration::from_secs(30));
        assert_eq!(cfg.session.token_env, "TREESYNC_PUSH_TOKEN");
        assert_eq!(cfg.relay.capacity, 256);
        assert!(cfg.relay.url.is_none());
        assert!(cfg.upstream.base_url.is_none());
        assert!(cfg.repos.is_empty());
    }

    #[test]
    fn parse_empty_string() {
        assert_eq!(TreesyncConfig::parse("").unwrap(), TreesyncConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[replica]
branch = "trunk"
clone_depth = 5
data_dir = "/data/replicas"

[session]
auto_commit_ms = 1500
max_concurrent_ops = 2
identity = { name = "Bot", email = "bot@example.com" }

[relay]
url = "http://relay:7410"

[upstream]
base_url = "https://api.example.com"

[[repos]]
slug = "Acme/Handbook"
url = "https://git.example.com/acme/handbook.git"
path = "/srv/git/handbook"

[[repos]]
slug = "notes"
url = "/srv/upstream/notes.git"
branch = "main"
"#;
        let cfg = TreesyncConfig::parse(toml).unwrap();
        assert_eq!(cfg.replica.branch, "trunk");
        assert_eq!(cfg.replica.clone_depth, 5);
        assert_eq!(cfg.replica.deepen_by, 50);
        assert_eq!(cfg.session.auto_commit_delay(), Duration::from_millis(1500));
        assert_eq!(cfg.session.identity.email, "bot@example.com");
        assert_eq!(cfg.relay.url.as_deref(), Some("http://relay:7410"));
        assert_eq!(cfg.repos.len(), 2);

        let handbook = RepoSlug::new("acme/handbook").unwrap();
        assert_eq!(
            cfg.repo(&handbook).and_then(|r| r.path.clone()),
            Some(PathBuf::from("/srv/git/handbook"))
        );
        assert_eq!(cfg.branch_for(&handbook), "trunk");
        assert_eq!(cfg.branch_for(&RepoSlug::new("notes").unwrap()), "main");
    }

    #[test]
    fn unknown_field_reports_line() {
        let err = TreesyncConfig::parse("[replica]\nbranch = \"main\"\ndepth = 3\n").unwrap_err();
        assert!(err.message.contains("line"), "{}", err.message);
        assert!(err.message.contains("depth"), "{}", err.message);
    }

    #[test]
    fn invalid_slug_is_rejected() {
        let toml = "[[repos]]\nslug = \"../etc\"\nurl = \"x\"\n";
        assert!(TreesyncConfig::parse(toml).is_err());
    }

    #[test]
    fn duplicate_repo_is_rejected() {
        let toml = "[[repos]]\nslug = \"a\"\nurl = \"x\"\n[[repos]]\nslug = \"A\"\nurl = \"y\"\n";
        let err = TreesyncConfig::parse(toml).unwrap_err();
        assert!(err.message.contains("listed twice"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(TreesyncConfig::parse("[session]\nmax_concurrent_ops = 0\n").is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = TreesyncConfig::load(&dir.path().join("treesync.toml")).unwrap();
        assert_eq!(cfg, TreesyncConfig::default());
    }

    #[test]
    fn load_attaches_path_to_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("treesync.toml");
        std::fs::write(&path, "[relay\n").unwrap();
        let err = TreesyncConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert!(err.to_string().contains("treesync.toml"));
    }
}
