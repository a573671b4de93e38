//! Push credentials.
//!
//! A credential exists on disk only for the duration of one push: it is
//! written into an askpass helper script inside a private temporary
//! directory, handed to git through `GIT_ASKPASS`, and deleted right after
//! the attempt. It never appears in argv, in the remote URL, or in a git
//! config file.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{RepoSlug, SessionId};

/// A username/secret pair issued for one push.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Issue a credential for pushing `session`'s work to `repo`.
    async fn issue(&self, repo: &RepoSlug, session: &SessionId) -> Result<Credential>;

    /// Give the credential back once the push attempt is over.
    async fn revoke(&self, credential: Credential) -> Result<()>;
}

/// Reads a token from an environment variable each time one is issued.
pub struct StaticTokenProvider {
    env_var: String,
    username: String,
}

impl StaticTokenProvider {
    #[must_use]
    pub fn new(env_var: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn issue(&self, _repo: &RepoSlug, session: &SessionId) -> Result<Credential> {
        match std::env::var(&self.env_var) {
            Ok(secret) if !secret.is_empty() => Ok(Credential {
                username: self.username.clone(),
                secret,
            }),
            _ => Err(SyncError::Push {
                session: session.clone(),
                detail: format!(
                    "no push token: environment variable {} is not set",
                    self.env_var
                ),
            }),
        }
    }

    async fn revoke(&self, _credential: Credential) -> Result<()> {
        Ok(())
    }
}

/// Askpass script holding one credential. Dropping it deletes the script
/// and its directory.
pub struct AskpassHelper {
    dir: tempfile::TempDir,
    script: PathBuf,
}

impl AskpassHelper {
    /// Write the helper for `credential`.
    ///
    /// # Errors
    /// I/O errors creating the directory or the script.
    pub fn create(credential: &Credential) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("treesync-askpass-")
            .tempdir()?;
        restrict(dir.path(), 0o700)?;

        let script = dir
            .path()
            .join(format!("askpass-{:016x}", rand::random::<u64>()));
        let body = format!(
            "#!/bin/sh\ncase \"$1\" in\n  Username*) printf '%s\\n' {} ;;\n  *) printf '%s\\n' {} ;;\nesac\n",
            shell_quote(&credential.username),
            shell_quote(&credential.secret),
        );
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&script)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);
        restrict(&script, 0o700)?;

        debug!(dir = %dir.path().display(), "askpass helper created");
        Ok(Self { dir, script })
    }

    #[must_use]
    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Environment for the git process that should use this helper.
    ///
    /// Configured credential helpers are switched off through
    /// `GIT_CONFIG_*` so that git asks the helper and nothing else.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (
                "GIT_ASKPASS".to_owned(),
                self.script.to_string_lossy().into_owned(),
            ),
            ("GIT_TERMINAL_PROMPT".to_owned(), "0".to_owned()),
            ("GIT_CONFIG_COUNT".to_owned(), "1".to_owned()),
            ("GIT_CONFIG_KEY_0".to_owned(), "credential.helper".to_owned()),
            ("GIT_CONFIG_VALUE_0".to_owned(), String::new()),
        ]
    }

    /// Delete the helper now, reporting failures.
    ///
    /// # Errors
    /// I/O errors removing the directory.
    pub fn remove(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
