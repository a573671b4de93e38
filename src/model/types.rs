//! Validated identifiers used throughout treesync.
//!
//! Repository slugs, principals and session ids all end up in filesystem
//! paths and git ref names, so every constructor validates its input and
//! the serde impls go through the same checks.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RepoSlug
// ---------------------------------------------------------------------------

/// A repository identifier: `owner/name` or `name`.
///
/// Slugs are case-insensitive and stored lowercased. Each segment contains
/// only ASCII alphanumerics, `-`, `_` and `.`; `..` is rejected anywhere.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoSlug(String);

impl RepoSlug {
    /// The maximum length of a slug.
    pub const MAX_LEN: usize = 200;

    /// Create a new `RepoSlug`, validating and lowercasing it.
    ///
    /// # Errors
    /// Returns an error if the slug is empty, too long, has more than one
    /// `/`, or contains characters outside the allowed set.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative path for on-disk state keyed by this slug (`owner/name`
    /// becomes two path components).
    #[must_use]
    pub fn rel_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let err = |reason: &str| ValidationError {
            kind: ErrorKind::RepoSlug,
            value: s.to_owned(),
            reason: reason.to_owned(),
        };
        if s.is_empty() {
            return Err(err("repository slug must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(err("repository slug is too long"));
        }
        if s.contains("..") {
            return Err(err("repository slug must not contain '..'"));
        }
        let segments: Vec<&str> = s.split('/').collect();
        if segments.len() > 2 {
            return Err(err("repository slug must be `name` or `owner/name`"));
        }
        for seg in segments {
            if seg.is_empty() {
                return Err(err("repository slug must not have empty segments"));
            }
            if seg.starts_with('.') {
                return Err(err("slug segments must not start with '.'"));
            }
            if !seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(err(
                    "repository slug may contain only letters, digits, '-', '_', '.' and one '/'",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoSlug {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RepoSlug {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

impl From<RepoSlug> for String {
    fn from(slug: RepoSlug) -> Self {
        slug.0
    }
}

// ---------------------------------------------------------------------------
// PrincipalId
// ---------------------------------------------------------------------------

/// The identity on whose behalf a write session runs (a user or an agent).
///
/// 1-64 characters of ASCII alphanumerics, `-`, `_`, `.` and `@`. The value
/// is embedded in session branch names, so it also obeys git ref rules.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    pub const MAX_LEN: usize = 64;

    /// # Errors
    /// Returns an error if the id is empty, too long, or not ref-safe.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let err = |reason: String| ValidationError {
            kind: ErrorKind::PrincipalId,
            value: s.to_owned(),
            reason,
        };
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(err(format!(
                "principal must be 1-{} characters, got {}",
                Self::MAX_LEN,
                s.len()
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        {
            return Err(err(
                "principal may contain only letters, digits, '-', '_', '.' and '@'".to_owned(),
            ));
        }
        if s.starts_with('.') || s.contains("..") || s.ends_with(".lock") || s.contains("@{") {
            return Err(err("principal is not usable in a branch name".to_owned()));
        }
        Ok(())
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PrincipalId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<PrincipalId> for String {
    fn from(id: PrincipalId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// A write-session identifier: 16 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub const LEN: usize = 16;

    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    /// # Errors
    /// Returns an error unless `s` is exactly 16 lowercase hex characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.len() != Self::LEN
            || !s
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(ValidationError {
                kind: ErrorKind::SessionId,
                value: s.to_owned(),
                reason: format!("expected {} lowercase hex characters", Self::LEN),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which identifier failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    RepoSlug,
    PrincipalId,
    SessionId,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RepoSlug => write!(f, "repository slug"),
            Self::PrincipalId => write!(f, "principal"),
            Self::SessionId => write!(f, "session id"),
        }
    }
}

/// A validation error for treesync identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    /// The rejected value.
    pub value: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
