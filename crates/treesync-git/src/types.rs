//! Plain values crossing the [`ObjectStore`](crate::ObjectStore) boundary.
//!
//! Nothing here mentions gix or the git CLI; replicas and sessions only
//! ever see these.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// SHA-1 object id. Parsed from store output or the wire, never computed
/// locally. Renders as 40 lowercase hex digits, in `Display` and in serde.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GitOid([u8; 20]);

impl GitOid {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Abbreviated form used in log lines and generated messages.
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(10);
        s
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

impl fmt::Debug for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitOid({self})")
    }
}

impl FromStr for GitOid {
    type Err = OidParseError;

    /// Accepts 40 hex digits of either case. Surrounding whitespace (a
    /// trailing newline from `git rev-parse`) is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim();
        let fail = |reason: String| OidParseError {
            value: hex.to_owned(),
            reason,
        };
        if hex.len() != 40 || !hex.is_ascii() {
            return Err(fail(format!("want 40 hex digits, found {} chars", hex.chars().count())));
        }
        let mut bytes = [0u8; 20];
        for (slot, pair) in bytes.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let pair = std::str::from_utf8(pair).map_err(|e| fail(e.to_string()))?;
            *slot = u8::from_str_radix(pair, 16).map_err(|_| fail(format!("'{pair}' is not hex")))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for GitOid {
    type Error = OidParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GitOid> for String {
    fn from(oid: GitOid) -> Self {
        oid.to_string()
    }
}

/// A string that is not a full object id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParseError {
    pub value: String,
    pub reason: String,
}

impl fmt::Display for OidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not an object id {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for OidParseError {}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated full ref name (`refs/...` or `HEAD`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RefName(String);

impl RefName {
    /// Create a new `RefName`.
    ///
    /// # Errors
    /// Returns an error unless the name is `HEAD` or starts with `refs/`.
    pub fn new(name: &str) -> Result<Self, RefNameError> {
        if name == "HEAD" || (name.starts_with("refs/") && name.len() > "refs/".len()) {
            Ok(Self(name.to_owned()))
        } else {
            Err(RefNameError {
                value: name.to_owned(),
                reason: "ref name must start with 'refs/' or be HEAD".to_owned(),
            })
        }
    }

    /// The local branch ref `refs/heads/<branch>`.
    ///
    /// # Errors
    /// Returns an error if `branch` is empty.
    pub fn branch(branch: &str) -> Result<Self, RefNameError> {
        Self::new(&format!("refs/heads/{branch}"))
    }

    /// Return the ref name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error from validating a [`RefName`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefNameError {
    /// The invalid value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for RefNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ref name {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for RefNameError {}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How much history a fetch should bring in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchDepth {
    /// Only the objects missing between the local tips and the remote tip.
    Missing,
    /// Extend a shallow history by this many commits.
    Deepen(u32),
}

/// Author/committer identity passed to commit-producing operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// A file written by [`ObjectStore::write_snapshot`](crate::ObjectStore::write_snapshot).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotFile {
    /// Slash-separated path relative to the repository root.
    pub path: String,
    pub content: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// The kind of change a commit made to one path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        })
    }
}

/// One entry of a commit's changed-path set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChangedPath {
    /// Path in the new tree (old tree for deletions).
    pub path: String,
    pub kind: ChangeKind,
    /// Source path for renames.
    pub previous_path: Option<String>,
}

impl ChangedPath {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            previous_path: None,
        }
    }
}

/// Metadata of one commit object, as recorded by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub oid: GitOid,
    pub tree: GitOid,
    /// Parent ids visible locally. Commits at a shallow boundary report none.
    pub parents: Vec<GitOid>,
    pub message: String,
    /// `"Name <email>"`.
    pub author: String,
    /// Author time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Paths changed relative to the first parent (everything, for roots).
    pub changes: Vec<ChangedPath>,
}

// ---------------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------------

/// A linked worktree registered with the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: Option<GitOid>,
    /// `refs/heads/...` the worktree has checked out, if any.
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_roundtrip_hex() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let oid: GitOid = hex.parse().unwrap();
        assert_eq!(oid.to_string(), hex);
        assert_eq!(oid.short(), "0123456789");
    }

    #[test]
    fn oid_accepts_trailing_newline() {
        let oid: GitOid = format!("{}\n", "ab".repeat(20)).parse().unwrap();
        assert_eq!(oid.as_bytes(), &[0xab; 20]);
    }

    #[test]
    fn oid_rejects_short_and_non_hex() {
        assert!("abc".parse::<GitOid>().is_err());
        assert!("g".repeat(40).parse::<GitOid>().is_err());
    }

    #[test]
    fn oid_converts_to_hex_string() {
        let oid = GitOid::from_bytes([0x01; 20]);
        assert_eq!(String::from(oid), "01".repeat(20));
        assert_eq!(GitOid::try_from("01".repeat(20)).unwrap(), oid);
    }

    #[test]
    fn refname_validation() {
        assert!(RefName::new("refs/heads/main").is_ok());
        assert!(RefName::new("HEAD").is_ok());
        assert!(RefName::new("main").is_err());
        assert!(RefName::new("refs/").is_err());
        assert_eq!(RefName::branch("main").unwrap().as_str(), "refs/heads/main");
    }

    #[test]
    fn change_kind_display_matches_wire_names() {
        assert_eq!(ChangeKind::Renamed.to_string(), "renamed");
        assert_eq!(ChangeKind::Added.to_string(), "added");
    }
}
