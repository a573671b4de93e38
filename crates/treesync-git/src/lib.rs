//! Object store adapter for treesync.
//!
//! This crate defines the [`ObjectStore`] trait, the single interface through
//! which the replica engine and the write-session manager touch git. Nothing
//! else in treesync imports gix or spawns `git` directly.
//!
//! # Crate layout
//!
//! - [`store`]: the [`ObjectStore`] trait definition.
//! - [`types`]: value types used in trait signatures ([`GitOid`], [`RefName`],
//!   [`CommitInfo`], [`ChangedPath`], etc.).
//! - [`error`]: the [`StoreError`] enum returned by all trait methods.
//!
//! [`GitStore`] is the implementation: gix for object reads, the `git` CLI
//! for transport, ref updates, commits and worktrees.

pub mod error;
pub mod store;
pub mod types;

mod git_store;
mod history_impl;
mod objects_impl;
mod refs_impl;
mod transport_impl;
mod worktree_impl;

pub use error::StoreError;
pub use git_store::GitStore;
pub use store::ObjectStore;
pub use types::{
    ChangeKind, ChangedPath, CommitInfo, FetchDepth, GitOid, Identity, OidParseError, RefName,
    RefNameError, SnapshotFile, WorktreeInfo,
};
