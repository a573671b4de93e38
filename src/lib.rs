//! treesync: read replicas, an event relay and isolated write sessions over
//! a git object store.
//!
//! - [`replica`]: shallow local copies of upstream repositories, kept
//!   current by commit events and revalidated on reconnect.
//! - [`relay`]: fan-out of [`event::SyncEvent`]s to live subscribers, in
//!   process or as an NDJSON stream over HTTP.
//! - [`session`]: per-writer git worktrees with staged writes, debounced
//!   auto-commit and credential-scoped pushes.
//!
//! The `treesync` binary (crate `treesync-cli`) wires these together; this
//! library exposes them for embedding and for integration tests.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod relay;
pub mod replica;
pub mod session;
pub mod telemetry;

pub use error::{Result, SyncError};
