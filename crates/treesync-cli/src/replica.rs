use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Subcommand;
use treesync::config::TreesyncConfig;
use treesync::model::{CommitRecord, RepoSlug};
use treesync::relay::EventStreamClient;
use treesync::replica::{BootstrapSource, HttpUpstream, ReplicaEventHandler, ReplicaRegistry};
use treesync_git::GitOid;

use crate::shutdown_on_ctrl_c;

#[derive(Subcommand)]
pub enum ReplicaCommands {
    /// Bring a replica up to date
    ///
    /// Bootstraps the replica if it has no local copy yet, then compares its
    /// cursor with the upstream head and applies the difference.
    Sync {
        /// Repository slug (owner/name)
        repo: String,

        /// Discard the local copy and take a fresh shallow clone
        #[arg(long)]
        full: bool,
    },

    /// Follow a relay and keep every configured replica current
    Watch {
        /// Relay base URL (defaults to relay.url from the config)
        #[arg(long)]
        relay: Option<String>,
    },

    /// Print a file as of the replica cursor or a given commit
    Read {
        repo: String,
        path: String,

        /// Commit id to read at
        #[arg(long)]
        at: Option<String>,
    },

    /// Show commit history, newest first
    Log {
        repo: String,

        #[arg(long, default_value_t = 20)]
        depth: usize,

        /// Merge in the history upstream serves beyond the shallow clone
        #[arg(long)]
        full: bool,

        #[arg(long)]
        json: bool,
    },

    /// Delete a replica's local copy
    Clear { repo: String },
}

pub async fn run(config: TreesyncConfig, cmd: ReplicaCommands) -> Result<()> {
    let upstream = upstream(&config)?;
    let registry = Arc::new(ReplicaRegistry::new(config));

    match cmd {
        ReplicaCommands::Sync { repo, full } => {
            let replica = registry.get_or_create(&slug(&repo)?).await?;
            if full {
                let head = replica.bootstrap().await?;
                println!("{repo}: bootstrapped at {}", head.short());
                return Ok(());
            }
            replica.ensure_ready(fallback(upstream.as_ref())).await?;
            let outcome = replica.revalidate().await?;
            let status = replica.status();
            let cursor = status.cursor.map_or_else(|| "-".to_owned(), |c| c.short());
            match outcome {
                Some(outcome) => println!("{repo}: {outcome:?}, cursor {cursor}"),
                None => println!("{repo}: upstream head unknown, cursor {cursor}"),
            }
            if status.synthetic {
                println!("  (built from an upstream snapshot; history is not available locally)");
            }
        }
        ReplicaCommands::Watch { relay } => {
            let Some(url) = relay.or_else(|| registry.config().relay.url.clone()) else {
                bail!("no relay to follow\n  To fix: pass --relay <url> or set relay.url in the config");
            };
            let max_backoff = Duration::from_millis(registry.config().relay.max_backoff_ms);
            prepare_all(&registry, upstream.as_ref()).await;

            let client = EventStreamClient::new(&url, max_backoff)?;
            let subscription =
                client.subscribe(Arc::new(ReplicaEventHandler::new(Arc::clone(&registry))));
            tracing::info!(%url, "following relay");
            shutdown_on_ctrl_c().cancelled().await;
            subscription.close().await;
        }
        ReplicaCommands::Read { repo, path, at } => {
            let replica = registry.get_or_create(&slug(&repo)?).await?;
            replica.ensure_ready(fallback(upstream.as_ref())).await?;
            let at = at.as_deref().map(parse_oid).transpose()?;
            let bytes = replica.read_object_at(&path, at).await?;
            std::io::stdout().write_all(&bytes)?;
        }
        ReplicaCommands::Log {
            repo,
            depth,
            full,
            json,
        } => {
            let replica = registry.get_or_create(&slug(&repo)?).await?;
            replica.ensure_ready(fallback(upstream.as_ref())).await?;
            let mut commits = match (&upstream, full) {
                (Some(source), true) => replica.full_history(source).await?,
                (None, true) => bail!(
                    "--full needs the upstream API\n  To fix: set upstream.base_url in the config"
                ),
                (_, false) => replica.history(depth).await?,
            };
            commits.truncate(depth);
            print_log(&commits, json)?;
        }
        ReplicaCommands::Clear { repo } => {
            if registry.clear(&slug(&repo)?).await? {
                println!("{repo}: cleared");
            } else {
                println!("{repo}: no local copy");
            }
        }
    }
    Ok(())
}

/// Bootstrap every configured replica that has no copy yet. Failures are
/// logged; events and reconnects retry later.
pub async fn prepare_all(registry: &ReplicaRegistry, upstream: Option<&HttpUpstream>) {
    for entry in &registry.config().repos {
        let replica = match registry.get_or_create(&entry.slug).await {
            Ok(replica) => replica,
            Err(e) => {
                tracing::warn!(repo = %entry.slug, error = %e, "cannot open replica");
                continue;
            }
        };
        match replica.ensure_ready(fallback(upstream)).await {
            Ok(head) => tracing::info!(repo = %entry.slug, head = %head.short(), "replica ready"),
            Err(e) => tracing::warn!(repo = %entry.slug, error = %e, "replica not ready"),
        }
    }
}

pub fn upstream(config: &TreesyncConfig) -> Result<Option<HttpUpstream>> {
    let timeout = Duration::from_secs(config.upstream.timeout_secs);
    Ok(config
        .upstream
        .base_url
        .as_deref()
        .map(|url| HttpUpstream::new(url, timeout))
        .transpose()?)
}

fn fallback(upstream: Option<&HttpUpstream>) -> Option<&dyn BootstrapSource> {
    upstream.map(|u| u as &dyn BootstrapSource)
}

fn slug(raw: &str) -> Result<RepoSlug> {
    RepoSlug::new(raw).with_context(|| format!("invalid repository slug '{raw}'"))
}

fn parse_oid(raw: &str) -> Result<GitOid> {
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid commit id '{raw}': {e}"))
}

fn print_log(commits: &[CommitRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(commits)?);
        return Ok(());
    }
    for commit in commits {
        println!(
            "{}  {}  {:<16}  {}",
            commit.oid.short(),
            commit.timestamp.format("%Y-%m-%d %H:%M"),
            commit.author,
            commit.summary()
        );
    }
    Ok(())
}
