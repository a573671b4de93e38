use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use treesync::config::TreesyncConfig;

mod replica;
mod server;

/// Replica sync, event relay and isolated write sessions over git
///
/// Readers keep shallow local replicas of upstream repositories current by
/// following commit events from a relay. Writers get a private worktree per
/// session, stage files into it, and push commits back upstream.
///
/// QUICK START:
///
///   # Everything in one process: relay, session API and replicas
///   treesync serve
///
///   # Or run the pieces separately
///   treesync relay serve
///   treesync writer serve
///   treesync replica watch
///
///   # Inspect a replica
///   treesync replica sync acme/docs
///   treesync replica read acme/docs README.md
///   treesync replica log acme/docs --depth 5
#[derive(Parser)]
#[command(name = "treesync")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'treesync <command> --help' for more information on a specific command.")]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(long, global = true, env = "TREESYNC_CONFIG", default_value = "treesync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay, the session API and the replica driver in one process
    ///
    /// Commit events from sessions reach replicas through an in-process
    /// relay; the relay routes are also served for external subscribers.
    Serve(server::ServeArgs),

    /// Event relay
    #[command(subcommand)]
    Relay(server::RelayCommands),

    /// Write-session API
    #[command(subcommand)]
    Writer(server::WriterCommands),

    /// Local read replicas
    #[command(subcommand)]
    Replica(replica::ReplicaCommands),
}

impl Commands {
    const fn role(&self) -> &'static str {
        match self {
            Self::Serve(_) => "serve",
            Self::Relay(_) => "relay",
            Self::Writer(_) => "writer",
            Self::Replica(_) => "replica",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = treesync::telemetry::init(cli.command.role());
    let config = TreesyncConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve(args) => server::serve_all(config, args).await,
        Commands::Relay(cmd) => server::run_relay(config, cmd).await,
        Commands::Writer(cmd) => server::run_writer(config, cmd).await,
        Commands::Replica(cmd) => replica::run(config, cmd).await,
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "could not listen for Ctrl-C");
            return;
        }
        tracing::info!("shutting down");
        trigger.cancel();
    });
    token
}
