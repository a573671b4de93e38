use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use tokio::net::TcpListener;
use treesync::config::TreesyncConfig;
use treesync::relay::{self, EventPublisher, EventRelay, EventSubscription, HttpPublisher};
use treesync::replica::{ReplicaEventHandler, ReplicaRegistry};
use treesync::session::{self, SessionManager, StaticTokenProvider};

use crate::replica::{prepare_all, upstream};
use crate::shutdown_on_ctrl_c;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (defaults to session.listen from the config)
    #[arg(long)]
    listen: Option<String>,
}

#[derive(Subcommand)]
pub enum RelayCommands {
    /// Serve the relay: `GET /events` streams, `POST /events` publishes
    Serve {
        /// Listen address (defaults to relay.listen from the config)
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum WriterCommands {
    /// Serve the write-session API
    ///
    /// Commit events go to relay.url when it is set; otherwise the relay
    /// routes are served alongside the session API.
    Serve {
        /// Listen address (defaults to session.listen from the config)
        #[arg(long)]
        listen: Option<String>,
    },
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

fn session_manager(
    config: &TreesyncConfig,
    publisher: Arc<dyn EventPublisher>,
) -> Result<SessionManager> {
    let credentials = Arc::new(StaticTokenProvider::new(
        config.session.token_env.clone(),
        config.session.token_user.clone(),
    ));
    Ok(SessionManager::new(config, credentials, publisher)?)
}

pub async fn run_relay(config: TreesyncConfig, cmd: RelayCommands) -> Result<()> {
    match cmd {
        RelayCommands::Serve { listen } => {
            let addr = listen.unwrap_or(config.relay.listen);
            let listener = bind(&addr).await?;
            let relay = EventRelay::new(config.relay.capacity);
            let shutdown = shutdown_on_ctrl_c();
            relay::server::serve(relay, listener, async move { shutdown.cancelled().await })
                .await?;
        }
    }
    Ok(())
}

pub async fn run_writer(config: TreesyncConfig, cmd: WriterCommands) -> Result<()> {
    match cmd {
        WriterCommands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| config.session.listen.clone());
            let listener = bind(&addr).await?;

            let local_relay = EventRelay::new(config.relay.capacity);
            let publisher: Arc<dyn EventPublisher> = match &config.relay.url {
                Some(url) => Arc::new(HttpPublisher::new(url, PUBLISH_TIMEOUT)?),
                None => Arc::new(local_relay.clone()),
            };
            let manager = session_manager(&config, publisher)?;
            let mut app = session::http::router(manager.clone());
            if config.relay.url.is_none() {
                app = app.merge(relay::server::router(local_relay));
            }

            let shutdown = shutdown_on_ctrl_c();
            let reaper = manager.spawn_reaper(shutdown.clone());
            tracing::info!(%addr, "writer listening");
            let stop = shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await?;

            shutdown.cancel();
            manager.shutdown().await;
            reaper.await?;
        }
    }
    Ok(())
}

pub async fn serve_all(config: TreesyncConfig, args: ServeArgs) -> Result<()> {
    let addr = args.listen.unwrap_or_else(|| config.session.listen.clone());
    let listener = bind(&addr).await?;
    let upstream = upstream(&config)?;

    let relay = EventRelay::new(config.relay.capacity);
    let manager = session_manager(&config, Arc::new(relay.clone()))?;
    let registry = Arc::new(ReplicaRegistry::new(config));

    let prepare = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { prepare_all(&registry, upstream.as_ref()).await })
    };
    let subscription = EventSubscription::in_process(
        relay.clone(),
        Arc::new(ReplicaEventHandler::new(Arc::clone(&registry))),
    );

    let app = session::http::router(manager.clone()).merge(relay::server::router(relay));
    let shutdown = shutdown_on_ctrl_c();
    let reaper = manager.spawn_reaper(shutdown.clone());
    tracing::info!(%addr, "treesync listening");
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    shutdown.cancel();
    manager.shutdown().await;
    subscription.close().await;
    reaper.await?;
    prepare.abort();
    Ok(())
}
