//! Writer → relay → replica, in process and over HTTP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Upstream, eventually, slug};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use treesync::model::PrincipalId;
use treesync::relay::{EventRelay, EventStreamClient, EventSubscription, HttpPublisher};
use treesync::replica::{ReplicaEventHandler, ReplicaRegistry};
use treesync::session::SessionManager;

async fn write_and_push(manager: &SessionManager, path: &str, content: &str) -> treesync_git::GitOid {
    let id = manager
        .open(&PrincipalId::new("alice").unwrap(), &slug())
        .await
        .unwrap()
        .session_id
        .unwrap();
    manager.stage(&id, path, Some(content.into())).await.unwrap();
    manager.commit(&id, "publish").await.unwrap();
    let oid = manager.push(&id).await.unwrap().oid.unwrap();
    manager.close(&id).await.unwrap();
    oid
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pushed_commits_reach_an_in_process_replica() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let main = upstream.writer_clone("writer");
    let config = upstream.config(root.path(), Some(&main), "");

    let relay = EventRelay::new(64);
    let registry = Arc::new(ReplicaRegistry::new(config.clone()));
    let replica = registry.get_or_create(&slug()).await.unwrap();
    replica.ensure_ready(None).await.unwrap();
    let subscription = EventSubscription::in_process(
        relay.clone(),
        Arc::new(ReplicaEventHandler::new(Arc::clone(&registry))),
    );

    let manager = SessionManager::new(
        &config,
        common::recording_credentials(),
        Arc::new(relay.clone()),
    )
    .unwrap();
    let oid = write_and_push(&manager, "news.md", "fresh\n").await;

    assert!(eventually(Duration::from_secs(15), || replica.cursor() == Some(oid)).await);
    let got = replica.read_object_at("news.md", None).await.unwrap();
    assert_eq!(got, b"fresh\n");

    subscription.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pushed_commits_reach_a_replica_over_http() {
    let upstream = Upstream::new();
    let root = TempDir::new().unwrap();
    let main = upstream.writer_clone("writer");
    let config = upstream.config(root.path(), Some(&main), "");

    // Relay server on an ephemeral port.
    let relay = EventRelay::new(64);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let stop = CancellationToken::new();
    let server = tokio::spawn(treesync::relay::server::serve(relay.clone(), listener, {
        let stop = stop.clone();
        async move { stop.cancelled().await }
    }));

    // Replica following the relay; a missed commit is caught up on connect.
    let missed = upstream.commit(&[("early.md", "early\n")], "before subscribing");
    let registry = Arc::new(ReplicaRegistry::new(config.clone()));
    let replica = registry.get_or_create(&slug()).await.unwrap();
    replica.ensure_ready(None).await.unwrap();
    let after_missed = upstream.commit(&[("late.md", "late\n")], "while offline");
    assert_ne!(replica.cursor(), Some(after_missed));

    let client = EventStreamClient::new(&base, Duration::from_secs(1)).unwrap();
    let subscription =
        client.subscribe(Arc::new(ReplicaEventHandler::new(Arc::clone(&registry))));
    assert!(
        eventually(Duration::from_secs(15), || replica.cursor() == Some(after_missed)).await,
        "revalidation on connect did not catch up (missed {missed})"
    );
    assert!(eventually(Duration::from_secs(5), || relay.connections() == 1).await);

    // Writer publishing over HTTP.
    let publisher = HttpPublisher::new(&base, Duration::from_secs(5)).unwrap();
    let manager =
        SessionManager::new(&config, common::recording_credentials(), Arc::new(publisher))
            .unwrap();
    let oid = write_and_push(&manager, "news.md", "over http\n").await;

    assert!(eventually(Duration::from_secs(15), || replica.cursor() == Some(oid)).await);
    let got = replica.read_object_at("news.md", Some(oid)).await.unwrap();
    assert_eq!(got, b"over http\n");

    subscription.close().await;
    stop.cancel();
    server.abort();
}
