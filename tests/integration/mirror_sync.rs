//! Sync through the REST mirror when no peer link is open.

use weektodo::engine::{SyncEngine, SyncRoute};
use weektodo::peer::manager::ManagerOptions;
use weektodo::peer::Identity;
use weektodo::rest::RestClient;
use weektodo::store::MemoryStore;
use weektodo::transport::PeerId;
use weektodo::transport::loopback::{LoopbackNetwork, LoopbackTransport};
use weektodo_proto::task::{Day, Task};

type Peer = SyncEngine<MemoryStore, LoopbackTransport>;

async fn start_mirror() -> url::Url {
    let (addr, _handle) = weektodo_relay::relay::start_server("127.0.0.1:0").await.unwrap();
    url::Url::parse(&format!("http://{addr}")).unwrap()
}

async fn peer(net: &LoopbackNetwork, mirror: &url::Url, id: &str) -> Peer {
    SyncEngine::init(
        MemoryStore::new(),
        net.endpoint(id),
        Identity::ephemeral(id),
        Some(RestClient::new(mirror)),
        ManagerOptions::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn sync_without_links_goes_through_mirror() {
    let mirror = start_mirror().await;
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, &mirror, "a").await;
    assert!(a.rest().unwrap().is_registered());

    let local = a.book().add_todo(Day::Tuesday, "dentist", false).await.unwrap();
    let route = a.sync().await.unwrap();
    assert!(matches!(route, SyncRoute::Mirror(_)));
    assert!(a.identity().last_sync().is_some());

    let record = a.rest().unwrap().peer_state("a").await.unwrap();
    assert_eq!(record.peer_id, "a");
    assert_eq!(a.book().todos(Day::Tuesday).await.unwrap(), vec![local]);
}

#[tokio::test]
async fn newer_mirror_copy_wins_locally() {
    let mirror = start_mirror().await;
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, &mirror, "a").await;
    let older = Task::new(7, Day::Monday, "x", chrono::DateTime::from_timestamp(100, 0).unwrap());
    a.book().insert_todo(older, false).await.unwrap();

    // Another device of the same account pushed a newer edit.
    let other = RestClient::new(&mirror);
    other.register(&a.identity().state()).await.unwrap();
    let newer = Task::new(7, Day::Monday, "y", chrono::DateTime::from_timestamp(200, 0).unwrap());
    other.sync("a", vec![newer.clone()]).await.unwrap();

    match a.sync().await.unwrap() {
        SyncRoute::Mirror(outcome) => assert_eq!(outcome.replaced, 1),
        other => panic!("expected mirror sync, got {other:?}"),
    }
    assert_eq!(a.book().todos(Day::Monday).await.unwrap(), vec![newer]);
}

#[tokio::test]
async fn peer_connections_are_mirrored() {
    let mirror = start_mirror().await;
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, &mirror, "a").await;
    let _b = peer(&net, &mirror, "b").await;
    let b = PeerId::new("b");

    a.connect(Some(&b)).await.unwrap();
    let record = a.rest().unwrap().peer_state("a").await.unwrap();
    assert_eq!(record.connected_peers, vec!["b"]);

    a.disconnect(Some(&b)).await;
    let record = a.rest().unwrap().peer_state("a").await.unwrap();
    assert!(record.connected_peers.is_empty());
}
