//! End-to-end sync between two engines through an in-process relay.

use std::future::Future;
use std::time::Duration;

use weektodo::engine::{SyncEngine, SyncRoute};
use weektodo::peer::manager::ManagerOptions;
use weektodo::peer::{ConnectionState, Identity, PeerError};
use weektodo::store::MemoryStore;
use weektodo::transport::PeerId;
use weektodo::transport::relay::RelayTransport;
use weektodo_proto::task::Day;

type Peer = SyncEngine<MemoryStore, RelayTransport>;

async fn start_relay() -> String {
    let (addr, _handle) = weektodo_relay::relay::start_server("127.0.0.1:0").await.unwrap();
    format!("ws://{addr}/ws")
}

async fn peer(url: &str, id: &str) -> Peer {
    let transport = RelayTransport::connect(url, PeerId::new(id)).await.unwrap();
    SyncEngine::init(
        MemoryStore::new(),
        transport,
        Identity::ephemeral(id),
        None,
        ManagerOptions::default(),
    )
    .await
    .unwrap()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn mutations_flow_both_ways_through_relay() {
    let url = start_relay().await;
    let alice = peer(&url, "alice").await;
    let bob = peer(&url, "bob").await;

    let early = bob.book().add_todo(Day::Monday, "before link", false).await.unwrap();
    alice.connect(Some(&PeerId::new("bob"))).await.unwrap();
    eventually("initial exchange", || async {
        alice.book().todos(Day::Monday).await.unwrap() == vec![early.clone()]
    })
    .await;

    let task = alice.book().add_todo(Day::Friday, "groceries", true).await.unwrap();
    eventually("bob to apply", || async {
        bob.book().todos(Day::Friday).await.unwrap() == vec![task.clone()]
    })
    .await;

    bob.book().delete_todo(task.id.unwrap(), true).await.unwrap();
    eventually("alice to delete", || async {
        alice.book().todos(Day::Friday).await.unwrap().is_empty()
    })
    .await;

    assert_eq!(alice.sync().await.unwrap(), SyncRoute::Peers(1));
}

#[tokio::test]
async fn dialing_absent_peer_fails_fast() {
    let url = start_relay().await;
    let alice = peer(&url, "alice").await;

    let err = alice.manager().connect(Some(&PeerId::new("nobody"))).await.unwrap_err();
    assert!(matches!(err, PeerError::ConnectionError { .. }), "got {err:?}");
    assert_eq!(
        alice.manager().connection_state(&PeerId::new("nobody")),
        ConnectionState::Closed
    );
}

#[tokio::test]
async fn departed_peer_closes_the_link() {
    let url = start_relay().await;
    let alice = peer(&url, "alice").await;
    let bob = peer(&url, "bob").await;
    let bob_id = PeerId::new("bob");

    alice.connect(Some(&bob_id)).await.unwrap();
    eventually("link to open", || async { alice.is_peer_connected(&bob_id) }).await;

    bob.shutdown().await;
    eventually("alice to notice", || async { !alice.is_peer_connected(&bob_id) }).await;
    // Bob stays remembered and is handed to the reconnect scheduler.
    assert!(alice.identity().is_remembered(&bob_id));
}
