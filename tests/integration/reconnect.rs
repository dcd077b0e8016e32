//! Connection timeout, bounded reconnection, and recovery, on paused time.

use std::time::Duration;

use weektodo::engine::{SyncEngine, SyncError};
use weektodo::peer::manager::ManagerOptions;
use weektodo::peer::{ConnectionState, Identity, PeerError};
use weektodo::store::MemoryStore;
use weektodo::transport::PeerId;
use weektodo::transport::loopback::{LoopbackNetwork, LoopbackTransport};

async fn peer(net: &LoopbackNetwork, id: &str) -> SyncEngine<MemoryStore, LoopbackTransport> {
    SyncEngine::init(
        MemoryStore::new(),
        net.endpoint(id),
        Identity::ephemeral(id),
        None,
        ManagerOptions::default(),
    )
    .await
    .unwrap()
}

async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_then_one_retry_is_scheduled() {
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, "a").await;
    let abc = PeerId::new("abc");
    let _silent = net.endpoint("abc");
    net.set_silent(&abc, true);

    let started = tokio::time::Instant::now();
    let err = a.connect(Some(&abc)).await.unwrap_err();
    assert!(matches!(err, SyncError::Peer(PeerError::ConnectionTimeout(ref p)) if *p == abc));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_millis(5_100));

    advance(10).await;
    assert_eq!(a.manager().scheduler().attempts(&abc), Some(0));

    // First retry fires one interval later and is counted before dialing.
    advance(5_000).await;
    assert_eq!(a.manager().scheduler().attempts(&abc), Some(1));
    assert_eq!(a.manager().connection_state(&abc), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_is_dropped_after_three_retries() {
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, "a").await;
    let b = PeerId::new("b");
    let _b = net.endpoint("b");
    net.set_online(&b, false);

    assert!(a.connect(Some(&b)).await.is_err());
    assert!(a.identity().is_remembered(&b));

    // Retries at 5 s, 15 s and 30 s.
    advance(5_100).await;
    assert_eq!(a.manager().scheduler().attempts(&b), Some(1));
    advance(10_000).await;
    assert_eq!(a.manager().scheduler().attempts(&b), Some(2));
    advance(15_000).await;

    advance(100).await;
    assert_eq!(a.manager().scheduler().attempts(&b), None);
    assert!(!a.identity().is_remembered(&b));

    // No further attempts once dropped, even with the health check running.
    net.set_online(&b, true);
    advance(60_000).await;
    assert!(!a.is_peer_connected(&b));
    assert!(a.manager().scheduler().pending().is_empty());
}

#[tokio::test(start_paused = true)]
async fn severed_link_is_restored_by_the_scheduler() {
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, "a").await;
    let _b = peer(&net, "b").await;
    let b = PeerId::new("b");

    a.connect(Some(&b)).await.unwrap();
    advance(10).await;
    assert!(a.is_peer_connected(&b));

    net.sever(&b);
    advance(10).await;
    assert!(!a.is_peer_connected(&b));

    advance(5_100).await;
    assert!(a.is_peer_connected(&b));
    assert_eq!(a.manager().scheduler().attempts(&b), None);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retries() {
    let net = LoopbackNetwork::new(16);
    let a = peer(&net, "a").await;
    let b = PeerId::new("b");
    let _b = net.endpoint("b");
    net.set_online(&b, false);

    assert!(a.connect(Some(&b)).await.is_err());
    advance(10).await;
    assert_eq!(a.manager().scheduler().attempts(&b), Some(0));

    a.disconnect(Some(&b)).await;
    assert_eq!(a.manager().scheduler().attempts(&b), None);
    assert!(!a.identity().is_remembered(&b));

    net.set_online(&b, true);
    advance(30_000).await;
    assert!(!a.is_peer_connected(&b));
}
