//! Two and three peer convergence over the loopback transport.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use weektodo::engine::SyncEngine;
use weektodo::peer::Identity;
use weektodo::peer::manager::ManagerOptions;
use weektodo::store::MemoryStore;
use weektodo::transport::PeerId;
use weektodo::transport::loopback::{LoopbackNetwork, LoopbackTransport};
use weektodo_proto::task::{Day, Task};

type Peer = SyncEngine<MemoryStore, LoopbackTransport>;

async fn peer(net: &LoopbackNetwork, id: &str) -> Peer {
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

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn monday(p: &Peer) -> Vec<Task> {
    p.book().todos(Day::Monday).await.unwrap()
}

async fn conflicting_pair(net: &LoopbackNetwork) -> (Peer, Peer, Task) {
    let a = peer(net, "a").await;
    let b = peer(net, "b").await;
    a.book()
        .insert_todo(Task::new(1, Day::Monday, "x", at(100)), false)
        .await
        .unwrap();
    let newer = Task::new(1, Day::Monday, "y", at(200));
    b.book().insert_todo(newer.clone(), false).await.unwrap();
    (a, b, newer)
}

#[tokio::test]
async fn older_side_dialing_converges_to_newer() {
    let net = LoopbackNetwork::new(64);
    let (a, b, newer) = conflicting_pair(&net).await;

    a.connect(Some(&PeerId::new("b"))).await.unwrap();

    eventually("a to adopt y", || async { monday(&a).await == vec![newer.clone()] }).await;
    assert_eq!(monday(&b).await, vec![newer]);
}

#[tokio::test]
async fn newer_side_dialing_converges_to_newer() {
    let net = LoopbackNetwork::new(64);
    let (a, b, newer) = conflicting_pair(&net).await;

    b.connect(Some(&PeerId::new("a"))).await.unwrap();

    eventually("a to adopt y", || async { monday(&a).await == vec![newer.clone()] }).await;
    assert_eq!(monday(&b).await, vec![newer]);
}

#[tokio::test]
async fn applied_mutation_is_not_rebroadcast() {
    let net = LoopbackNetwork::new(64);
    let a = peer(&net, "a").await;
    let b = peer(&net, "b").await;
    let c = peer(&net, "c").await;
    a.connect(Some(&PeerId::new("b"))).await.unwrap();
    b.connect(Some(&PeerId::new("c"))).await.unwrap();
    eventually("links to settle", || async {
        a.manager().is_synced(&PeerId::new("b")) && b.manager().is_synced(&PeerId::new("c"))
    })
    .await;

    let task = a.book().add_todo(Day::Wednesday, "from a", true).await.unwrap();
    eventually("b to apply", || async {
        b.book().todos(Day::Wednesday).await.unwrap() == vec![task.clone()]
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(c.book().todos(Day::Wednesday).await.unwrap().is_empty());
}

#[tokio::test]
async fn moved_task_lives_in_exactly_one_day() {
    let net = LoopbackNetwork::new(64);
    let a = peer(&net, "a").await;
    let b = peer(&net, "b").await;
    a.connect(Some(&PeerId::new("b"))).await.unwrap();

    let task = a.book().add_todo(Day::Monday, "walk", true).await.unwrap();
    let id = task.id.unwrap();
    eventually("b to receive", || async { monday(&b).await.len() == 1 }).await;

    a.book().move_todo_to_day(id, Day::Thursday, true).await.unwrap();
    eventually("b to move", || async {
        b.book().todos(Day::Thursday).await.unwrap().len() == 1
    })
    .await;

    let all = b.book().all_todos().await.unwrap();
    assert_eq!(all.iter().filter(|t| t.id == Some(id)).count(), 1);
    assert!(monday(&b).await.is_empty());
}

#[tokio::test]
async fn deletes_propagate() {
    let net = LoopbackNetwork::new(64);
    let a = peer(&net, "a").await;
    let b = peer(&net, "b").await;
    a.connect(Some(&PeerId::new("b"))).await.unwrap();

    let task = a.book().add_todo(Day::Saturday, "laundry", true).await.unwrap();
    eventually("b to receive", || async {
        b.book().todos(Day::Saturday).await.unwrap().len() == 1
    })
    .await;

    assert!(b.book().delete_todo(task.id.unwrap(), true).await.unwrap());
    eventually("a to delete", || async {
        a.book().todos(Day::Saturday).await.unwrap().is_empty()
    })
    .await;
}

#[tokio::test]
async fn export_then_import_reproduces_collection() {
    let net = LoopbackNetwork::new(8);
    let a = peer(&net, "a").await;
    a.book().add_todo(Day::Monday, "one", false).await.unwrap();
    a.book().add_todo(Day::Monday, "two", false).await.unwrap();
    a.book().add_todo(Day::Sunday, "three", false).await.unwrap();

    let exported = a.book().export_data().await.unwrap();
    let fresh = peer(&net, "fresh").await;
    assert_eq!(fresh.book().import_data(&exported).await.unwrap(), 3);
    assert_eq!(
        fresh.book().all_todos().await.unwrap(),
        a.book().all_todos().await.unwrap()
    );
}
