//! Inbound message handling for peer connections.

use std::sync::Arc;

use chrono::Utc;
use weektodo_proto::codec::{self, CodecError};
use weektodo_proto::message::{Envelope, Payload};

use crate::peer::identity::Identity;
use crate::peer::{Dispatch, MessageHandler};
use crate::store::TaskStore;
use crate::sync::book::TaskBook;
use crate::transport::PeerId;

/// Applies sync envelopes to a [`TaskBook`].
///
/// - `SYNC_REQUEST` is answered with a `SYNC_RESPONSE` holding every task.
/// - `SYNC_RESPONSE` is merged with last-write-wins and records `lastSync`.
/// - Point mutations are applied directly, without publishing.
/// - Malformed frames and unknown types are logged and dropped.
pub struct SyncHandler<S> {
    book: Arc<TaskBook<S>>,
    identity: Arc<Identity>,
}

impl<S> SyncHandler<S> {
    /// Creates a handler for `book`, stamping replies with `identity`.
    pub const fn new(book: Arc<TaskBook<S>>, identity: Arc<Identity>) -> Self {
        Self { book, identity }
    }
}

impl<S: TaskStore + 'static> SyncHandler<S> {
    async fn record_sync(&self, peer: &PeerId) {
        self.identity.mark_synced(Utc::now());
        if let Err(e) = self.identity.persist().await {
            tracing::warn!(peer_id = %peer, err = %e, "could not persist sync time");
        }
    }
}

impl<S: TaskStore + 'static> MessageHandler for SyncHandler<S> {
    fn on_open(&self, _peer: &PeerId) -> Option<Envelope> {
        Some(Envelope::sync_request().from_peer(self.identity.peer_id().as_str()))
    }

    async fn on_message(&self, peer: &PeerId, frame: &[u8]) -> Dispatch {
        let envelope = match codec::decode(frame) {
            Ok(env) => env,
            Err(CodecError::UnknownType(kind)) => {
                tracing::warn!(peer_id = %peer, kind = %kind, "unknown message type, dropped");
                return Dispatch::default();
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer, err = %e, "malformed message, dropped");
                return Dispatch::default();
            }
        };

        let kind = envelope.payload.type_name();
        tracing::debug!(peer_id = %peer, kind, "message received");

        match envelope.payload {
            Payload::SyncRequest => match self.book.all_todos().await {
                Ok(todos) => Dispatch::reply(
                    Envelope::sync_response(todos).from_peer(self.identity.peer_id().as_str()),
                ),
                Err(e) => {
                    tracing::error!(peer_id = %peer, err = %e, "could not export for sync response");
                    Dispatch::default()
                }
            },
            Payload::SyncResponse { todos } => match self.book.merge_remote(todos).await {
                Ok(outcome) => {
                    tracing::info!(
                        peer_id = %peer,
                        replaced = outcome.replaced,
                        inserted = outcome.inserted,
                        "synced with peer"
                    );
                    self.record_sync(peer).await;
                    Dispatch::synced()
                }
                Err(e) => {
                    tracing::error!(peer_id = %peer, err = %e, "merge failed");
                    Dispatch::default()
                }
            },
            Payload::SyncImport { data } => match self.book.import_data(&data).await {
                Ok(count) => {
                    tracing::info!(peer_id = %peer, count, "imported collection from peer");
                    self.record_sync(peer).await;
                    Dispatch::synced()
                }
                Err(e) => {
                    tracing::error!(peer_id = %peer, err = %e, "import from peer failed");
                    Dispatch::default()
                }
            },
            payload => {
                if let Err(e) = self.book.apply_remote(payload).await {
                    tracing::warn!(peer_id = %peer, kind, err = %e, "could not apply remote change");
                }
                Dispatch::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use weektodo_proto::task::{Day, Task, TaskId};

    async fn handler() -> (SyncHandler<MemoryStore>, Arc<TaskBook<MemoryStore>>) {
        let (book, _outbox) = TaskBook::open(MemoryStore::new()).await.unwrap();
        let book = Arc::new(book);
        let identity = Arc::new(Identity::ephemeral("local"));
        (SyncHandler::new(Arc::clone(&book), identity), book)
    }

    fn frame(env: &Envelope) -> Vec<u8> {
        codec::encode(env).unwrap()
    }

    #[tokio::test]
    async fn open_sends_sync_request() {
        let (h, _) = handler().await;
        let env = h.on_open(&PeerId::new("remote")).unwrap();
        assert_eq!(env.payload, Payload::SyncRequest);
        assert_eq!(env.peer_id.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn sync_request_is_answered_with_everything() {
        let (h, book) = handler().await;
        book.add_todo(Day::Monday, "a", false).await.unwrap();
        book.add_todo(Day::Friday, "b", false).await.unwrap();

        let out = h
            .on_message(&PeerId::new("remote"), &frame(&Envelope::sync_request()))
            .await;
        let reply = out.reply.unwrap();
        match reply.payload {
            Payload::SyncResponse { todos } => assert_eq!(todos.len(), 2),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_response_merges_and_marks_synced() {
        let (h, book) = handler().await;
        let incoming = vec![Task::new(1, Day::Tuesday, "t", Utc::now())];
        let out = h
            .on_message(
                &PeerId::new("remote"),
                &frame(&Envelope::sync_response(incoming.clone())),
            )
            .await;
        assert!(out.synced);
        assert!(out.reply.is_none());
        assert_eq!(book.all_todos().await.unwrap(), incoming);
    }

    #[tokio::test]
    async fn garbage_is_dropped_without_state_change() {
        let (h, book) = handler().await;
        book.add_todo(Day::Monday, "keep", false).await.unwrap();
        for bad in [&b"not json"[..], br#"{"type":"NOPE"}"#, br#"{"type":"TODO_ADDED"}"#] {
            let out = h.on_message(&PeerId::new("remote"), bad).await;
            assert!(out.reply.is_none());
            assert!(!out.synced);
        }
        assert_eq!(book.all_todos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn point_mutations_apply_directly() {
        let (h, book) = handler().await;
        let task = Task::new(7, Day::Sunday, "rest", Utc::now());
        h.on_message(&PeerId::new("r"), &frame(&Envelope::todo_added(task)))
            .await;
        assert_eq!(book.todos(Day::Sunday).await.unwrap().len(), 1);
        h.on_message(
            &PeerId::new("r"),
            &frame(&Envelope::todo_deleted(TaskId::new(7))),
        )
        .await;
        assert!(book.all_todos().await.unwrap().is_empty());
    }
}
