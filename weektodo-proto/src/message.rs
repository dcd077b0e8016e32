//! Peer-to-peer sync envelope.
//!
//! Every frame exchanged over a peer link is a JSON object carrying a `type`
//! discriminator, an optional sender `peerId`, and the payload fields of that
//! type flattened beside it:
//!
//! ```json
//! { "type": "TODO_MOVED", "peerId": "...", "todo": { ... }, "newDay": "Friday" }
//! ```
//!
//! Decoding lives in [`crate::codec`], which validates the shape before a
//! frame is dispatched and also accepts the legacy type names.

use serde::Serialize;

use crate::task::{Day, Task, TaskId};

/// Wire name of a sync request.
pub const SYNC_REQUEST: &str = "SYNC_REQUEST";
/// Wire name of a sync response.
pub const SYNC_RESPONSE: &str = "SYNC_RESPONSE";
/// Wire name of a task creation.
pub const TODO_ADDED: &str = "TODO_ADDED";
/// Wire name of a task deletion.
pub const TODO_DELETED: &str = "TODO_DELETED";
/// Wire name of a task moving between days.
pub const TODO_MOVED: &str = "TODO_MOVED";
/// Wire name of a bucket reorder.
pub const TODO_ORDER_UPDATED: &str = "TODO_ORDER_UPDATED";
/// Legacy point-mutation type whose meaning is carried by an `action` field.
pub const LEGACY_TODO_UPDATE: &str = "todo_update";

/// Payload of a sync envelope, tagged by its wire type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Ask the remote side for its full collection.
    #[serde(rename = "SYNC_REQUEST")]
    SyncRequest,
    /// Full collection, merged by the receiver with last-write-wins.
    #[serde(rename = "SYNC_RESPONSE")]
    SyncResponse {
        /// Every task the sender holds, in day order.
        todos: Vec<Task>,
    },
    /// Full collection as a serialized export string, imported by the
    /// receiver as a replacement of every bucket.
    #[serde(rename = "sync_response")]
    SyncImport {
        /// Export produced by [`crate::codec::export_tasks`].
        data: String,
    },
    /// A task was created on the sender.
    #[serde(rename = "TODO_ADDED")]
    TodoAdded {
        /// The created task, id and timestamp included.
        todo: Task,
    },
    /// A task was deleted on the sender.
    #[serde(rename = "TODO_DELETED", rename_all = "camelCase")]
    TodoDeleted {
        /// Id of the deleted task.
        todo_id: TaskId,
    },
    /// A task moved to another day on the sender.
    #[serde(rename = "TODO_MOVED", rename_all = "camelCase")]
    TodoMoved {
        /// The task as it was before the move.
        todo: Task,
        /// Destination bucket.
        new_day: Day,
    },
    /// A bucket's order was replaced on the sender.
    #[serde(rename = "TODO_ORDER_UPDATED")]
    TodoOrderUpdated {
        /// Bucket being reordered.
        day: Day,
        /// New content of the bucket, in order.
        todos: Vec<Task>,
    },
}

impl Payload {
    /// Canonical wire name of this payload's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SyncRequest => SYNC_REQUEST,
            Self::SyncResponse { .. } | Self::SyncImport { .. } => SYNC_RESPONSE,
            Self::TodoAdded { .. } => TODO_ADDED,
            Self::TodoDeleted { .. } => TODO_DELETED,
            Self::TodoMoved { .. } => TODO_MOVED,
            Self::TodoOrderUpdated { .. } => TODO_ORDER_UPDATED,
        }
    }

    /// Returns `true` for the single-task mutations that are applied
    /// directly to the store rather than through the merge resolver.
    #[must_use]
    pub const fn is_point_mutation(&self) -> bool {
        matches!(
            self,
            Self::TodoAdded { .. }
                | Self::TodoDeleted { .. }
                | Self::TodoMoved { .. }
                | Self::TodoOrderUpdated { .. }
        )
    }
}

/// A message exchanged between two peers. Immutable once sent; carries value
/// copies of tasks only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    /// Sender identity, when the sender chose to include it.
    #[serde(rename = "peerId", skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Type-tagged payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Wraps a payload without a sender id.
    #[must_use]
    pub const fn new(payload: Payload) -> Self {
        Self {
            peer_id: None,
            payload,
        }
    }

    /// Stamps the sender id onto the envelope.
    #[must_use]
    pub fn from_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// `SYNC_REQUEST`.
    #[must_use]
    pub const fn sync_request() -> Self {
        Self::new(Payload::SyncRequest)
    }

    /// `SYNC_RESPONSE` carrying a full collection.
    #[must_use]
    pub const fn sync_response(todos: Vec<Task>) -> Self {
        Self::new(Payload::SyncResponse { todos })
    }

    /// `TODO_ADDED`.
    #[must_use]
    pub const fn todo_added(todo: Task) -> Self {
        Self::new(Payload::TodoAdded { todo })
    }

    /// `TODO_DELETED`.
    #[must_use]
    pub const fn todo_deleted(todo_id: TaskId) -> Self {
        Self::new(Payload::TodoDeleted { todo_id })
    }

    /// `TODO_MOVED`.
    #[must_use]
    pub const fn todo_moved(todo: Task, new_day: Day) -> Self {
        Self::new(Payload::TodoMoved { todo, new_day })
    }

    /// `TODO_ORDER_UPDATED`.
    #[must_use]
    pub const fn order_updated(day: Day, todos: Vec<Task>) -> Self {
        Self::new(Payload::TodoOrderUpdated { day, todos })
    }
}
