//! Task synchronization: the mutation API, inbound message handling, and the
//! last-write-wins resolver they share with the relay.

pub mod book;
pub mod handler;

pub use book::{IdAllocator, Outbox, TaskBook};
pub use handler::SyncHandler;
pub use weektodo_proto::merge;
