//! Durable task storage, partitioned by day bucket.
//!
//! [`TaskStore`] is the backend seam: [`memory::MemoryStore`] keeps buckets in
//! process memory, [`file::FileStore`] persists them to a JSON file. Callers
//! never write to a backend directly; they go through [`ledger::Ledger`],
//! which serializes writers per bucket.

pub mod file;
pub mod ledger;
pub mod memory;

use std::future::Future;

use weektodo_proto::task::{Day, Task, TaskId};

pub use file::FileStore;
pub use ledger::{Buckets, Ledger};
pub use memory::MemoryStore;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing medium failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored or imported data could not be (de)serialized.
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// No task with this id exists in any bucket.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The operation requires a task id and none was given.
    #[error("task has no id")]
    MissingId,

    /// Every task id up to `i64::MAX` is taken.
    #[error("task ids exhausted")]
    IdsExhausted,
}

/// Keyed storage of tasks indexed by day bucket.
///
/// Implementations must make [`TaskStore::commit`] all-or-nothing: either
/// every bucket in the batch is replaced, or none is and an error is
/// returned.
pub trait TaskStore: Send + Sync {
    /// Returns the ordered content of one bucket.
    fn get_todos(&self, day: Day) -> impl Future<Output = Result<Vec<Task>, StoreError>> + Send;

    /// Replaces the content of several buckets at once.
    fn commit(
        &self,
        batch: Vec<(Day, Vec<Task>)>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replaces the content of one bucket.
    fn put_all(
        &self,
        day: Day,
        todos: Vec<Task>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.commit(vec![(day, todos)])
    }
}
