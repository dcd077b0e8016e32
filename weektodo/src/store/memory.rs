//! In-process task store.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use weektodo_proto::task::{Day, Task};

use super::{StoreError, TaskStore};

/// Task store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<Day, Vec<Task>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with `tasks`, each placed in its own day.
    #[must_use]
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            buckets: RwLock::new(weektodo_proto::merge::group_by_day(tasks)),
        }
    }
}

impl TaskStore for MemoryStore {
    async fn get_todos(&self, day: Day) -> Result<Vec<Task>, StoreError> {
        Ok(self.buckets.read().get(&day).cloned().unwrap_or_default())
    }

    async fn commit(&self, batch: Vec<(Day, Vec<Task>)>) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write();
        for (day, todos) in batch {
            buckets.insert(day, todos);
        }
        Ok(())
    }
}
