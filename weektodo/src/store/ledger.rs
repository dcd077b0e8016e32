//! Bucket-locked access to a [`TaskStore`].
//!
//! Every write goes through [`Ledger::update`], which takes the per-day locks
//! it needs (always in week order, so two writers never deadlock), loads those
//! buckets, lets the caller edit them, and commits the edited buckets in one
//! batch. Writers on the same day are serialized; writers on different days
//! run concurrently. Single-bucket reads take no lock; a whole-collection
//! [`Ledger::snapshot`] holds every bucket lock so it never sees a task
//! halfway through a move.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::Mutex;
use weektodo_proto::merge::group_by_day;
use weektodo_proto::task::{Day, Task, TaskId};

use super::{StoreError, TaskStore};

/// Optimistic attempts at locking only the bucket a task was last seen in
/// before falling back to locking every bucket.
const LOCATE_ATTEMPTS: usize = 3;

/// The locked buckets handed to an update closure.
#[derive(Debug)]
pub struct Buckets {
    days: BTreeMap<Day, Vec<Task>>,
    dirty: BTreeSet<Day>,
}

impl Buckets {
    async fn load<S: TaskStore>(store: &S, days: &[Day]) -> Result<Self, StoreError> {
        let mut loaded = BTreeMap::new();
        for day in days {
            loaded.insert(*day, store.get_todos(*day).await?);
        }
        Ok(Self {
            days: loaded,
            dirty: BTreeSet::new(),
        })
    }

    /// Returns `true` if `day` is locked by this update.
    #[must_use]
    pub fn holds(&self, day: Day) -> bool {
        self.days.contains_key(&day)
    }

    /// Read access to a locked bucket.
    #[must_use]
    pub fn get(&self, day: Day) -> &[Task] {
        self.days.get(&day).map_or(&[], Vec::as_slice)
    }

    /// Write access to a locked bucket; the bucket is committed afterwards.
    pub fn get_mut(&mut self, day: Day) -> &mut Vec<Task> {
        debug_assert!(self.holds(day), "bucket {day} is not locked");
        self.dirty.insert(day);
        self.days.entry(day).or_default()
    }

    /// Finds a task among the locked buckets.
    #[must_use]
    pub fn find(&self, id: TaskId) -> Option<(Day, usize)> {
        self.days.iter().find_map(|(day, todos)| {
            todos
                .iter()
                .position(|t| t.id == Some(id))
                .map(|pos| (*day, pos))
        })
    }

    /// Removes a task from whichever locked bucket holds it.
    pub fn take(&mut self, id: TaskId) -> Option<Task> {
        let (day, pos) = self.find(id)?;
        Some(self.get_mut(day).remove(pos))
    }

    /// All tasks in the locked buckets, in week order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.days.values().flatten()
    }

    /// Replaces every locked bucket with the matching part of `tasks`.
    ///
    /// Tasks whose day is not locked are dropped, so callers replacing the
    /// whole collection must lock every day.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        let mut grouped = group_by_day(tasks);
        let locked: Vec<Day> = self.days.keys().copied().collect();
        for day in locked {
            *self.get_mut(day) = grouped.remove(&day).unwrap_or_default();
        }
    }

    fn into_batch(mut self) -> Vec<(Day, Vec<Task>)> {
        self.dirty
            .iter()
            .map(|day| (*day, self.days.remove(day).unwrap_or_default()))
            .collect()
    }
}

/// Serialized, bucket-atomic access to a task store.
#[derive(Debug)]
pub struct Ledger<S> {
    store: S,
    locks: [Mutex<()>; 7],
}

impl<S: TaskStore> Ledger<S> {
    /// Wraps a store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Ordered content of one bucket.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn todos(&self, day: Day) -> Result<Vec<Task>, StoreError> {
        self.store.get_todos(day).await
    }

    /// Every task, in week order, read under every bucket lock.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        let mut guards = Vec::with_capacity(self.locks.len());
        for lock in &self.locks {
            guards.push(lock.lock().await);
        }
        let mut all = Vec::new();
        for day in Day::ALL {
            all.extend(self.store.get_todos(day).await?);
        }
        drop(guards);
        Ok(all)
    }

    /// Day a task currently sits in, without locking.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn locate(&self, id: TaskId) -> Result<Option<Day>, StoreError> {
        for day in Day::ALL {
            if self.store.get_todos(day).await?.iter().any(|t| t.id == Some(id)) {
                return Ok(Some(day));
            }
        }
        Ok(None)
    }

    /// Locks `days`, runs `edit` on them, and commits the buckets it touched.
    ///
    /// Nothing is written if `edit` fails or touches no bucket.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or the backend's read or commit failure.
    pub async fn update<R, F>(&self, days: &[Day], edit: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Buckets) -> Result<R, StoreError> + Send,
        R: Send,
    {
        let mut wanted = days.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mut guards = Vec::with_capacity(wanted.len());
        for day in &wanted {
            guards.push(self.locks[day.index()].lock().await);
        }

        let mut buckets = Buckets::load(&self.store, &wanted).await?;
        let out = edit(&mut buckets)?;
        if !buckets.dirty.is_empty() {
            self.store.commit(buckets.into_batch()).await?;
        }
        drop(guards);
        Ok(out)
    }

    /// Locks every bucket; used for whole-collection merges and imports.
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::update`].
    pub async fn update_all<R, F>(&self, edit: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Buckets) -> Result<R, StoreError> + Send,
        R: Send,
    {
        self.update(&Day::ALL, edit).await
    }

    /// Locks the bucket holding task `id` plus `extra`, then runs `edit`
    /// with the day the task is in (`None` if it exists nowhere).
    ///
    /// The task is located without a lock first; if it moved before the lock
    /// was taken the attempt is repeated, and after a few misses every bucket
    /// is locked. Absence is only reported with every bucket locked.
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::update`].
    pub async fn update_task<R, F>(&self, id: TaskId, extra: &[Day], mut edit: F) -> Result<R, StoreError>
    where
        F: FnMut(&mut Buckets, Option<Day>) -> Result<R, StoreError> + Send,
        R: Send,
    {
        for _ in 0..LOCATE_ATTEMPTS {
            let Some(seen) = self.locate(id).await? else {
                break;
            };
            let mut days = extra.to_vec();
            days.push(seen);
            let attempt = self
                .update(&days, |buckets| match buckets.find(id) {
                    Some((day, _)) => edit(buckets, Some(day)).map(Some),
                    None => Ok(None),
                })
                .await?;
            if let Some(out) = attempt {
                return Ok(out);
            }
            tracing::debug!(task_id = %id, "task moved while locking, retrying");
        }

        self.update_all(|buckets| {
            let here = buckets.find(id).map(|(day, _)| day);
            edit(buckets, here)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn task(id: i64, day: Day) -> Task {
        Task::new(id, day, format!("task {id}"), Utc::now())
    }

    #[tokio::test]
    async fn update_commits_only_touched_buckets() {
        let ledger = Ledger::new(MemoryStore::with_tasks([task(1, Day::Monday)]));
        ledger
            .update(&[Day::Monday, Day::Tuesday], |b| {
                b.get_mut(Day::Tuesday).push(task(2, Day::Tuesday));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(ledger.todos(Day::Monday).await.unwrap().len(), 1);
        assert_eq!(ledger.todos(Day::Tuesday).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_edit_writes_nothing() {
        let ledger = Ledger::new(MemoryStore::with_tasks([task(1, Day::Monday)]));
        let result: Result<(), _> = ledger
            .update(&[Day::Monday], |b| {
                b.get_mut(Day::Monday).clear();
                Err(StoreError::MissingId)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.todos(Day::Monday).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_task_reports_location() {
        let ledger = Ledger::new(MemoryStore::with_tasks([task(7, Day::Thursday)]));
        let day = ledger
            .update_task(TaskId::new(7), &[], |_, here| Ok(here))
            .await
            .unwrap();
        assert_eq!(day, Some(Day::Thursday));

        let missing = ledger
            .update_task(TaskId::new(8), &[], |b, here| {
                assert!(Day::ALL.iter().all(|d| b.holds(*d)));
                Ok(here)
            })
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn replace_all_regroups_by_day() {
        let ledger = Ledger::new(MemoryStore::with_tasks([task(1, Day::Monday)]));
        ledger
            .update_all(|b| {
                b.replace_all(vec![task(2, Day::Sunday), task(3, Day::Sunday)]);
                Ok(())
            })
            .await
            .unwrap();
        assert!(ledger.todos(Day::Monday).await.unwrap().is_empty());
        assert_eq!(ledger.todos(Day::Sunday).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_never_sees_a_task_mid_move() {
        let ledger = Arc::new(Ledger::new(MemoryStore::with_tasks([task(1, Day::Monday)])));
        let mover = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                for i in 0..2_000 {
                    let target = if i % 2 == 0 { Day::Sunday } else { Day::Monday };
                    ledger
                        .update_task(TaskId::new(1), &[target], |b, _| {
                            if let Some(mut t) = b.take(TaskId::new(1)) {
                                t.day = target;
                                b.get_mut(target).push(t);
                            }
                            Ok(())
                        })
                        .await
                        .unwrap();
                }
            })
        };

        while !mover.is_finished() {
            let all = ledger.snapshot().await.unwrap();
            assert_eq!(all.len(), 1, "snapshot saw {all:?}");
            tokio::task::yield_now().await;
        }
        mover.await.unwrap();
        assert_eq!(ledger.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_moves_never_duplicate() {
        let ledger = Arc::new(Ledger::new(MemoryStore::with_tasks([task(1, Day::Monday)])));
        let mut handles = Vec::new();
        for target in Day::ALL {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .update_task(TaskId::new(1), &[target], |b, here| {
                        if here.is_some() {
                            let mut t = b.take(TaskId::new(1)).unwrap();
                            t.day = target;
                            b.get_mut(target).push(t);
                        }
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let all = ledger.snapshot().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
