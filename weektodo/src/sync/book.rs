//! The task collection as the rest of the application sees it.
//!
//! [`TaskBook`] owns the bucket-locked [`Ledger`] and is the only place tasks
//! are mutated. Local mutations stamp `lastModified` and, when asked to,
//! publish an envelope to the outbox; the engine forwards the outbox to every
//! open connection. Mutations that arrive from the network go through
//! [`TaskBook::apply_remote`], which keeps the sender's ids and timestamps and
//! never publishes, so a received change is not echoed back.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use weektodo_proto::codec;
use weektodo_proto::merge::{self, MergeOutcome};
use weektodo_proto::message::{Envelope, Payload};
use weektodo_proto::task::{Day, Task, TaskId};

use crate::store::{Buckets, Ledger, StoreError, TaskStore};

/// Hands out time-derived, strictly increasing task ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last: AtomicI64,
}

impl IdAllocator {
    /// Next id: the current time in milliseconds, or one past the last id
    /// handed out or observed if the clock has not moved past it.
    ///
    /// # Errors
    ///
    /// [`StoreError::IdsExhausted`] once `i64::MAX` has been handed out or
    /// observed.
    pub fn next(&self) -> Result<TaskId, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = last.checked_add(1).ok_or(StoreError::IdsExhausted)?.max(now);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Ok(TaskId::new(candidate)),
                Err(actual) => last = actual,
            }
        }
    }

    /// Records an id created elsewhere so it is never handed out here.
    pub fn observe(&self, id: TaskId) {
        self.last.fetch_max(id.get(), Ordering::SeqCst);
    }
}

/// Receiving end of a book's outbox.
pub type Outbox = mpsc::UnboundedReceiver<Envelope>;

/// Task collection with local and remote mutation entry points.
#[derive(Debug)]
pub struct TaskBook<S> {
    ledger: Ledger<S>,
    ids: IdAllocator,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl<S: TaskStore> TaskBook<S> {
    /// Wraps `store`, seeding the id allocator from the tasks already in it.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn open(store: S) -> Result<(Self, Outbox), StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let book = Self {
            ledger: Ledger::new(store),
            ids: IdAllocator::default(),
            outbox: tx,
        };
        for task in book.ledger.snapshot().await? {
            if let Some(id) = task.id {
                book.ids.observe(id);
            }
        }
        Ok((book, rx))
    }

    /// The bucket-locked store underneath.
    pub const fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    /// Ordered tasks of one day.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn todos(&self, day: Day) -> Result<Vec<Task>, StoreError> {
        self.ledger.todos(day).await
    }

    /// Every task, in week order.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn all_todos(&self) -> Result<Vec<Task>, StoreError> {
        self.ledger.snapshot().await
    }

    fn publish(&self, envelope: Envelope) {
        let kind = envelope.payload.type_name();
        if self.outbox.send(envelope).is_err() {
            tracing::debug!(kind, "outbox closed, change not broadcast");
        }
    }

    /// Creates a task at the end of `day`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; nothing is published if the write fails.
    pub async fn add_todo(
        &self,
        day: Day,
        content: impl Into<String>,
        broadcast: bool,
    ) -> Result<Task, StoreError> {
        let task = Task {
            id: Some(self.ids.next()?),
            day,
            content: content.into(),
            last_modified: Some(Utc::now()),
        };
        let stored = task.clone();
        self.ledger
            .update(&[day], move |b| {
                b.get_mut(day).push(stored);
                Ok(())
            })
            .await?;
        tracing::debug!(task_id = ?task.id, day = %day, "task added");
        if broadcast {
            self.publish(Envelope::todo_added(task.clone()));
        }
        Ok(task)
    }

    /// Stores a complete task as given, replacing any version with the same
    /// id. A task already in the right day keeps its position; otherwise it
    /// is appended to its day.
    ///
    /// # Errors
    ///
    /// [`StoreError::MissingId`] if the task has no id, or a backend failure.
    pub async fn insert_todo(&self, task: Task, broadcast: bool) -> Result<(), StoreError> {
        let id = task.id.ok_or(StoreError::MissingId)?;
        self.ids.observe(id);
        let day = task.day;
        let stored = task.clone();
        self.ledger
            .update_task(id, &[day], move |b, here| {
                upsert(b, here, stored.clone());
                Ok(())
            })
            .await?;
        if broadcast {
            self.publish(Envelope::todo_added(task));
        }
        Ok(())
    }

    /// Deletes a task from whichever day holds it.
    ///
    /// Returns `false` if no such task exists; nothing is published then.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn delete_todo(&self, id: TaskId, broadcast: bool) -> Result<bool, StoreError> {
        let removed = self
            .ledger
            .update_task(id, &[], |b, _| Ok(b.take(id).is_some()))
            .await?;
        if removed {
            tracing::debug!(task_id = %id, "task deleted");
            if broadcast {
                self.publish(Envelope::todo_deleted(id));
            }
        }
        Ok(removed)
    }

    /// Moves a task to the end of `new_day` and stamps it.
    ///
    /// The task leaves its old day and enters the new one in a single
    /// commit, so it is never visible in two days or in none.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no such task exists, or a backend failure.
    pub async fn move_todo_to_day(
        &self,
        id: TaskId,
        new_day: Day,
        broadcast: bool,
    ) -> Result<Task, StoreError> {
        let now = Utc::now();
        let moved = self
            .ledger
            .update_task(id, &[new_day], |b, _| {
                let mut task = b.take(id).ok_or(StoreError::NotFound(id))?;
                task.day = new_day;
                task.last_modified = Some(now);
                b.get_mut(new_day).push(task.clone());
                Ok(task)
            })
            .await?;
        tracing::debug!(task_id = %id, day = %new_day, "task moved");
        if broadcast {
            self.publish(Envelope::todo_moved(moved.clone(), new_day));
        }
        Ok(moved)
    }

    /// Replaces the content of `day` with `todos`, in that order, stamping
    /// every entry. Tasks in the list that sat in another day leave it.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn update_todo_order(
        &self,
        day: Day,
        todos: Vec<Task>,
        broadcast: bool,
    ) -> Result<Vec<Task>, StoreError> {
        let ordered = self.reorder(day, todos, Some(Utc::now())).await?;
        if broadcast {
            self.publish(Envelope::order_updated(day, ordered.clone()));
        }
        Ok(ordered)
    }

    async fn reorder(
        &self,
        day: Day,
        todos: Vec<Task>,
        stamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<Task>, StoreError> {
        let ordered: Vec<Task> = todos
            .into_iter()
            .map(|mut t| {
                t.day = day;
                if stamp.is_some() {
                    t.last_modified = stamp;
                }
                t
            })
            .collect();
        for id in ordered.iter().filter_map(|t| t.id) {
            self.ids.observe(id);
        }
        let stored = ordered.clone();
        self.ledger
            .update_all(move |b| {
                for id in stored.iter().filter_map(|t| t.id) {
                    b.take(id);
                }
                *b.get_mut(day) = stored;
                Ok(())
            })
            .await?;
        tracing::debug!(day = %day, count = ordered.len(), "day reordered");
        Ok(ordered)
    }

    /// Serializes the whole collection, every day, in week order.
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn export_data(&self) -> Result<String, StoreError> {
        let all = self.ledger.snapshot().await?;
        codec::export_tasks(&all).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Replaces every day with the content of an export. Returns the number
    /// of tasks imported.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialization`] if `data` is not an export; the
    /// collection is left untouched then.
    pub async fn import_data(&self, data: &str) -> Result<usize, StoreError> {
        let tasks = codec::decode_tasks(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
        for id in tasks.iter().filter_map(|t| t.id) {
            self.ids.observe(id);
        }
        let count = tasks.len();
        self.ledger
            .update_all(move |b| {
                b.replace_all(tasks);
                Ok(())
            })
            .await?;
        tracing::info!(count, "collection imported");
        Ok(count)
    }

    /// Merges a remote collection with last-write-wins and persists the
    /// result.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn merge_remote(&self, incoming: Vec<Task>) -> Result<MergeOutcome, StoreError> {
        for id in incoming.iter().filter_map(|t| t.id) {
            self.ids.observe(id);
        }
        let outcome = self
            .ledger
            .update_all(move |b| {
                let local: Vec<Task> = b.iter().cloned().collect();
                let outcome = merge::resolve(&local, &incoming);
                if outcome.changed() {
                    b.replace_all(outcome.tasks.clone());
                }
                Ok(outcome)
            })
            .await?;
        if outcome.skipped > 0 {
            tracing::warn!(skipped = outcome.skipped, "incoming tasks without id ignored");
        }
        tracing::debug!(
            replaced = outcome.replaced,
            inserted = outcome.inserted,
            "remote collection merged"
        );
        Ok(outcome)
    }

    /// Applies a point mutation received from a peer. Never publishes.
    ///
    /// Sync payloads are not point mutations and are ignored here.
    ///
    /// # Errors
    ///
    /// [`StoreError::MissingId`] for a task without an id, or a backend failure.
    pub async fn apply_remote(&self, payload: Payload) -> Result<(), StoreError> {
        match payload {
            Payload::TodoAdded { todo } => self.insert_todo(todo, false).await,
            Payload::TodoDeleted { todo_id } => self.delete_todo(todo_id, false).await.map(|_| ()),
            Payload::TodoMoved { mut todo, new_day } => {
                todo.day = new_day;
                self.insert_todo(todo, false).await
            }
            Payload::TodoOrderUpdated { day, todos } => self.reorder(day, todos, None).await.map(|_| ()),
            Payload::SyncRequest | Payload::SyncResponse { .. } | Payload::SyncImport { .. } => Ok(()),
        }
    }
}

/// Places `task` in its day, replacing any copy with the same id.
fn upsert(b: &mut Buckets, here: Option<Day>, task: Task) {
    let day = task.day;
    match (here, task.id) {
        (Some(current), Some(id)) if current == day => {
            if let Some((_, pos)) = b.find(id) {
                b.get_mut(day)[pos] = task;
            }
        }
        (Some(_), Some(id)) => {
            b.take(id);
            b.get_mut(day).push(task);
        }
        _ => b.get_mut(day).push(task),
    }
}
