//! Pure last-write-wins merge of two task collections.
//!
//! Whole-record LWW keyed on task id: an incoming record replaces the local one
//! only when its `lastModified` is strictly later. Ties and incoming records
//! without a timestamp keep local. There are no tombstones, so a task deleted
//! here comes back if a stale peer still holds it.
//!
//! Output order is deterministic: local order (with winners substituted in
//! place), then previously unknown incoming tasks in incoming order, all
//! re-bucketed by day in week order.

use std::collections::{BTreeMap, HashMap};

use crate::task::{Day, Task, TaskId};

/// Result of [`resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merged collection in day order.
    pub tasks: Vec<Task>,
    /// Local records replaced by a later incoming version.
    pub replaced: usize,
    /// Incoming records that were not known locally.
    pub inserted: usize,
    /// Incoming records dropped because they carry no id.
    pub skipped: usize,
}

impl MergeOutcome {
    /// Returns `true` if the merge changed anything.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.replaced > 0 || self.inserted > 0
    }
}

/// Merges `incoming` into `local`.
///
/// Local drafts without an id are kept untouched.
#[must_use]
pub fn resolve(local: &[Task], incoming: &[Task]) -> MergeOutcome {
    let mut merged: Vec<Task> = local.to_vec();
    let mut index: HashMap<TaskId, usize> = HashMap::with_capacity(merged.len());
    for (pos, task) in merged.iter().enumerate() {
        if let Some(id) = task.id {
            index.entry(id).or_insert(pos);
        }
    }

    let mut outcome = MergeOutcome::default();
    for task in incoming {
        let Some(id) = task.id else {
            outcome.skipped += 1;
            continue;
        };
        if let Some(&pos) = index.get(&id) {
            if merged[pos].is_superseded_by(task) {
                merged[pos] = task.clone();
                outcome.replaced += 1;
            }
        } else {
            index.insert(id, merged.len());
            merged.push(task.clone());
            outcome.inserted += 1;
        }
    }

    outcome.tasks = group_by_day(merged).into_values().flatten().collect();
    outcome
}

/// Splits a flat collection into day buckets, keeping relative order.
///
/// Every day is present in the result, empty days included.
#[must_use]
pub fn group_by_day(tasks: impl IntoIterator<Item = Task>) -> BTreeMap<Day, Vec<Task>> {
    let mut buckets: BTreeMap<Day, Vec<Task>> = Day::ALL.iter().map(|d| (*d, Vec::new())).collect();
    for task in tasks {
        buckets.entry(task.day).or_default().push(task);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn task(id: i64, day: Day, content: &str, secs: i64) -> Task {
        Task::new(id, day, content, at(secs))
    }

    #[test]
    fn later_incoming_wins() {
        let local = [task(1, Day::Monday, "x", 1)];
        let incoming = [task(1, Day::Monday, "y", 2)];
        let out = resolve(&local, &incoming);
        assert_eq!(out.tasks, vec![task(1, Day::Monday, "y", 2)]);
        assert_eq!(out.replaced, 1);
    }

    #[test]
    fn earlier_incoming_loses() {
        let local = [task(1, Day::Monday, "y", 2)];
        let incoming = [task(1, Day::Monday, "x", 1)];
        let out = resolve(&local, &incoming);
        assert_eq!(out.tasks, local.to_vec());
        assert!(!out.changed());
    }

    #[test]
    fn tie_keeps_local() {
        let local = [task(1, Day::Monday, "mine", 5)];
        let incoming = [task(1, Day::Monday, "theirs", 5)];
        let out = resolve(&local, &incoming);
        assert_eq!(out.tasks[0].content, "mine");
    }

    #[test]
    fn timestamped_incoming_beats_untimestamped_local() {
        let mut untimed = Task::draft(Day::Tuesday, "old");
        untimed.id = Some(TaskId::new(3));
        let out = resolve(&[untimed], &[task(3, Day::Tuesday, "new", 0)]);
        assert_eq!(out.tasks[0].content, "new");
    }

    #[test]
    fn untimestamped_incoming_never_replaces() {
        let mut untimed = Task::draft(Day::Tuesday, "remote");
        untimed.id = Some(TaskId::new(3));
        let local = [task(3, Day::Tuesday, "local", 0)];
        let out = resolve(&local, &[untimed]);
        assert_eq!(out.tasks[0].content, "local");
    }

    #[test]
    fn unknown_incoming_is_inserted() {
        let local = [task(1, Day::Monday, "a", 1)];
        let incoming = [task(2, Day::Monday, "b", 1)];
        let out = resolve(&local, &incoming);
        assert_eq!(out.tasks.len(), 2);
        assert_eq!(out.inserted, 1);
        assert_eq!(out.tasks[1].content, "b");
    }

    #[test]
    fn winner_moves_to_its_own_day() {
        let local = [task(1, Day::Monday, "a", 1), task(2, Day::Friday, "b", 1)];
        let incoming = [task(1, Day::Saturday, "a", 2)];
        let out = resolve(&local, &incoming);
        let days: Vec<Day> = out.tasks.iter().map(|t| t.day).collect();
        assert_eq!(days, vec![Day::Friday, Day::Saturday]);
    }

    #[test]
    fn local_drafts_survive_and_incoming_drafts_are_skipped() {
        let local = [Task::draft(Day::Monday, "local draft")];
        let incoming = [Task::draft(Day::Monday, "remote draft")];
        let out = resolve(&local, &incoming);
        assert_eq!(out.tasks, local.to_vec());
        assert_eq!(out.skipped, 1);
    }

    #[test]
    fn resolve_is_idempotent() {
        let local = [task(1, Day::Monday, "a", 1), task(2, Day::Sunday, "b", 3)];
        let incoming = [task(1, Day::Wednesday, "a2", 2), task(4, Day::Monday, "c", 1)];
        let once = resolve(&local, &incoming);
        let twice = resolve(&once.tasks, &incoming);
        assert_eq!(once.tasks, twice.tasks);
        assert!(!twice.changed());
    }

    #[test]
    fn group_by_day_lists_every_day() {
        let buckets = group_by_day(vec![task(1, Day::Thursday, "a", 0)]);
        assert_eq!(buckets.len(), 7);
        assert_eq!(buckets[&Day::Thursday].len(), 1);
        assert!(buckets[&Day::Monday].is_empty());
    }

    #[test]
    fn equal_timestamp_keeps_local_then_later_replaces() {
        let local = [task(1, Day::Monday, "a", 1)];
        let tie = resolve(&local, &[task(1, Day::Monday, "b", 1)]);
        assert_eq!(tie.tasks[0].content, "a");
        assert_eq!(tie.replaced, 0);

        let later = resolve(&tie.tasks, &[task(1, Day::Monday, "c", 2)]);
        assert_eq!(later.tasks[0].content, "c");
        assert_eq!(later.replaced, 1);
    }
}
