//! Property-based tests for the last-write-wins resolver.
//!
//! 1. Merging is commutative when no id carries the same timestamp on both sides.
//! 2. Merging is idempotent.
//! 3. Every id ends up holding its latest version, in exactly one bucket.

use std::collections::{BTreeMap, HashSet};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use weektodo_proto::merge::resolve;
use weektodo_proto::task::{Day, Task, TaskId};

/// Collection with unique ids. Timestamps are `2k + parity` so the two sides
/// of a merge never tie.
fn arb_side(parity: i64) -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec(
        (0i64..24, prop::sample::select(Day::ALL.to_vec()), "[a-z]{1,8}", 0i64..10_000),
        0..24,
    )
    .prop_map(move |rows| {
        let mut seen = HashSet::new();
        rows.into_iter()
            .filter(|(id, ..)| seen.insert(*id))
            .map(|(id, day, content, k)| Task {
                id: Some(TaskId::new(id)),
                day,
                content,
                last_modified: Utc.timestamp_millis_opt(2 * k + parity).single(),
            })
            .collect()
    })
}

fn by_id(tasks: &[Task]) -> BTreeMap<TaskId, Task> {
    tasks
        .iter()
        .map(|t| (t.id.unwrap(), t.clone()))
        .collect()
}

proptest! {
    #[test]
    fn merge_is_commutative(a in arb_side(0), b in arb_side(1)) {
        let ab = resolve(&a, &b);
        let ba = resolve(&b, &a);
        prop_assert_eq!(by_id(&ab.tasks), by_id(&ba.tasks));
    }

    #[test]
    fn merge_is_idempotent(a in arb_side(0), b in arb_side(1)) {
        let once = resolve(&a, &b);
        let twice = resolve(&once.tasks, &b);
        prop_assert_eq!(&once.tasks, &twice.tasks);
        prop_assert!(!twice.changed());
        prop_assert_eq!(resolve(&once.tasks, &once.tasks).tasks, once.tasks);
    }

    #[test]
    fn latest_version_wins_once(a in arb_side(0), b in arb_side(1)) {
        let merged = by_id(&resolve(&a, &b).tasks);
        let mut expected: BTreeMap<TaskId, Task> = by_id(&a);
        for t in b {
            let id = t.id.unwrap();
            match expected.get(&id) {
                Some(existing) if existing.last_modified >= t.last_modified => {}
                _ => { expected.insert(id, t); }
            }
        }
        prop_assert_eq!(merged, expected);
    }

    #[test]
    fn output_is_grouped_by_day(a in arb_side(0), b in arb_side(1)) {
        let days: Vec<Day> = resolve(&a, &b).tasks.iter().map(|t| t.day).collect();
        let mut sorted = days.clone();
        sorted.sort();
        prop_assert_eq!(days, sorted);
    }
}
