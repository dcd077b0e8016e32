//! Task record types shared by every `WeekTodo` peer.
//!
//! A [`Task`] lives in exactly one [`Day`] bucket. Its position inside the
//! bucket is implicit (the index in the bucket's list). The JSON shape matches
//! the one browser and desktop peers already exchange:
//! `{ "id"?: integer, "day": string, "content": string, "lastModified"?: ISO-8601 }`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Day-of-week bucket a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    /// Monday.
    #[serde(alias = "Mon", alias = "monday")]
    Monday,
    /// Tuesday.
    #[serde(alias = "Tue", alias = "tuesday")]
    Tuesday,
    /// Wednesday.
    #[serde(alias = "Wed", alias = "wednesday")]
    Wednesday,
    /// Thursday.
    #[serde(alias = "Thu", alias = "thursday")]
    Thursday,
    /// Friday.
    #[serde(alias = "Fri", alias = "friday")]
    Friday,
    /// Saturday.
    #[serde(alias = "Sat", alias = "saturday")]
    Saturday,
    /// Sunday.
    #[serde(alias = "Sun", alias = "sunday")]
    Sunday,
}

impl Day {
    /// All buckets in week order. Exports and multi-bucket locks follow this order.
    pub const ALL: [Self; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    /// Position of the bucket in [`Day::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Full English name, as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a day.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown day: {0}")]
pub struct ParseDayError(pub String);

impl FromStr for Day {
    type Err = ParseDayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|day| {
                let name = day.as_str().to_ascii_lowercase();
                name == lower || (lower.len() == 3 && name.starts_with(&lower))
            })
            .ok_or_else(|| ParseDayError(s.to_string()))
    }
}

/// Task identity, unique per account and never reused after deletion.
///
/// Ids are time-derived (milliseconds since epoch at creation) and made
/// strictly increasing by the allocator that hands them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(i64);

impl TaskId {
    /// Wraps a raw integer id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single entry in the weekly task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Identity; absent only on drafts that have not been committed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    /// Bucket the task currently belongs to.
    pub day: Day,
    /// Free-form text.
    pub content: String,
    /// Logical modification time used for last-write-wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates an uncommitted draft with no id and no timestamp.
    pub fn draft(day: Day, content: impl Into<String>) -> Self {
        Self {
            id: None,
            day,
            content: content.into(),
            last_modified: None,
        }
    }

    /// Creates a fully specified task.
    pub fn new(id: i64, day: Day, content: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            id: Some(TaskId::new(id)),
            day,
            content: content.into(),
            last_modified: Some(last_modified),
        }
    }

    /// Returns `true` if `other` was modified strictly later than `self`.
    ///
    /// A task without a timestamp is older than any timestamped task.
    #[must_use]
    pub fn is_superseded_by(&self, other: &Self) -> bool {
        other.last_modified > self.last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_serializes_as_full_name() {
        let json = serde_json::to_string(&Day::Wednesday).unwrap();
        assert_eq!(json, "\"Wednesday\"");
    }

    #[test]
    fn day_accepts_short_alias() {
        let day: Day = serde_json::from_str("\"Mon\"").unwrap();
        assert_eq!(day, Day::Monday);
    }

    #[test]
    fn day_from_str_is_case_insensitive() {
        assert_eq!("friday".parse::<Day>().unwrap(), Day::Friday);
        assert_eq!("SUN".parse::<Day>().unwrap(), Day::Sunday);
        assert!("someday".parse::<Day>().is_err());
    }

    #[test]
    fn day_index_matches_week_order() {
        for (i, day) in Day::ALL.iter().enumerate() {
            assert_eq!(day.index(), i);
        }
    }

    #[test]
    fn task_json_uses_camel_case_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap();
        let task = Task::new(17, Day::Tuesday, "water plants", ts);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["id"], 17);
        assert_eq!(json["day"], "Tuesday");
        assert_eq!(json["lastModified"], "2024-03-04T09:30:00Z");
    }

    #[test]
    fn task_parses_browser_shape() {
        let json = r#"{"id":1700000000000,"day":"Monday","content":"x","lastModified":"2024-01-01T10:00:00.000Z","isDragging":false}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.id, Some(TaskId::new(1_700_000_000_000)));
        assert_eq!(task.content, "x");
        assert!(task.last_modified.is_some());
    }

    #[test]
    fn draft_omits_optional_fields() {
        let json = serde_json::to_string(&Task::draft(Day::Sunday, "rest")).unwrap();
        assert_eq!(json, r#"{"day":"Sunday","content":"rest"}"#);
    }

    #[test]
    fn untimestamped_task_is_superseded_by_timestamped() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut old = Task::draft(Day::Monday, "a");
        old.id = Some(TaskId::new(1));
        let new = Task::new(1, Day::Monday, "b", ts);
        assert!(old.is_superseded_by(&new));
        assert!(!new.is_superseded_by(&old));
        assert!(!new.is_superseded_by(&new.clone()));
    }
}
