//! Core data types: compiled schedule entries and fired events.

use std::fmt;

use {
    chrono::{DateTime, Datelike, Timelike, Utc},
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
};

use crate::field::Field;

/// A compiled, named, timezone-bound schedule.
///
/// Immutable once constructed by [`crate::parse`]. Two entries describe the
/// same scheduled definition when their `expression` and `name` are equal;
/// stores use that pair as the deletion key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub timezone: Tz,
    /// Source expression text the entry was parsed from.
    pub expression: String,
    /// Optional free-text metadata carried through the store.
    pub meta: Option<String>,

    pub(crate) minute: Field,
    pub(crate) hour: Field,
    pub(crate) dom: Field,
    pub(crate) month: Field,
    pub(crate) dow: Field,
}

impl Entry {
    /// Whether `instant` satisfies the schedule.
    ///
    /// The instant is converted into the entry's timezone first; all five
    /// fields must match. Day-of-month and day-of-week are ANDed like the
    /// rest, not ORed as in some cron dialects.
    #[must_use]
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone);

        self.minute.matches(local.minute())
            && self.hour.matches(local.hour())
            && self.dom.matches(local.day())
            && self.dow.matches(local.weekday().num_days_from_sunday())
            && self.month.matches(local.month())
    }

    /// Canonical rendering of the five fields, space-separated. Wildcards
    /// render as `*`, never as an enumerated list. Diagnostic only, not
    /// guaranteed to re-parse to an identical entry.
    #[must_use]
    pub fn schedule(&self) -> String {
        [
            self.minute.format(),
            self.hour.format(),
            self.dom.format(),
            self.month.format(),
            self.dow.format(),
        ]
        .join(" ")
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ name:{:?} schedule:{:?}, location:{:?} }}",
            self.name,
            self.schedule(),
            self.timezone.name()
        )
    }
}

/// A durable record that `entry` fired at the matched minute `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub entry: Entry,
    pub time: DateTime<Utc>,
}
