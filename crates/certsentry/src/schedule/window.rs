//! Maintenance window time math.

use std::collections::HashSet;

use chrono::{Datelike, Days, NaiveDateTime, NaiveTime, Weekday};
use tracing::warn;

/// A recurring time range on approved weekdays during which disk writes and
/// container restarts are permitted.
///
/// When the end time-of-day is strictly earlier than the start, the window
/// spans midnight and the approved weekday applies to the *start* day
/// (a Wednesday 22:00-02:00 window runs Wed 22:00 through Thu 02:00).
#[derive(Debug, Clone)]
pub struct MaintenanceWindow {
    start: NaiveTime,
    end: NaiveTime,
    days: HashSet<Weekday>,
    spans_midnight: bool,
}

impl MaintenanceWindow {
    /// Build a window from start/end times and approved weekdays
    pub fn new(start: NaiveTime, end: NaiveTime, days: HashSet<Weekday>) -> Self {
        let spans_midnight = end < start;
        Self {
            start,
            end,
            days,
            spans_midnight,
        }
    }

    /// The set containing every weekday
    pub fn all_days() -> HashSet<Weekday> {
        [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ]
        .into_iter()
        .collect()
    }

    /// Whether the window crosses midnight
    pub fn spans_midnight(&self) -> bool {
        self.spans_midnight
    }

    /// True when `t` falls inside the window
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        let today_approved = self.days.contains(&t.weekday());
        let after_start = t.time() >= self.start;
        let before_end = t.time() <= self.end;

        if self.spans_midnight {
            // the tail of a window that started yesterday
            let yesterday_approved = self.days.contains(&t.weekday().pred());
            (yesterday_approved && before_end) || (today_approved && after_start)
        } else {
            today_approved && after_start && before_end
        }
    }

    /// The next instant at or after `now` when the window opens.
    ///
    /// If today is approved and `now` is at or before the start time, this
    /// is today's start; otherwise the scan moves forward one day at a time
    /// to the next approved weekday (capped at 8 days).
    pub fn next_start_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        if self.days.contains(&now.weekday()) && now.time() <= self.start {
            return now.date().and_time(self.start);
        }

        for add_days in 1..=8u64 {
            let Some(date) = now.date().checked_add_days(Days::new(add_days)) else {
                break;
            };
            if self.days.contains(&date.weekday()) {
                return date.and_time(self.start);
            }
        }

        // unreachable with a non-empty weekday set
        warn!("no approved weekday found within 8 days, report bug");
        now.date().and_time(self.start)
    }

    /// Human-readable summary for the startup log
    pub fn describe(&self) -> String {
        let mut days: Vec<&Weekday> = self.days.iter().collect();
        days.sort_by_key(|d| d.num_days_from_sunday());
        let days = days
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} between {} and {}",
            days,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}
