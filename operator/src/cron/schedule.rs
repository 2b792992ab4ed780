//! Pure 5-field cron parsing and next-fire computation (spec §4.6). No I/O;
//! callers supply `now`/`effective_last` already resolved from cluster state.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::util::Error;

/// Missed-run walk cap (spec §4.6 step 6, §9 Open Question (b)).
pub const MISSED_RUN_CAP: usize = 100;

pub fn parse(expr: &str) -> Result<Schedule, Error> {
    // The `cron` crate expects 6 fields (seconds first); spec's schedule is the
    // standard 5-field POSIX form, so a leading "0" seconds field is prepended.
    Schedule::from_str(&format!("0 {expr}")).map_err(|e| Error::Cron(format!("{expr}: {e}")))
}

/// Clock-skew guard: if the stored `last_schedule_time` is in the future
/// relative to `now`, fall back to `creation_time` (spec §4.6 step 6).
pub fn effective_last(
    last_schedule_time: Option<DateTime<Utc>>,
    creation_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_schedule_time {
        Some(t) if t <= now => t,
        _ => creation_time,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NextFire {
    /// The most recent scheduled tick at or before `now`, if any occurred
    /// since `effective_last` — this is what should be materialized now.
    pub due: Option<DateTime<Utc>>,
    /// Count of past ticks walked to find `due`, capped at [`MISSED_RUN_CAP`].
    pub missed: usize,
    /// The first tick strictly after `due`/`now`, used to compute the next
    /// requeue interval.
    pub next_after: Option<DateTime<Utc>>,
    /// `true` if the walk hit the iteration cap while every tick examined
    /// was still in the past (a long outage).
    pub capped: bool,
}

/// Walks `schedule`'s occurrences strictly after `last`, stopping at the
/// first occurrence after `now` or after [`MISSED_RUN_CAP`] iterations,
/// whichever comes first.
pub fn next_fire(schedule: &Schedule, last: DateTime<Utc>, now: DateTime<Utc>) -> NextFire {
    let mut due = None;
    let mut missed = 0usize;
    let mut capped = false;

    for occurrence in schedule.after(&last).take(MISSED_RUN_CAP) {
        if occurrence <= now {
            due = Some(occurrence);
            missed += 1;
        } else {
            return NextFire {
                due,
                missed,
                next_after: Some(occurrence),
                capped: false,
            };
        }
    }

    if missed >= MISSED_RUN_CAP {
        capped = true;
    }
    NextFire {
        due,
        missed,
        next_after: None,
        capped,
    }
}

/// Deterministic child name per spec §4.6 step 8.
pub fn child_name(parent_name: &str, scheduled_at: DateTime<Utc>) -> String {
    format!("{parent_name}-{}", scheduled_at.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn parses_standard_five_field_expression() {
        assert!(parse("* * * * *").is_ok());
        assert!(parse("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn rejects_garbage_expression() {
        assert!(parse("not a schedule").is_err());
    }

    #[test]
    fn effective_last_uses_stored_value_when_in_the_past() {
        let now = dt(2026, 1, 1, 12, 0);
        let stored = dt(2026, 1, 1, 11, 0);
        let creation = dt(2026, 1, 1, 0, 0);
        assert_eq!(effective_last(Some(stored), creation, now), stored);
    }

    #[test]
    fn effective_last_falls_back_to_creation_on_clock_skew() {
        let now = dt(2026, 1, 1, 12, 0);
        let stored = dt(2026, 1, 1, 13, 0); // future relative to now
        let creation = dt(2026, 1, 1, 0, 0);
        assert_eq!(effective_last(Some(stored), creation, now), creation);
    }

    #[test]
    fn effective_last_uses_creation_when_never_scheduled() {
        let now = dt(2026, 1, 1, 12, 0);
        let creation = dt(2026, 1, 1, 0, 0);
        assert_eq!(effective_last(None, creation, now), creation);
    }

    #[test]
    fn next_fire_finds_a_single_due_tick() {
        let schedule = parse("* * * * *").unwrap();
        let last = dt(2026, 1, 1, 12, 0);
        let now = dt(2026, 1, 1, 12, 1);
        let result = next_fire(&schedule, last, now);
        assert_eq!(result.due, Some(dt(2026, 1, 1, 12, 1)));
        assert_eq!(result.missed, 1);
        assert!(!result.capped);
    }

    #[test]
    fn next_fire_reports_no_due_tick_when_next_is_future() {
        let schedule = parse("0 * * * *").unwrap(); // hourly
        let last = dt(2026, 1, 1, 12, 0);
        let now = dt(2026, 1, 1, 12, 30);
        let result = next_fire(&schedule, last, now);
        assert_eq!(result.due, None);
        assert_eq!(result.next_after, Some(dt(2026, 1, 1, 13, 0)));
    }

    #[test]
    fn next_fire_counts_multiple_missed_ticks_after_an_outage() {
        let schedule = parse("* * * * *").unwrap();
        let last = dt(2026, 1, 1, 12, 0);
        let now = dt(2026, 1, 1, 12, 5); // 5 minutes of outage
        let result = next_fire(&schedule, last, now);
        assert_eq!(result.due, Some(dt(2026, 1, 1, 12, 5)));
        assert_eq!(result.missed, 5);
        assert!(!result.capped);
    }

    #[test]
    fn next_fire_caps_the_walk_on_a_long_outage() {
        let schedule = parse("* * * * *").unwrap();
        let last = dt(2026, 1, 1, 0, 0);
        let now = dt(2026, 1, 10, 0, 0); // way more than 100 minutes overdue
        let result = next_fire(&schedule, last, now);
        assert_eq!(result.missed, MISSED_RUN_CAP);
        assert!(result.capped);
        assert!(result.due.is_some());
    }

    #[test]
    fn child_name_is_deterministic_per_scheduled_instant() {
        let t = dt(2026, 1, 1, 12, 0);
        assert_eq!(child_name("my-cron", t), format!("my-cron-{}", t.timestamp()));
    }
}
