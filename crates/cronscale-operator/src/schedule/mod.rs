//! Schedule windows declared by the `cronSpec` field of a [`CronScale`](crate::crd::CronScale).
//!
//! Two grammars are accepted:
//!
//! * A day/time range, e.g. `Mon-Fri 09:00-18:00 UTC`. The window is half-open, so
//!   `09:00-12:00` and `12:00-18:00` are adjacent without overlapping. An end before the start
//!   (`22:00-06:00`) describes an overnight window that begins on one of the listed days.
//! * A standard 5-field cron expression (`minute hour day-of-month month day-of-week`),
//!   optionally prefixed with `CRON_TZ=<timezone>`. Every minute matched by the expression is
//!   inside the window, so `* 9-17 * * Mon-Fri` covers 09:00 to 17:59 on weekdays.
//!
//! Timezones are fixed offsets (`UTC`, `UTC+02:00`, `+05:30`, ...). When none is given, UTC is
//! used.
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use cronscale_operator::schedule;
//!
//! let monday_morning = Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap();
//! assert!(schedule::matches("Mon-Fri 09:00-18:00 UTC", monday_morning).unwrap());
//! ```
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use snafu::Snafu;

mod cron;
mod range;

pub use self::{cron::CronWindow, range::RangeWindow};

/// How far ahead (and back) a window is searched when looking for transitions.
const SEARCH_HORIZON_MINUTES: i64 = 8 * 24 * 60;

#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("schedule is empty"))]
    Empty,

    #[snafu(display(
        "unrecognized schedule {spec:?}, expected a day and time range or a cron expression"
    ))]
    Unrecognized { spec: String },

    #[snafu(display("unknown day {day:?}, expected one of Mon, Tue, Wed, Thu, Fri, Sat, Sun"))]
    UnknownDay { day: String },

    #[snafu(display("invalid time of day {time:?}, expected HH:MM between 00:00 and 24:00"))]
    InvalidTime { time: String },

    #[snafu(display("invalid time range {range:?}, expected HH:MM-HH:MM"))]
    InvalidTimeRange { range: String },

    #[snafu(display("time range {range:?} starts and ends at the same time"))]
    EmptyTimeRange { range: String },

    #[snafu(display(
        "invalid timezone {timezone:?}, expected UTC or a fixed offset such as UTC+02:00"
    ))]
    InvalidTimezone { timezone: String },

    #[snafu(display("invalid cron expression {expression:?}: {message}"))]
    InvalidCron { expression: String, message: String },
}

/// A parsed `cronSpec`, usable as a predicate over timestamps.
#[derive(Clone, Debug)]
pub enum ScheduleWindow {
    Range(RangeWindow),
    Cron(CronWindow),
}

impl FromStr for ScheduleWindow {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let tokens: Vec<&str> = spec.split_whitespace().collect();

        match tokens.as_slice() {
            [] => EmptySnafu.fail(),
            [_, range, ..] if tokens.len() <= 3 && range.contains(':') => {
                RangeWindow::parse(&tokens).map(Self::Range)
            }
            [first, ..] if first.starts_with("CRON_TZ=") || tokens.len() == 5 => {
                CronWindow::parse(spec).map(Self::Cron)
            }
            _ => UnrecognizedSnafu { spec }.fail(),
        }
    }
}

impl ScheduleWindow {
    /// Returns whether `now` lies inside the window.
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Range(window) => window.matches(now),
            Self::Cron(window) => window.matches(now),
        }
    }

    /// Returns the instant at which the active stretch containing `now` started, or [`None`] if
    /// `now` is outside the window.
    ///
    /// Back-to-back occurrences count as one stretch.
    pub fn current_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Range(window) => window.current_start(now),
            Self::Cron(window) => window.current_start(now),
        }
    }

    /// Returns the next instant after `now` at which [`ScheduleWindow::matches`] changes its
    /// answer, or [`None`] if it does not change within the next week.
    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Range(window) => window.next_transition(now),
            Self::Cron(window) => window.next_transition(now),
        }
    }
}

/// Parses `spec` and checks whether `now` is inside the window it describes.
pub fn matches(spec: &str, now: DateTime<Utc>) -> Result<bool, Error> {
    Ok(spec.parse::<ScheduleWindow>()?.matches(now))
}

/// Parses `UTC`, `Z`, `UTC+02:00`, `UTC-5` or a bare `+05:30` into a fixed offset.
fn parse_timezone(input: &str) -> Result<FixedOffset, Error> {
    let invalid = || InvalidTimezoneSnafu { timezone: input }.build();

    if input.eq_ignore_ascii_case("utc") || input.eq_ignore_ascii_case("z") {
        return Ok(Utc.fix());
    }

    let offset = match input.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("utc") => &input[3..],
        _ => input,
    };

    let (sign, offset) = match offset.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };

    let (hours, minutes) = offset.split_once(':').unwrap_or((offset, "00"));
    let is_number = |value: &str| {
        !value.is_empty() && value.len() <= 2 && value.bytes().all(|b| b.is_ascii_digit())
    };
    if !is_number(hours) || !is_number(minutes) {
        return Err(invalid());
    }

    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 18 || minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
