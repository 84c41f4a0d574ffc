use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeDelta, Utc, Weekday,
};

use super::{
    EmptyTimeRangeSnafu, Error, InvalidTimeRangeSnafu, InvalidTimeSnafu, SEARCH_HORIZON_MINUTES,
    UnknownDaySnafu, UnrecognizedSnafu, parse_timezone,
};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// A `<days> <HH:MM>-<HH:MM> [timezone]` window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RangeWindow {
    days: DaySet,
    /// Minute of the day the window opens at, in `0..1440`.
    start: u32,
    /// Minute of the day the window closes at, in `0..=1440`. Smaller than `start` for
    /// overnight windows.
    end: u32,
    offset: FixedOffset,
}

/// A set of weekdays stored as a bitmask, Monday being the lowest bit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DaySet(u8);

impl DaySet {
    const ALL: Self = Self(0b111_1111);

    fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Occurrence {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl RangeWindow {
    pub(super) fn parse(tokens: &[&str]) -> Result<Self, Error> {
        let (days, range, offset) = match tokens {
            [days, range] => (days, range, Utc.fix()),
            [days, range, timezone] => (days, range, parse_timezone(timezone)?),
            _ => {
                return UnrecognizedSnafu {
                    spec: tokens.join(" "),
                }
                .fail();
            }
        };

        let days = parse_days(days)?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| InvalidTimeRangeSnafu { range: *range }.build())?;
        let (start, end) = (parse_time(start)?, parse_time(end)?);

        if start == MINUTES_PER_DAY {
            return InvalidTimeSnafu { time: "24:00" }.fail();
        }
        if start == end {
            return EmptyTimeRangeSnafu { range: *range }.fail();
        }

        Ok(Self {
            days,
            start,
            end,
            offset,
        })
    }

    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.containing(now).is_some()
    }

    pub fn current_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut start = self.containing(now)?.start;

        // Walk back over occurrences that end exactly where the current stretch begins.
        for _ in 0..8 {
            match self.occurrence_ending_at(start) {
                Some(previous) => start = previous.start,
                None => break,
            }
        }

        Some(start)
    }

    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Some(current) = self.containing(now) else {
            let today = self.local_date(now);
            return today
                .iter_days()
                .take(8)
                .filter_map(|date| self.occurrence_on(date))
                .map(|occurrence| occurrence.start)
                .find(|start| *start > now);
        };

        let mut end = current.end;
        while end - now < TimeDelta::minutes(SEARCH_HORIZON_MINUTES) {
            match self.occurrence_starting_at(end) {
                Some(next) => end = next.end,
                None => return Some(end),
            }
        }

        None
    }

    fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// The occurrence that opens on the given local date, if the date is one of the listed days.
    fn occurrence_on(&self, date: NaiveDate) -> Option<Occurrence> {
        if !self.days.contains(date.weekday()) {
            return None;
        }

        let midnight = date.and_time(NaiveTime::MIN).and_utc()
            - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        let start = midnight + TimeDelta::minutes(i64::from(self.start));
        let end = if self.end > self.start {
            midnight + TimeDelta::minutes(i64::from(self.end))
        } else {
            midnight + TimeDelta::days(1) + TimeDelta::minutes(i64::from(self.end))
        };

        Some(Occurrence { start, end })
    }

    fn containing(&self, now: DateTime<Utc>) -> Option<Occurrence> {
        let today = self.local_date(now);

        // Overnight occurrences that are still open began on the previous local day.
        [today.pred_opt(), Some(today)]
            .into_iter()
            .flatten()
            .filter_map(|date| self.occurrence_on(date))
            .find(|occurrence| occurrence.start <= now && now < occurrence.end)
    }

    fn occurrence_starting_at(&self, instant: DateTime<Utc>) -> Option<Occurrence> {
        self.occurrence_on(self.local_date(instant))
            .filter(|occurrence| occurrence.start == instant)
    }

    fn occurrence_ending_at(&self, instant: DateTime<Utc>) -> Option<Occurrence> {
        let date = self.local_date(instant);

        [date.pred_opt(), Some(date)]
            .into_iter()
            .flatten()
            .filter_map(|date| self.occurrence_on(date))
            .find(|occurrence| occurrence.end == instant)
    }
}

fn parse_days(input: &str) -> Result<DaySet, Error> {
    if input == "*" || input.eq_ignore_ascii_case("daily") {
        return Ok(DaySet::ALL);
    }

    let mut days = DaySet::default();
    for part in input.split(',') {
        match part.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (parse_day(from)?, parse_day(to)?);
                let mut day = from;
                days.insert(day);
                while day != to {
                    day = day.succ();
                    days.insert(day);
                }
            }
            None => days.insert(parse_day(part)?),
        }
    }

    Ok(days)
}

fn parse_day(input: &str) -> Result<Weekday, Error> {
    input
        .parse::<Weekday>()
        .ok()
        .ok_or_else(|| UnknownDaySnafu { day: input }.build())
}

/// Parses `HH:MM` into minutes since midnight, accepting `24:00` as the end of the day.
fn parse_time(input: &str) -> Result<u32, Error> {
    let invalid = || InvalidTimeSnafu { time: input }.build();

    let (hours, minutes) = input.split_once(':').ok_or_else(invalid)?;
    let is_number = |value: &str| {
        !value.is_empty() && value.len() <= 2 && value.bytes().all(|b| b.is_ascii_digit())
    };
    if !is_number(hours) || minutes.len() != 2 || !is_number(minutes) {
        return Err(invalid());
    }

    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if minutes >= 60 || hours > 24 || (hours == 24 && minutes != 0) {
        return Err(invalid());
    }

    Ok(hours * 60 + minutes)
}
