use std::str::FromStr;

use ::cron::Schedule;
use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Timelike, Utc};

use super::{Error, InvalidCronSnafu, SEARCH_HORIZON_MINUTES, parse_timezone};

/// Day-of-week names indexed by their POSIX cron number, 0 and 7 both being Sunday.
const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// A window made of every minute a 5-field cron expression fires at.
///
/// When both day-of-month and day-of-week are restricted, a minute matches if either of them
/// matches, as in standard cron. That case is held as two schedules.
#[derive(Clone, Debug)]
pub struct CronWindow {
    schedules: Vec<Schedule>,
    offset: FixedOffset,
}

impl CronWindow {
    pub(super) fn parse(spec: &str) -> Result<Self, Error> {
        let (offset, expression) = match spec.strip_prefix("CRON_TZ=") {
            Some(rest) => {
                let (timezone, expression) =
                    rest.split_once(char::is_whitespace).ok_or_else(|| {
                        InvalidCronSnafu {
                            expression: spec,
                            message: "CRON_TZ must be followed by an expression",
                        }
                        .build()
                    })?;
                (parse_timezone(timezone)?, expression.trim())
            }
            None => (Utc.fix(), spec),
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return InvalidCronSnafu {
                expression,
                message: format!("expected 5 fields, found {}", fields.len()),
            }
            .fail();
        };

        let day_of_week = translate_day_of_week(day_of_week)
            .map_err(|message| InvalidCronSnafu { expression, message }.build())?;

        // The cron crate ANDs both day fields, standard cron ORs them when both are restricted.
        let day_fields = if day_of_month.starts_with('*') || day_of_week.starts_with('*') {
            vec![(*day_of_month, day_of_week.as_str())]
        } else {
            vec![(*day_of_month, "*"), ("*", day_of_week.as_str())]
        };

        let schedules = day_fields
            .into_iter()
            .map(|(day_of_month, day_of_week)| {
                // The cron crate expects a leading seconds field.
                let normalized = format!("0 {minute} {hour} {day_of_month} {month} {day_of_week}");
                Schedule::from_str(&normalized).map_err(|error| {
                    InvalidCronSnafu {
                        expression,
                        message: error.to_string(),
                    }
                    .build()
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { schedules, offset })
    }

    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.includes_minute(truncate_to_minute(now))
    }

    pub fn current_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut start = truncate_to_minute(now);
        if !self.includes_minute(start) {
            return None;
        }

        for _ in 0..SEARCH_HORIZON_MINUTES {
            let previous = start - TimeDelta::minutes(1);
            if !self.includes_minute(previous) {
                break;
            }
            start = previous;
        }

        Some(start)
    }

    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut minute = truncate_to_minute(now);

        if !self.includes_minute(minute) {
            let local = now.with_timezone(&self.offset);
            return self
                .schedules
                .iter()
                .filter_map(|schedule| schedule.after(&local).next())
                .min()
                .map(|next| next.with_timezone(&Utc));
        }

        for _ in 0..SEARCH_HORIZON_MINUTES {
            minute += TimeDelta::minutes(1);
            if !self.includes_minute(minute) {
                return Some(minute);
            }
        }

        None
    }

    fn includes_minute(&self, minute: DateTime<Utc>) -> bool {
        let local = minute.with_timezone(&self.offset);
        self.schedules
            .iter()
            .any(|schedule| schedule.includes(local))
    }
}

fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_second(0)
        .and_then(|instant| instant.with_nanosecond(0))
        .unwrap_or(instant)
}

/// Rewrites a POSIX day-of-week field (0-7, Sunday at both ends) into day names so that the
/// numbering of the underlying cron implementation never leaks to users.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();

    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let translated = match base.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (day_name(from)?, day_name(to)?);
                if to == "SUN" && from != "SUN" {
                    // Ranges ending on Sunday wrap in the underlying numbering.
                    if step.is_some() {
                        return Err(format!(
                            "stepped range {item:?} ending on Sunday is not supported"
                        ));
                    }
                    items.push("SUN".to_owned());
                    if from == "SAT" {
                        from
                    } else {
                        format!("{from}-SAT")
                    }
                } else {
                    format!("{from}-{to}")
                }
            }
            None => day_name(base)?,
        };

        items.push(match step {
            Some(step) => format!("{translated}/{step}"),
            None => translated,
        });
    }

    Ok(items.join(","))
}

fn day_name(token: &str) -> Result<String, String> {
    match token.parse::<usize>() {
        Ok(number) => DAY_NAMES
            .get(number)
            .map(|name| (*name).to_owned())
            .ok_or_else(|| format!("day of week {number} is outside of 0-7")),
        Err(_) => Ok(token.to_ascii_uppercase()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn window(spec: &str) -> CronWindow {
        CronWindow::parse(spec).expect("cron window must parse")
    }

    fn at(d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        // January 2024: the 7th is a Sunday, the 8th a Monday.
        Utc.with_ymd_and_hms(2024, 1, d, h, mi, s)
            .single()
            .expect("valid test timestamp")
    }

    #[rstest]
    #[case("1-5", "MON-FRI")]
    #[case("0", "SUN")]
    #[case("7", "SUN")]
    #[case("mon,wed", "MON,WED")]
    #[case("5-7", "SUN,FRI-SAT")]
    #[case("Sat-Sun", "SUN,SAT")]
    #[case("*", "*")]
    #[case("*/2", "*/2")]
    #[case("1-5/2", "MON-FRI/2")]
    fn translates_day_of_week(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(translate_day_of_week(input).as_deref(), Ok(expected));
    }

    #[rstest]
    #[case("8")]
    #[case("5-0/2")]
    fn rejects_bad_day_of_week(#[case] input: &str) {
        assert!(translate_day_of_week(input).is_err());
    }

    #[rstest]
    #[case("* 9-17 * * 1-5", at(8, 9, 0, 0), true)]
    #[case("* 9-17 * * 1-5", at(8, 17, 59, 59), true)]
    #[case("* 9-17 * * 1-5", at(8, 18, 0, 0), false)]
    #[case("* 9-17 * * 1-5", at(7, 12, 0, 0), false)]
    #[case("* * * * 0", at(7, 12, 0, 0), true)]
    #[case("* * * * 7", at(7, 12, 0, 0), true)]
    #[case("30 12 * * *", at(8, 12, 30, 45), true)]
    #[case("30 12 * * *", at(8, 12, 31, 0), false)]
    #[case("CRON_TZ=UTC+02:00 * 9-17 * * *", at(8, 7, 0, 0), true)]
    #[case("CRON_TZ=UTC+02:00 * 9-17 * * *", at(8, 16, 0, 0), false)]
    #[case("* * 1 * 1", at(8, 10, 0, 0), true)]
    #[case("* * 1 * 3", at(1, 10, 0, 0), true)]
    #[case("* * 1 * 3", at(3, 10, 0, 0), true)]
    #[case("* * 1 * 3", at(2, 10, 0, 0), false)]
    #[case("* * */2 * 1", at(9, 10, 0, 0), false)]
    #[case("* * */2 * 1", at(15, 10, 0, 0), true)]
    fn matches_minutes(#[case] spec: &str, #[case] now: DateTime<Utc>, #[case] expected: bool) {
        assert_eq!(window(spec).matches(now), expected);
    }

    #[rstest]
    #[case("* 9-17 * * 1-5", at(8, 10, 15, 0), Some(at(8, 18, 0, 0)))]
    #[case("* 9-17 * * 1-5", at(8, 18, 0, 0), Some(at(9, 9, 0, 0)))]
    #[case("* 9-17 * * 1-5", at(6, 12, 0, 0), Some(at(8, 9, 0, 0)))]
    #[case("* * * * *", at(8, 12, 0, 0), None)]
    #[case("* 9 15 * 1", at(9, 12, 0, 0), Some(at(15, 9, 0, 0)))]
    #[case("* 9 10 * 1", at(9, 12, 0, 0), Some(at(10, 9, 0, 0)))]
    fn next_transitions(
        #[case] spec: &str,
        #[case] now: DateTime<Utc>,
        #[case] expected: Option<DateTime<Utc>>,
    ) {
        assert_eq!(window(spec).next_transition(now), expected);
    }

    #[test]
    fn current_start_walks_back_to_first_matching_minute() {
        let window = window("* 9-17 * * 1-5");
        assert_eq!(
            window.current_start(at(8, 13, 45, 10)),
            Some(at(8, 9, 0, 0))
        );
        assert_eq!(window.current_start(at(8, 8, 0, 0)), None);
    }
}
