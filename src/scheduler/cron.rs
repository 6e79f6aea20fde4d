//! Cron expression parsing and matching.
//!
//! Five whitespace-separated fields: minute, hour, day-of-month, month,
//! day-of-week (0 = Sunday). Each field is a comma-separated list of `*`,
//! a single value, a `LOW-HIGH` range or a `BASE/STEP` stepped range.
//! Month and weekday accept their three-letter names case-insensitively,
//! and the usual `@` macros expand to full expressions. A parsed field is
//! its explicit expansion set.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

/// Upper bound of the next-run search: ten years of minutes.
const MAX_SEARCH_MINUTES: i64 = 60 * 24 * 365 * 10;

const MONTH_NAMES: [(&str, u32); 12] = [
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const WEEKDAY_NAMES: [(&str, u32); 7] = [
    ("SUN", 0),
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    FieldCount(usize),
    UnknownMacro(String),
    BadValue(String),
    OutOfRange { value: u32, min: u32, max: u32 },
    BadStep(String),
}

impl std::fmt::Display for CronError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::FieldCount(count) => {
                write!(fmt, "cron expression must have 5 fields, found {count}")
            }
            Self::UnknownMacro(name) => write!(fmt, "unknown cron macro: {name}"),
            Self::BadValue(part) => write!(fmt, "invalid cron field value: {part}"),
            Self::OutOfRange { value, min, max } => {
                write!(fmt, "cron value {value} out of range {min}-{max}")
            }
            Self::BadStep(part) => write!(fmt, "invalid cron step: {part}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CronExpression {
    original: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

fn expand_macro(expression: &str) -> Result<&str, CronError> {
    Ok(match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => {
            return Err(CronError::UnknownMacro(other.to_string()))
        }
        other => other,
    })
}

fn resolve_value(token: &str, names: &[(&str, u32)]) -> Result<u32, CronError> {
    if let Ok(value) = token.parse() {
        return Ok(value);
    }
    let upper = token.to_ascii_uppercase();
    names
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, value)| *value)
        .ok_or_else(|| CronError::BadValue(token.to_string()))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[(&str, u32)],
) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    if field == "*" {
        values.extend(min..=max);
        return Ok(values);
    }
    for part in field.split(',') {
        if let Some((range_part, step_part)) = part.split_once('/') {
            let step: u32 = step_part
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| CronError::BadStep(part.to_string()))?;
            let (start, end) = if range_part == "*" {
                (min, max)
            } else if let Some((low, high)) = range_part.split_once('-') {
                (resolve_value(low, names)?, resolve_value(high, names)?)
            } else {
                (resolve_value(range_part, names)?, max)
            };
            values.extend((start..=end).step_by(step as usize));
        } else if let Some((low, high)) = part.split_once('-') {
            let low = resolve_value(low, names)?;
            let high = resolve_value(high, names)?;
            values.extend(low..=high);
        } else {
            values.insert(resolve_value(part, names)?);
        }
    }
    if let Some(bad) = values.iter().find(|v| **v < min || **v > max) {
        return Err(CronError::OutOfRange {
            value: *bad,
            min,
            max,
        });
    }
    Ok(values)
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let expanded = expand_macro(expression.trim())?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        Ok(Self {
            original: expression.trim().to_string(),
            minutes: parse_field(fields[0], 0, 59, &[])?,
            hours: parse_field(fields[1], 0, 23, &[])?,
            days: parse_field(fields[2], 1, 31, &[])?,
            months: parse_field(fields[3], 1, 12, &MONTH_NAMES)?,
            weekdays: parse_field(fields[4], 0, 6, &WEEKDAY_NAMES)?,
        })
    }

    /// Whether `t` (truncated to the minute) matches all five fields.
    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days.contains(&t.day())
            && self.months.contains(&t.month())
            && self.weekdays.contains(&t.date().weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`, scanning minute by
    /// minute and giving up after ten years.
    pub fn next_run_time(&self, after: &NaiveDateTime) -> Option<NaiveDateTime> {
        let truncated = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(*after);
        let mut candidate = truncated + Duration::minutes(1);
        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }

    pub fn minutes(&self) -> &BTreeSet<u32> {
        &self.minutes
    }
    pub fn hours(&self) -> &BTreeSet<u32> {
        &self.hours
    }
    pub fn days(&self) -> &BTreeSet<u32> {
        &self.days
    }
    pub fn months(&self) -> &BTreeSet<u32> {
        &self.months
    }
    pub fn weekdays(&self) -> &BTreeSet<u32> {
        &self.weekdays
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.original)
    }
}
