//! Recurrence specifications for scheduled refreshes.
//!
//! A specification is six whitespace-separated fields:
//!
//! ```text
//! minute  hour  day-of-month  month  day-of-week  year
//! 0-59    0-23  1-31          1-12   1-7 (ISO)    1900-3000
//! ```
//!
//! Each field is `*`, a comma-separated list (`0,15,30`), or a range with an
//! optional step (`8-18`, `0-45/15`). A `*` does not mean "every value": it
//! stands for the value the field has at the instant the pattern is resolved,
//! so `0 * * * * *` names the top of the current hour.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

const FIELD_COUNT: usize = 6;

/// One column of a recurrence specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Year,
}

impl Field {
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::Minute,
        Field::Hour,
        Field::DayOfMonth,
        Field::Month,
        Field::DayOfWeek,
        Field::Year,
    ];

    /// Inclusive domain of the field.
    pub fn bounds(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (1, 7),
            Field::Year => (1900, 3000),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day of the month",
            Field::Month => "month of the year",
            Field::DayOfWeek => "day of the week",
            Field::Year => "year",
        }
    }

    fn current(self, local: &DateTime<Tz>) -> u32 {
        match self {
            Field::Minute => local.minute(),
            Field::Hour => local.hour(),
            Field::DayOfMonth => local.day(),
            Field::Month => local.month(),
            Field::DayOfWeek => local.weekday().number_from_monday(),
            Field::Year => u32::try_from(local.year()).unwrap_or(0),
        }
    }

    /// The value following `value`, wrapping inside the domain. Years never wrap.
    fn successor(self, value: u32) -> u32 {
        let (low, high) = self.bounds();
        match self {
            Field::Year => value.saturating_add(1),
            _ if value >= high => low,
            _ => value + 1,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Malformed recurrence specification. Always fatal at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("field count: expected 6 values, found {found}")]
    FieldCount { found: usize },
    #[error("inverted range `{token}` in {field} field: first number must be less than the second")]
    InvertedRange { field: Field, token: String },
    #[error("bad step `{token}` in {field} field: step must be at least 1")]
    BadStep { field: Field, token: String },
    #[error("unsupported token `{token}` in {field} field")]
    UnsupportedToken { field: Field, token: String },
    #[error("out of range: {value} {field}")]
    OutOfRange { field: Field, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Wildcard,
    Values(BTreeSet<u32>),
}

/// A validated recurrence specification whose wildcards are still unresolved.
///
/// Parse once from configuration, then [`resolve`](Self::resolve) per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePattern {
    source: String,
    fields: [FieldSpec; FIELD_COUNT],
}

impl SchedulePattern {
    pub fn parse(source: &str) -> Result<Self, ScheduleError> {
        let tokens: Vec<&str> = source.split_whitespace().collect();
        if tokens.len() != FIELD_COUNT {
            return Err(ScheduleError::FieldCount {
                found: tokens.len(),
            });
        }

        let mut fields: [FieldSpec; FIELD_COUNT] = Default::default();
        for ((slot, field), token) in fields.iter_mut().zip(Field::ALL).zip(tokens) {
            *slot = parse_field(field, token)?;
        }

        Ok(Self {
            source: tokens_joined(source),
            fields,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Resolve wildcards against `now` as observed in `tz`.
    pub fn resolve(&self, now: DateTime<Utc>, tz: Tz) -> ScheduleSpec {
        let local = now.with_timezone(&tz);
        self.build(tz, |field| BTreeSet::from([field.current(&local)]))
    }

    /// Like [`resolve`](Self::resolve), but each wildcard also admits its
    /// successor so the following boundary is reachable when looking ahead.
    pub fn resolve_lookahead(&self, now: DateTime<Utc>, tz: Tz) -> ScheduleSpec {
        let local = now.with_timezone(&tz);
        self.build(tz, |field| {
            let current = field.current(&local);
            BTreeSet::from([current, field.successor(current)])
        })
    }

    fn build<F>(&self, tz: Tz, wildcard: F) -> ScheduleSpec
    where
        F: Fn(Field) -> BTreeSet<u32>,
    {
        let [minutes, hours, days, months, weekdays, years] = Field::ALL.map(|field| {
            match &self.fields[field as usize] {
                FieldSpec::Wildcard => wildcard(field),
                FieldSpec::Values(values) => values.clone(),
            }
        });

        ScheduleSpec {
            minutes,
            hours,
            days,
            months,
            weekdays,
            years,
            tz,
        }
    }
}

impl Default for FieldSpec {
    fn default() -> Self {
        FieldSpec::Wildcard
    }
}

impl FromStr for SchedulePattern {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SchedulePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A recurrence specification with every field enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub(crate) minutes: BTreeSet<u32>,
    pub(crate) hours: BTreeSet<u32>,
    pub(crate) days: BTreeSet<u32>,
    pub(crate) months: BTreeSet<u32>,
    pub(crate) weekdays: BTreeSet<u32>,
    pub(crate) years: BTreeSet<u32>,
    pub(crate) tz: Tz,
}

impl ScheduleSpec {
    pub fn values(&self, field: Field) -> &BTreeSet<u32> {
        match field {
            Field::Minute => &self.minutes,
            Field::Hour => &self.hours,
            Field::DayOfMonth => &self.days,
            Field::Month => &self.months,
            Field::DayOfWeek => &self.weekdays,
            Field::Year => &self.years,
        }
    }
}

/// Parse `source` and resolve its wildcards against `now` in one step.
pub fn parse_schedule(source: &str, now: DateTime<Utc>, tz: Tz) -> Result<ScheduleSpec, ScheduleError> {
    Ok(SchedulePattern::parse(source)?.resolve(now, tz))
}

fn tokens_joined(source: &str) -> String {
    source.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_field(field: Field, token: &str) -> Result<FieldSpec, ScheduleError> {
    if token == "*" {
        return Ok(FieldSpec::Wildcard);
    }

    if let Some((low, rest)) = token.split_once('-') {
        let (high, step) = match rest.split_once('/') {
            Some((high, step)) => (high, Some(step)),
            None => (rest, None),
        };
        return parse_range(field, token, low, high, step).map(FieldSpec::Values);
    }

    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit() || c == ',') {
        let mut values = BTreeSet::new();
        // Empty tokens such as the tail of `5,` are dropped.
        for part in token.split(',').filter(|part| !part.is_empty()) {
            let value = parse_number(field, token, part)?;
            values.insert(check_bounds(field, value)?);
        }
        return Ok(FieldSpec::Values(values));
    }

    Err(unsupported(field, token))
}

fn parse_range(
    field: Field,
    token: &str,
    low: &str,
    high: &str,
    step: Option<&str>,
) -> Result<BTreeSet<u32>, ScheduleError> {
    let low = parse_number(field, token, low)?;
    let high = parse_number(field, token, high)?;
    let step = match step {
        Some(step) => parse_number(field, token, step)?,
        None => 1,
    };

    if low >= high {
        return Err(ScheduleError::InvertedRange {
            field,
            token: token.to_string(),
        });
    }
    if step < 1 {
        return Err(ScheduleError::BadStep {
            field,
            token: token.to_string(),
        });
    }

    // Every expanded value lies between the two bounds.
    let low = check_bounds(field, low)?;
    let high = check_bounds(field, high)?;
    let step = usize::try_from(step).unwrap_or(usize::MAX);

    Ok((low..=high).step_by(step).collect())
}

fn parse_number(field: Field, token: &str, digits: &str) -> Result<u64, ScheduleError> {
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(unsupported(field, token));
    }

    // Only overflow can fail here.
    Ok(digits.parse::<u64>().unwrap_or(u64::MAX))
}

fn check_bounds(field: Field, value: u64) -> Result<u32, ScheduleError> {
    let (low, high) = field.bounds();
    match u32::try_from(value) {
        Ok(value) if (low..=high).contains(&value) => Ok(value),
        _ => Err(ScheduleError::OutOfRange { field, value }),
    }
}

fn unsupported(field: Field, token: &str) -> ScheduleError {
    ScheduleError::UnsupportedToken {
        field,
        token: token.to_string(),
    }
}
