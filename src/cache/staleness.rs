//! Staleness evaluation for stored entries.
//!
//! Two independent signals expire an entry: a fixed time-to-live measured from
//! the write, and a recurring refresh schedule. An entry is stale once either
//! fires. Both are evaluated per request against the caller's `now`.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use super::schedule::{SchedulePattern, ScheduleError, ScheduleSpec};

/// True when a scheduled instant falls in `(stored_at, now]`.
pub fn is_stale(spec: &ScheduleSpec, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if now <= stored_at {
        return false;
    }

    let from = stored_at.with_timezone(&spec.tz).date_naive();
    let until = now.with_timezone(&spec.tz).date_naive();
    first_occurrence(spec, from, Some(until), |instant| {
        instant > stored_at && instant <= now
    })
    .is_some()
}

/// Earliest scheduled instant at or after `now`.
pub fn next_occurrence(spec: &ScheduleSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let from = now.with_timezone(&spec.tz).date_naive();
    first_occurrence(spec, from, None, |instant| instant >= now)
}

/// Walks the enumerated sets in chronological order and returns the first
/// valid instant accepted by `accept`. Dates outside `[from, until]` are pruned
/// before any time-of-day work happens.
fn first_occurrence<F>(
    spec: &ScheduleSpec,
    from: NaiveDate,
    until: Option<NaiveDate>,
    accept: F,
) -> Option<DateTime<Utc>>
where
    F: Fn(DateTime<Utc>) -> bool,
{
    for &year in &spec.years {
        let Ok(year) = i32::try_from(year) else {
            continue;
        };
        if year < from.year() {
            continue;
        }
        if until.is_some_and(|until| year > until.year()) {
            break;
        }

        for &month in &spec.months {
            for &day in &spec.days {
                let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                    continue;
                };
                if date < from {
                    continue;
                }
                if until.is_some_and(|until| date > until) {
                    break;
                }
                if !spec.weekdays.contains(&date.weekday().number_from_monday()) {
                    continue;
                }

                for &hour in &spec.hours {
                    for &minute in &spec.minutes {
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        // Local times skipped by a DST transition do not exist.
                        let Some(local) = spec.tz.from_local_datetime(&naive).earliest() else {
                            continue;
                        };
                        let instant = local.with_timezone(&Utc);
                        if accept(instant) {
                            return Some(instant);
                        }
                    }
                }
            }
        }
    }

    None
}

/// Outcome of judging one entry at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessDecision {
    pub is_stale: bool,
    /// Lifetime of the entry measured from its write, used for response headers.
    pub effective_ttl: Option<Duration>,
    pub next_refresh: Option<DateTime<Utc>>,
}

impl StalenessDecision {
    /// Instant at which the entry stops being fresh for downstream caches.
    pub fn expires_at(&self, stored_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = TimeDelta::from_std(self.effective_ttl?).ok()?;
        stored_at.checked_add_signed(ttl)
    }

    /// Remaining lifetime at `now`, clamped at zero.
    pub fn max_age(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        let expires_at = self.expires_at(stored_at)?;
        Some((expires_at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Blends the fixed TTL and the refresh schedule into one verdict.
#[derive(Debug, Clone)]
pub struct ExpiryPolicy {
    ttl: Option<Duration>,
    schedule: Option<SchedulePattern>,
    timezone: Tz,
}

impl ExpiryPolicy {
    pub fn new(ttl: Option<Duration>, schedule: Option<SchedulePattern>, timezone: Tz) -> Self {
        Self {
            ttl,
            schedule,
            timezone,
        }
    }

    /// Build a policy from a raw schedule string.
    pub fn with_schedule_str(
        ttl: Option<Duration>,
        schedule: Option<&str>,
        timezone: Tz,
    ) -> Result<Self, ScheduleError> {
        let schedule = schedule.map(SchedulePattern::parse).transpose()?;
        Ok(Self::new(ttl, schedule, timezone))
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn schedule(&self) -> Option<&SchedulePattern> {
        self.schedule.as_ref()
    }

    pub fn evaluate(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> StalenessDecision {
        let ttl_expired = self.ttl.is_some_and(|ttl| {
            TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| stored_at.checked_add_signed(ttl))
                .is_some_and(|deadline| now > deadline)
        });

        let (schedule_expired, next_refresh) = match &self.schedule {
            Some(pattern) => {
                let spec = pattern.resolve(now, self.timezone);
                let lookahead = pattern.resolve_lookahead(now, self.timezone);
                (
                    is_stale(&spec, stored_at, now),
                    next_occurrence(&lookahead, now),
                )
            }
            None => (false, None),
        };

        let until_refresh = next_refresh.and_then(|next| (next - stored_at).to_std().ok());
        let effective_ttl = match (self.ttl, until_refresh) {
            (Some(ttl), Some(refresh)) => Some(ttl.min(refresh)),
            (ttl, refresh) => ttl.or(refresh),
        };

        StalenessDecision {
            is_stale: ttl_expired || schedule_expired,
            effective_ttl,
            next_refresh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schedule::parse_schedule;

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("valid test instant")
    }

    #[test]
    fn hourly_schedule_is_stale_after_crossing_the_hour() {
        let stored_at = at(2024, 5, 15, 10, 30);
        let now = at(2024, 5, 15, 11, 5);
        let spec = parse_schedule("0 * * * * *", now, Tz::UTC).expect("valid schedule");

        assert!(is_stale(&spec, stored_at, now));
    }

    #[test]
    fn hourly_schedule_is_fresh_before_the_hour() {
        let stored_at = at(2024, 5, 15, 10, 30);
        let now = at(2024, 5, 15, 10, 45);
        let spec = parse_schedule("0 * * * * *", now, Tz::UTC).expect("valid schedule");

        assert!(!is_stale(&spec, stored_at, now));
    }

    #[test]
    fn never_stale_when_now_equals_stored_at() {
        let instant = at(2024, 5, 15, 11, 0);
        let spec = parse_schedule("0 * * * * *", instant, Tz::UTC).expect("valid schedule");

        assert!(!is_stale(&spec, instant, instant));
    }

    #[test]
    fn occurrence_at_now_counts_as_crossed() {
        let stored_at = at(2024, 5, 15, 10, 59);
        let now = at(2024, 5, 15, 11, 0);
        let spec = parse_schedule("0 * * * * *", now, Tz::UTC).expect("valid schedule");

        assert!(is_stale(&spec, stored_at, now));
    }

    #[test]
    fn weekday_filter_applies() {
        // 2024-05-13 is a Monday, 2024-05-14 a Tuesday.
        let spec = parse_schedule("0 6 13,14 5 2 2024", at(2024, 5, 13, 0, 0), Tz::UTC)
            .expect("valid schedule");

        assert!(!is_stale(&spec, at(2024, 5, 13, 0, 0), at(2024, 5, 13, 12, 0)));
        assert!(is_stale(&spec, at(2024, 5, 13, 0, 0), at(2024, 5, 14, 12, 0)));
    }

    #[test]
    fn invalid_calendar_dates_are_skipped() {
        // No 31st in April; 30 April 2024 is a Tuesday.
        let spec = parse_schedule("0 0 30,31 4 1-7 2024", at(2024, 4, 1, 0, 0), Tz::UTC)
            .expect("valid schedule");

        assert_eq!(next_occurrence(&spec, at(2024, 4, 1, 0, 0)), Some(at(2024, 4, 30, 0, 0)));
        assert!(!is_stale(&spec, at(2024, 4, 30, 1, 0), at(2024, 5, 2, 0, 0)));
    }

    #[test]
    fn next_occurrence_is_never_before_now() {
        let now = at(2024, 5, 15, 10, 45);
        let spec = parse_schedule("0-45/15 8-18 1-31 1-12 1-7 2024-2025", now, Tz::UTC)
            .expect("valid schedule");

        let next = next_occurrence(&spec, now).expect("an occurrence exists");
        assert!(next >= now);
        assert_eq!(next, now);
    }

    #[test]
    fn next_occurrence_is_none_for_past_schedules() {
        let spec = parse_schedule("0 0 1 1 1-7 2000", at(2024, 1, 1, 0, 0), Tz::UTC)
            .expect("valid schedule");

        assert_eq!(next_occurrence(&spec, at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn schedule_respects_timezone() {
        let tz: Tz = "Europe/Berlin".parse().expect("known timezone");
        // 06:00 Berlin summer time is 04:00 UTC.
        let spec = parse_schedule("0 6 15 5 1-7 2024", at(2024, 5, 15, 0, 0), tz)
            .expect("valid schedule");

        assert_eq!(next_occurrence(&spec, at(2024, 5, 15, 0, 0)), Some(at(2024, 5, 15, 4, 0)));
    }

    #[test]
    fn ttl_policy_tracks_remaining_lifetime() {
        let policy = ExpiryPolicy::new(Some(Duration::from_secs(300)), None, Tz::UTC);
        let stored_at = at(2024, 5, 15, 10, 0);

        let early = policy.evaluate(stored_at, stored_at + TimeDelta::seconds(200));
        assert!(!early.is_stale);
        assert_eq!(early.effective_ttl, Some(Duration::from_secs(300)));
        assert_eq!(
            early.max_age(stored_at, stored_at + TimeDelta::seconds(200)),
            Some(Duration::from_secs(100))
        );

        let boundary = policy.evaluate(stored_at, stored_at + TimeDelta::seconds(300));
        assert!(!boundary.is_stale);

        let late = policy.evaluate(stored_at, stored_at + TimeDelta::seconds(400));
        assert!(late.is_stale);
        assert_eq!(
            late.max_age(stored_at, stored_at + TimeDelta::seconds(400)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn effective_ttl_takes_the_earlier_signal() {
        let policy = ExpiryPolicy::with_schedule_str(
            Some(Duration::from_secs(3600)),
            Some("0 * * * * *"),
            Tz::UTC,
        )
        .expect("valid schedule");
        let stored_at = at(2024, 5, 15, 10, 30);

        let decision = policy.evaluate(stored_at, at(2024, 5, 15, 10, 45));
        assert!(!decision.is_stale);
        assert_eq!(decision.next_refresh, Some(at(2024, 5, 15, 11, 0)));
        assert_eq!(decision.effective_ttl, Some(Duration::from_secs(30 * 60)));

        let crossed = policy.evaluate(stored_at, at(2024, 5, 15, 11, 5));
        assert!(crossed.is_stale);
    }

    #[test]
    fn no_signals_means_never_stale() {
        let policy = ExpiryPolicy::new(None, None, Tz::UTC);
        let decision = policy.evaluate(at(2000, 1, 1, 0, 0), at(2024, 1, 1, 0, 0));

        assert!(!decision.is_stale);
        assert_eq!(decision.effective_ttl, None);
        assert_eq!(decision.max_age(at(2000, 1, 1, 0, 0), at(2024, 1, 1, 0, 0)), None);
    }
}
