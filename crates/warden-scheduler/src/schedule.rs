//! Schedule expression evaluator.
//!
//! Supports:
//! - "MIN HOUR DOM MON DOW" (5-field, no seconds). Each field takes `*`,
//!   `N`, `a,b,c`, `a-b`, `*/N` or `a-b/N`.
//! - Macros: `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`.
//! - Intervals: `@every 1h30m` (units `s`, `m`, `h`, `d`), measured from
//!   the reference instant rather than aligned to the wall clock.
//!
//! Cron fields are evaluated in the configured timezone. The result is
//! always strictly later than the reference instant.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use warden_core::{Result, WardenError};

/// How far ahead a cron search may look (covers Feb 29 across a skipped
/// century leap year).
const MAX_SEARCH_DAYS: u64 = 366 * 9;

/// A parsed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Wall-clock aligned cron point.
    Cron(CronSpec),
    /// Fixed interval from the reference instant.
    Every(Duration),
}

/// Parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Bitset of allowed values for one cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        v < 64 && self.0 & (1u64 << v) != 0
    }

    fn values(&self, min: u32, max: u32) -> impl Iterator<Item = u32> + '_ {
        (min..=max).filter(move |v| self.contains(*v))
    }
}

/// Parse and validate an expression without evaluating it.
pub fn validate(expression: &str) -> Result<()> {
    let schedule = Schedule::parse(expression)?;
    // Expressions like "0 0 31 2 *" parse but never fire.
    if let Schedule::Cron(spec) = &schedule {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if epoch.and_then(|p| spec.next_after(p, &chrono_tz::UTC)).is_none() {
            return Err(WardenError::InvalidSchedule(format!(
                "'{expression}' never matches a calendar date"
            )));
        }
    }
    Ok(())
}

/// Compute the next instant strictly after `after` at which `expression` fires.
pub fn next_occurrence(expression: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    Schedule::parse(expression)?.next_after(after, tz)
}

/// The next `count` occurrences after `after`.
pub fn upcoming(
    expression: &str,
    after: DateTime<Utc>,
    tz: Tz,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let schedule = Schedule::parse(expression)?;
    let mut out = Vec::with_capacity(count);
    let mut cursor = after;
    for _ in 0..count {
        cursor = schedule.next_after(cursor, tz)?;
        out.push(cursor);
    }
    Ok(out)
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| WardenError::Config(format!("'{name}' is not a valid IANA timezone")))
}

impl Schedule {
    /// Parse an expression string.
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = expression.trim();
        if let Some(rest) = expr.strip_prefix("@every") {
            return parse_every(rest).map(Schedule::Every);
        }
        if expr.starts_with('@') {
            let canonical = match expr {
                "@hourly" => "0 * * * *",
                "@daily" | "@midnight" => "0 0 * * *",
                "@weekly" => "0 0 * * 0",
                "@monthly" => "0 0 1 * *",
                "@yearly" | "@annually" => "0 0 1 1 *",
                other => {
                    return Err(WardenError::InvalidSchedule(format!(
                        "unknown macro '{other}'"
                    )));
                }
            };
            return CronSpec::parse(canonical).map(Schedule::Cron);
        }
        CronSpec::parse(expr).map(Schedule::Cron)
    }

    /// Next instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => after.checked_add_signed(*interval).ok_or_else(|| {
                WardenError::InvalidSchedule(format!("@every interval overflows after {after}"))
            }),
            Schedule::Cron(spec) => spec.next_after(after, &tz).ok_or_else(|| {
                WardenError::InvalidSchedule("no occurrence within search horizon".into())
            }),
        }
    }

    /// `true` for `@every` schedules.
    pub fn is_interval(&self) -> bool {
        matches!(self, Schedule::Every(_))
    }
}

impl CronSpec {
    fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(WardenError::InvalidSchedule(format!(
                "'{expression}' has {} fields (need 5: MIN HOUR DOM MON DOW)",
                parts.len()
            )));
        }

        let minutes = parse_field(parts[0], 0, 59, "minute")?;
        let hours = parse_field(parts[1], 0, 23, "hour")?;
        let days_of_month = parse_field(parts[2], 1, 31, "day-of-month")?;
        let months = parse_field(parts[3], 1, 12, "month")?;
        let mut days_of_week = parse_field(parts[4], 0, 7, "day-of-week")?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn next_after<Z: TimeZone>(&self, after: DateTime<Utc>, tz: &Z) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(tz).date_naive();

        for offset in 0..MAX_SEARCH_DAYS {
            let date = start.checked_add_days(chrono::Days::new(offset))?;
            if !self.months.contains(date.month()) || !self.day_matches(date) {
                continue;
            }
            for hour in self.hours.values(0, 23) {
                for minute in self.minutes.values(0, 59) {
                    let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                        continue;
                    };
                    let candidates = match tz.from_local_datetime(&naive) {
                        LocalResult::Single(dt) => vec![dt],
                        LocalResult::Ambiguous(a, b) => vec![a, b],
                        // Skipped by a DST gap.
                        LocalResult::None => continue,
                    };
                    if let Some(hit) = candidates
                        .into_iter()
                        .map(|dt| dt.with_timezone(&Utc))
                        .find(|dt| *dt > after)
                    {
                        return Some(hit);
                    }
                }
            }
        }
        None
    }
}

/// Parse a cron field into the set of matching values.
fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<FieldSet> {
    let invalid = |why: String| WardenError::InvalidSchedule(format!("{name} field '{field}': {why}"));

    let mut set = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element".into()));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let n: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{step}'")))?;
                if n == 0 {
                    return Err(invalid("step must be > 0".into()));
                }
                (base, Some(n))
            }
            None => (part, None),
        };

        let parse_num = |s: &str| -> Result<u32> {
            let n: u32 = s.parse().map_err(|_| invalid(format!("'{s}' is not a number")))?;
            if n < min || n > max {
                return Err(invalid(format!("{n} out of range {min}-{max}")));
            }
            Ok(n)
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let (a, b) = (parse_num(a)?, parse_num(b)?);
            if a > b {
                return Err(invalid(format!("range {a}-{b} is reversed")));
            }
            (a, b)
        } else {
            let n = parse_num(base)?;
            // "N/step" means N through max.
            if step.is_some() { (n, max) } else { (n, n) }
        };

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            set |= 1u64 << v;
        }
    }
    Ok(FieldSet(set))
}

/// Longest accepted `@every` interval: 100 years of 366 days.
const MAX_EVERY_SECS: i64 = 100 * 366 * 86_400;

/// Parse the `<integer><unit>` sequence after `@every`.
fn parse_every(spec: &str) -> Result<Duration> {
    let invalid = |why: &str| WardenError::InvalidSchedule(format!("@every '{}': {why}", spec.trim()));

    let compact: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(invalid("missing duration"));
    }

    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in compact.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit: i64 = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(invalid("units must be one of s, m, h, d")),
        };
        if digits.is_empty() {
            return Err(invalid("unit without a number"));
        }
        let n: i64 = digits.parse().map_err(|_| invalid("number too large"))?;
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| invalid("duration overflow"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid("number without a unit"));
    }
    if total == 0 {
        return Err(invalid("duration must be > 0"));
    }
    if total > MAX_EVERY_SECS {
        return Err(invalid("duration must be at most 100 years"));
    }
    Duration::try_seconds(total).ok_or_else(|| invalid("duration overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        next_occurrence(expr, after, chrono_tz::UTC).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next("0 * * * *", utc(2026, 2, 22, 10, 30));
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_specific_time() {
        assert_eq!(next("0 8 * * *", utc(2026, 2, 22, 7, 0)), utc(2026, 2, 22, 8, 0));
        // Already past today → tomorrow.
        assert_eq!(next("0 8 * * *", utc(2026, 2, 22, 9, 0)), utc(2026, 2, 23, 8, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        assert_eq!(next("*/15 * * * *", utc(2026, 2, 22, 10, 2)).minute(), 15);
        assert_eq!(next("*/15 * * * *", utc(2026, 2, 22, 10, 50)), utc(2026, 2, 22, 11, 0));
    }

    #[test]
    fn test_exact_occurrence_returns_strictly_later() {
        let at = utc(2026, 2, 22, 11, 0);
        assert_eq!(next("@hourly", at), utc(2026, 2, 22, 12, 0));
        assert_eq!(next("0 11 * * *", at), utc(2026, 2, 23, 11, 0));
    }

    #[test]
    fn test_seconds_are_rounded_up_to_next_minute() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 30, 15).unwrap();
        assert_eq!(next("* * * * *", after), utc(2026, 2, 22, 10, 31));
    }

    #[test]
    fn test_macros_match_canonical_forms() {
        let after = utc(2026, 5, 17, 13, 37);
        for (mac, canonical) in [
            ("@hourly", "0 * * * *"),
            ("@daily", "0 0 * * *"),
            ("@weekly", "0 0 * * 0"),
            ("@monthly", "0 0 1 * *"),
            ("@yearly", "0 0 1 1 *"),
        ] {
            assert_eq!(next(mac, after), next(canonical, after), "{mac}");
        }
        assert_eq!(next("@monthly", after), utc(2026, 6, 1, 0, 0));
        assert_eq!(next("@yearly", after), utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_lists_and_ranges() {
        let after = utc(2026, 2, 22, 10, 2);
        assert_eq!(next("5,20,40 * * * *", after), utc(2026, 2, 22, 10, 5));
        assert_eq!(next("0 9-17 * * *", utc(2026, 2, 22, 17, 30)), utc(2026, 2, 23, 9, 0));
        assert_eq!(next("0 0-12/6 * * *", utc(2026, 2, 22, 7, 0)), utc(2026, 2, 22, 12, 0));
        assert_eq!(next("30/10 * * * *", utc(2026, 2, 22, 10, 45)), utc(2026, 2, 22, 10, 50));
    }

    #[test]
    fn test_weekly_sunday_schedule() {
        // 2026-02-22 is a Sunday; restart on the Wednesday after.
        let restart = utc(2026, 2, 25, 10, 0);
        assert_eq!(next("0 3 * * 0", restart), utc(2026, 3, 1, 3, 0));
        assert_eq!(next("0 3 * * 7", restart), utc(2026, 3, 1, 3, 0));
    }

    #[test]
    fn test_dom_and_dow_either_matches() {
        // 1st of month OR Monday. 2026-02-23 is a Monday.
        assert_eq!(next("0 0 1 * 1", utc(2026, 2, 22, 0, 0)), utc(2026, 2, 23, 0, 0));
        // Only DOM restricted: Monday is irrelevant.
        assert_eq!(next("0 0 1 * *", utc(2026, 2, 22, 0, 0)), utc(2026, 3, 1, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 29 2 *", utc(2026, 1, 1, 0, 0)), utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_every_interval_is_relative() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 40, 7).unwrap();
        assert_eq!(
            next("@every 15m", after),
            Utc.with_ymd_and_hms(2026, 2, 22, 10, 55, 7).unwrap()
        );
        assert_eq!(next("@every 1h30m", after), after + Duration::minutes(90));
        assert_eq!(next("@every 1d 2h", after), after + Duration::hours(26));
        assert_eq!(next("@every 45s", after), after + Duration::seconds(45));
    }

    #[test]
    fn test_timezone_evaluation() {
        let berlin: Tz = parse_timezone("Europe/Berlin").unwrap();
        // Winter: CET = UTC+1.
        let got = next_occurrence("0 8 * * *", utc(2026, 1, 15, 0, 0), berlin).unwrap();
        assert_eq!(got, utc(2026, 1, 15, 7, 0));
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        let ny: Tz = parse_timezone("America/New_York").unwrap();
        // 02:30 does not exist on 2026-03-08 in New York.
        let got = next_occurrence("30 2 * * *", utc(2026, 3, 8, 5, 0), ny).unwrap();
        assert_eq!(got, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in [
            "bad",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "@fortnightly",
            "@every",
            "@every 10",
            "@every m",
            "@every 10w",
            "@every 0s",
            "0 0 31 2 *",
        ] {
            assert!(
                matches!(validate(bad), Err(WardenError::InvalidSchedule(_))),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_valid_expressions() {
        for good in ["@hourly", "@every 15m", "0 3 * * 0", "*/5 9-17 * * 1-5", "0 0 1,15 * *"] {
            assert!(validate(good).is_ok(), "{good}");
        }
    }

    #[test]
    fn test_strictly_later_and_idempotent() {
        let exprs = ["* * * * *", "*/7 * * * *", "0 3 * * 0", "15 2 1 * *", "0 0 1 1 *", "@every 90s"];
        let mut after = utc(2026, 1, 1, 0, 0);
        for i in 0..200 {
            after += Duration::minutes(37 * i + 11);
            for expr in exprs {
                let a = next(expr, after);
                let b = next(expr, after);
                assert!(a > after, "{expr} after {after}");
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_upcoming() {
        let got = upcoming("0 */6 * * *", utc(2026, 2, 22, 1, 0), chrono_tz::UTC, 3).unwrap();
        assert_eq!(
            got,
            vec![utc(2026, 2, 22, 6, 0), utc(2026, 2, 22, 12, 0), utc(2026, 2, 22, 18, 0)]
        );
    }

    #[test]
    fn test_huge_interval_is_rejected_not_panicking() {
        assert!(matches!(validate("@every 99999999999d"), Err(WardenError::InvalidSchedule(_))));
        assert!(matches!(validate("@every 36601d"), Err(WardenError::InvalidSchedule(_))));
        assert!(validate("@every 36600d").is_ok());
        assert!(next_occurrence("@every 99999999999d", utc(2026, 2, 22, 10, 0), chrono_tz::UTC).is_err());

        // Near the end of representable time, the add itself is checked.
        let far = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert!(matches!(
            next_occurrence("@every 36600d", far, chrono_tz::UTC),
            Err(WardenError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_bad_timezone() {
        assert!(matches!(parse_timezone("Mars/Olympus"), Err(WardenError::Config(_))));
    }
}
