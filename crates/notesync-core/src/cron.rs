//! Cron expressions for the reconciliation jobs.
//!
//! Accepts 5-field (`m h dom mon dow`) or 6-field (`s m h dom mon dow`)
//! expressions. Every field supports `*`, `?`, single values, lists
//! (`1,5`), ranges (`1-5`) and steps (`*/10`, `0-30/5`). Day-of-week takes
//! 0-7 with both 0 and 7 meaning Sunday.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use thiserror::Error;

/// Upper bound on the forward scan when looking for the next fire time.
/// Feb 29 can be eight years apart across a skipped century leap year.
const MAX_SCAN_DAYS: i64 = 8 * 366;

/// Longest length of each month, leap years included.
const MONTH_DAYS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

#[derive(Debug, Error, PartialEq)]
pub enum CronError {
    #[error("cron expression '{0}' must have 5 or 6 fields")]
    FieldCount(String),
    #[error("invalid cron field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("cron expression '{0}' matches no calendar date")]
    NeverFires(String),
    #[error("no fire time within 8 years for '{0}'")]
    NoUpcomingFire(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidField {
            field: raw.to_string(),
            reason,
        };
        if raw == "*" || raw == "?" {
            return Ok(Self {
                bits: range_bits(min, max, 1),
                restricted: false,
            });
        }
        let mut bits = 0u64;
        for part in raw.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s.parse().map_err(|_| invalid(format!("bad step '{}'", s)))?;
                    if step == 0 {
                        return Err(invalid("step must be > 0".to_string()));
                    }
                    (r, step)
                }
                None => (part, 1),
            };
            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (parse_value(a, raw)?, parse_value(b, raw)?)
            } else {
                let v = parse_value(range, raw)?;
                // `5/15` means "from 5 to the end, every 15".
                if part.contains('/') {
                    (v, max)
                } else {
                    (v, v)
                }
            };
            if lo < min || hi > max || lo > hi {
                return Err(invalid(format!("out of range ({}-{})", min, max)));
            }
            bits |= range_bits(lo, hi, step);
        }
        Ok(Self {
            bits,
            restricted: true,
        })
    }

    fn contains(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }

    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

fn range_bits(lo: u32, hi: u32, step: u32) -> u64 {
    (lo..=hi).step_by(step as usize).fold(0u64, |acc, v| acc | (1u64 << v))
}

fn parse_value(s: &str, raw: &str) -> Result<u32, CronError> {
    s.parse().map_err(|_| CronError::InvalidField {
        field: raw.to_string(),
        reason: format!("'{}' is not a number", s),
    })
}

/// Parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    raw: String,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self, CronError> {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        let (seconds, rest) = match parts.len() {
            5 => ("0", &parts[..]),
            6 => (parts[0], &parts[1..]),
            _ => return Err(CronError::FieldCount(trimmed.to_string())),
        };
        let mut days_of_week = FieldSet::parse(rest[4], 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
        }
        let schedule = Self {
            seconds: FieldSet::parse(seconds, 0, 59)?,
            minutes: FieldSet::parse(rest[0], 0, 59)?,
            hours: FieldSet::parse(rest[1], 0, 23)?,
            days_of_month: FieldSet::parse(rest[2], 1, 31)?,
            months: FieldSet::parse(rest[3], 1, 12)?,
            days_of_week,
            raw: trimmed.to_string(),
        };
        if !schedule.has_calendar_date() {
            return Err(CronError::NeverFires(schedule.raw));
        }
        Ok(schedule)
    }

    /// A restricted day-of-week always lands on some date; otherwise some
    /// listed month must be long enough for some listed day-of-month.
    fn has_calendar_date(&self) -> bool {
        if self.days_of_week.restricted {
            return true;
        }
        self.months.values().any(|month| {
            self.days_of_month
                .values()
                .any(|day| day <= MONTH_DAYS[(month - 1) as usize])
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// First fire time strictly after `now`, in `now`'s zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>, CronError> {
        let midnight = now
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| CronError::NoUpcomingFire(self.raw.clone()))?;
        for offset in 0..=MAX_SCAN_DAYS {
            let day = midnight.clone() + Duration::days(offset);
            if !self.matches_day(&day) {
                continue;
            }
            for hour in self.hours.values() {
                for minute in self.minutes.values() {
                    for second in self.seconds.values() {
                        let secs = i64::from(hour * 3600 + minute * 60 + second);
                        let candidate = day.clone() + Duration::seconds(secs);
                        if candidate > *now {
                            return Ok(candidate);
                        }
                    }
                }
            }
        }
        Err(CronError::NoUpcomingFire(self.raw.clone()))
    }

    fn matches_day<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        if !self.months.contains(t.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(t.day());
        let dow = self.days_of_week.contains(t.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_hourly_at_ten() {
        let c = CronSchedule::parse("10 * * * *").unwrap();
        assert_eq!(c.next_after(&at(6, 14, 5, 0)).unwrap(), at(6, 14, 10, 0));
        assert_eq!(c.next_after(&at(6, 14, 10, 0)).unwrap(), at(6, 15, 10, 0));
    }

    #[test]
    fn test_six_field_with_seconds() {
        let c = CronSchedule::parse("30 0 */2 * * ?").unwrap();
        assert_eq!(c.next_after(&at(6, 13, 0, 0)).unwrap(), at(6, 14, 0, 30));
        assert_eq!(c.next_after(&at(6, 14, 0, 29)).unwrap(), at(6, 14, 0, 30));
        assert_eq!(c.next_after(&at(6, 14, 0, 30)).unwrap(), at(6, 16, 0, 30));
    }

    #[test]
    fn test_lists_ranges_and_steps() {
        let c = CronSchedule::parse("0,30 9-10 * * 1-5").unwrap();
        // 2024-05-04 is a Saturday.
        assert_eq!(c.next_after(&at(4, 12, 0, 0)).unwrap(), at(6, 9, 0, 0));
        assert_eq!(c.next_after(&at(6, 9, 0, 0)).unwrap(), at(6, 9, 30, 0));
        assert_eq!(c.next_after(&at(6, 10, 30, 0)).unwrap(), at(7, 9, 0, 0));
    }

    #[test]
    fn test_sunday_as_seven() {
        let c = CronSchedule::parse("0 3 * * 7").unwrap();
        assert_eq!(c.next_after(&at(6, 0, 0, 0)).unwrap(), at(12, 3, 0, 0));
    }

    #[test]
    fn test_respects_zone() {
        let zone = FixedOffset::east_opt(9 * 3600).unwrap();
        let c = CronSchedule::parse("0 0 * * *").unwrap();
        let now = zone.with_ymd_and_hms(2024, 5, 6, 23, 59, 0).unwrap();
        let next = c.next_after(&now).unwrap();
        assert_eq!(next, zone.with_ymd_and_hms(2024, 5, 7, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * *"),
            Err(CronError::FieldCount(_))
        ));
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
        assert!(CronSchedule::parse("0 0 31 2-1 *").is_err());
    }

    #[test]
    fn test_impossible_dates_are_rejected() {
        for raw in ["0 0 31 2 *", "0 0 30 2 *", "0 0 31 4,6,9,11 *"] {
            assert_eq!(
                CronSchedule::parse(raw),
                Err(CronError::NeverFires(raw.to_string())),
                "{}",
                raw
            );
        }
        // Day-of-week makes the date reachable again.
        assert!(CronSchedule::parse("0 0 31 2 1").is_ok());
    }

    #[test]
    fn test_leap_day_fires_years_ahead() {
        let c = CronSchedule::parse("0 0 29 2 *").unwrap();
        let next = c.next_after(&at(6, 0, 0, 0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2028, 2, 29, 0, 0, 0).unwrap());

        // 2100 is not a leap year.
        let from = Utc.with_ymd_and_hms(2096, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            c.next_after(&from).unwrap(),
            Utc.with_ymd_and_hms(2104, 2, 29, 0, 0, 0).unwrap()
        );
    }
}
