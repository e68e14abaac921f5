//! Reconciliation window algebra.
//!
//! Both sweep cadences anchor on `now` truncated to the hour:
//!
//! ```text
//!   major: (-inf, H - major_lag]
//!   minor: [H - (safety_buffer + minor_span), H - safety_buffer)
//! ```
//!
//! With the defaults (10m buffer, 60m span, 130m lag) that is
//! `[H-1h10m, H-10m)` and `(-inf, H-2h10m]`. The trailing buffer keeps the
//! minor sweep from racing CDC events still in flight.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("minor span must be positive")]
    EmptyMinorSpan,
    #[error("safety buffer must not be negative")]
    NegativeBuffer,
    #[error(
        "major lag ({major_lag_minutes}m) must exceed safety buffer + minor span ({minor_reach_minutes}m)"
    )]
    Overlap {
        major_lag_minutes: i64,
        minor_reach_minutes: i64,
    },
}

/// Sweep cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Minor,
    Major,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Minor => "minor",
            Cadence::Major => "major",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minor" => Ok(Cadence::Minor),
            "major" => Ok(Cadence::Major),
            other => Err(format!("unknown cadence '{}'. Must be minor or major.", other)),
        }
    }
}

/// Tunable offsets for both cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub safety_buffer: Duration,
    pub minor_span: Duration,
    pub major_lag: Duration,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            safety_buffer: Duration::minutes(10),
            minor_span: Duration::minutes(60),
            major_lag: Duration::minutes(130),
        }
    }
}

impl WindowPolicy {
    pub fn from_minutes(safety_buffer: i64, minor_span: i64, major_lag: i64) -> Self {
        Self {
            safety_buffer: Duration::minutes(safety_buffer),
            minor_span: Duration::minutes(minor_span),
            major_lag: Duration::minutes(major_lag),
        }
    }

    /// The major cutoff must sit strictly before the minor lower bound.
    pub fn validate(&self) -> Result<(), WindowError> {
        if self.safety_buffer < Duration::zero() {
            return Err(WindowError::NegativeBuffer);
        }
        if self.minor_span <= Duration::zero() {
            return Err(WindowError::EmptyMinorSpan);
        }
        let minor_reach = self.safety_buffer + self.minor_span;
        if self.major_lag <= minor_reach {
            return Err(WindowError::Overlap {
                major_lag_minutes: self.major_lag.num_minutes(),
                minor_reach_minutes: minor_reach.num_minutes(),
            });
        }
        Ok(())
    }
}

/// A range over modification timestamps.
///
/// `start: None` means unbounded below. `end_inclusive` distinguishes the
/// minor `[start, end)` shape from the major `(-inf, end]` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub end_inclusive: bool,
}

pub fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

impl SyncWindow {
    pub fn minor(now: DateTime<Utc>, policy: &WindowPolicy) -> Self {
        let anchor = truncate_to_hour(now);
        let end = anchor - policy.safety_buffer;
        Self {
            start: Some(end - policy.minor_span),
            end,
            end_inclusive: false,
        }
    }

    pub fn major(now: DateTime<Utc>, policy: &WindowPolicy) -> Self {
        Self {
            start: None,
            end: truncate_to_hour(now) - policy.major_lag,
            end_inclusive: true,
        }
    }

    pub fn for_cadence(cadence: Cadence, now: DateTime<Utc>, policy: &WindowPolicy) -> Self {
        match cadence {
            Cadence::Minor => Self::minor(now, policy),
            Cadence::Major => Self::major(now, policy),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        let above_start = self.start.map_or(true, |s| ts >= s);
        let below_end = if self.end_inclusive {
            ts <= self.end
        } else {
            ts < self.end
        };
        above_start && below_end
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(s) => write!(f, "[{}, ", s.to_rfc3339())?,
            None => write!(f, "(-inf, ")?,
        }
        write!(
            f,
            "{}{}",
            self.end.to_rfc3339(),
            if self.end_inclusive { "]" } else { ")" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, h, m, s).unwrap()
    }

    #[test]
    fn test_minor_window_bounds() {
        let w = SyncWindow::minor(at(14, 37, 12), &WindowPolicy::default());
        assert_eq!(w.start, Some(at(12, 50, 0)));
        assert_eq!(w.end, at(13, 50, 0));
        assert!(!w.end_inclusive);
    }

    #[test]
    fn test_major_window_bounds() {
        let w = SyncWindow::major(at(14, 37, 12), &WindowPolicy::default());
        assert_eq!(w.start, None);
        assert_eq!(w.end, at(11, 50, 0));
        assert!(w.contains(at(11, 50, 0)));
        assert!(w.contains(Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap()));
        assert!(!w.contains(at(11, 50, 1)));
    }

    #[test]
    fn test_minor_excludes_trailing_buffer() {
        let policy = WindowPolicy::default();
        for minute in 0..60 {
            let now = at(9, minute, 30);
            let w = SyncWindow::minor(now, &policy);
            let buffer_start = truncate_to_hour(now) - policy.safety_buffer;
            assert!(!w.contains(buffer_start));
            assert!(!w.contains(now));
            assert!(!w.contains(now - Duration::minutes(10)));
        }
    }

    #[test]
    fn test_major_strictly_before_minor() {
        let policy = WindowPolicy::default();
        for hour in 0..24 {
            let now = at(hour, 17, 0);
            let minor = SyncWindow::minor(now, &policy);
            let major = SyncWindow::major(now, &policy);
            assert!(major.end < minor.start.unwrap());
            assert!(!minor.contains(major.end));
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(WindowPolicy::default().validate().is_ok());
        assert_eq!(
            WindowPolicy::from_minutes(10, 60, 70).validate(),
            Err(WindowError::Overlap {
                major_lag_minutes: 70,
                minor_reach_minutes: 70
            })
        );
        assert_eq!(
            WindowPolicy::from_minutes(10, 0, 130).validate(),
            Err(WindowError::EmptyMinorSpan)
        );
    }

    #[test]
    fn test_display() {
        let w = SyncWindow::major(at(3, 0, 0), &WindowPolicy::default());
        assert_eq!(w.to_string(), "(-inf, 2024-05-06T00:50:00+00:00]");
    }
}
