//! Compound interval codec: `"D HH:MM:SS"` <-> (days, hours, minutes, seconds).

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("invalid interval {0:?}: expected \"D HH:MM:SS\"")]
    Separator(String),
    #[error("invalid interval field {field} in {input:?}: not an integer")]
    NotInteger { field: &'static str, input: String },
    #[error("invalid interval field {field} in {input:?}: negative value")]
    Negative { field: &'static str, input: String },
}

/// Recurrence interval of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Interval {
    pub fn new(days: u64, hours: u64, minutes: u64, seconds: u64) -> Self {
        Self { days, hours, minutes, seconds }
    }

    /// Normalized interval (hours < 24, minutes < 60, seconds < 60).
    pub fn from_seconds(total: u64) -> Self {
        Self {
            days: total / SECS_PER_DAY,
            hours: total % SECS_PER_DAY / SECS_PER_HOUR,
            minutes: total % SECS_PER_HOUR / SECS_PER_MINUTE,
            seconds: total % SECS_PER_MINUTE,
        }
    }

    pub fn to_seconds(&self) -> u64 {
        self.days
            .saturating_mul(SECS_PER_DAY)
            .saturating_add(self.hours.saturating_mul(SECS_PER_HOUR))
            .saturating_add(self.minutes.saturating_mul(SECS_PER_MINUTE))
            .saturating_add(self.seconds)
    }

    pub fn is_zero(&self) -> bool {
        self.to_seconds() == 0
    }
}

pub fn parse_duration(s: &str) -> Result<Interval, DurationError> {
    let separator = || DurationError::Separator(s.to_string());

    let (days, clock) = s.trim().split_once(' ').ok_or_else(separator)?;
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() != 3 || days.contains(':') {
        return Err(separator());
    }

    let field = |name: &'static str, raw: &str| -> Result<u64, DurationError> {
        let value: i64 = raw.trim().parse().map_err(|_| DurationError::NotInteger {
            field: name,
            input: s.to_string(),
        })?;
        u64::try_from(value).map_err(|_| DurationError::Negative {
            field: name,
            input: s.to_string(),
        })
    };

    Ok(Interval {
        days: field("days", days)?,
        hours: field("hours", parts[0])?,
        minutes: field("minutes", parts[1])?,
        seconds: field("seconds", parts[2])?,
    })
}

pub fn format_duration(days: u64, hours: u64, minutes: u64, seconds: u64) -> String {
    format!("{} {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_duration(self.days, self.hours, self.minutes, self.seconds))
    }
}

impl FromStr for Interval {
    type Err = DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
