//! Day-boundary arithmetic.
//!
//! A goal's "day" does not have to end at midnight.  A *night-owl* cutoff
//! (00:00 through 06:00) keeps late-night activity on the previous calendar
//! day; an *early-bird* cutoff (07:00 through 23:59) moves evening activity
//! onto the next one.  Cutoffs strictly between 06:00 and 07:00 are rejected
//! when the cutoff is constructed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Which side of midnight a cutoff sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffRegime {
    /// `[00:00, 06:00]`: before the cutoff still belongs to yesterday.
    NightOwl,
    /// `[07:00, 23:59]`: at or after the cutoff already belongs to tomorrow.
    EarlyBird,
}

/// A validated time of day at which a goal's day rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayCutoff {
    hour: u8,
    minute: u8,
}

impl DayCutoff {
    /// Midnight: the plain calendar day.
    pub const MIDNIGHT: DayCutoff = DayCutoff { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Result<Self, ValidationError> {
        if hour > 23 || minute > 59 {
            return Err(ValidationError::MalformedCutoff(format!("{hour:02}:{minute:02}")));
        }
        if hour == 6 && minute > 0 {
            return Err(ValidationError::CutoffOutOfRange(format!("{hour:02}:{minute:02}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn regime(&self) -> CutoffRegime {
        if self.hour <= 6 {
            CutoffRegime::NightOwl
        } else {
            CutoffRegime::EarlyBird
        }
    }

    fn as_time(&self) -> NaiveTime {
        // Fields are range-checked in `new`.
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl Default for DayCutoff {
    fn default() -> Self {
        Self::MIDNIGHT
    }
}

impl fmt::Display for DayCutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for DayCutoff {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let malformed = || ValidationError::MalformedCutoff(trimmed.to_string());
        let (hour, minute) = trimmed.split_once(':').ok_or_else(malformed)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(malformed());
        }
        let hour: u8 = hour.parse().map_err(|_| malformed())?;
        let minute: u8 = minute.parse().map_err(|_| malformed())?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for DayCutoff {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DayCutoff> for String {
    fn from(value: DayCutoff) -> Self {
        value.to_string()
    }
}

/// A calendar day as the remote service buckets datapoints.
///
/// Displays as `YYYY-MM-DD`; [`DayStamp::compact`] gives the `YYYYMMDD` wire
/// form.  Both forms parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DayStamp(NaiveDate);

impl DayStamp {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn compact(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    pub fn previous(&self) -> Self {
        Self(self.0.pred_opt().unwrap_or(self.0))
    }

    pub fn next(&self) -> Self {
        Self(self.0.succ_opt().unwrap_or(self.0))
    }
}

impl fmt::Display for DayStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.0.year(), self.0.month(), self.0.day())
    }
}

impl FromStr for DayStamp {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let malformed = || ValidationError::MalformedDayStamp(trimmed.to_string());
        let digits: String = match trimmed.len() {
            8 => trimmed.to_string(),
            10 if trimmed.as_bytes()[4] == b'-' && trimmed.as_bytes()[7] == b'-' => {
                trimmed.replace('-', "")
            }
            _ => return Err(malformed()),
        };
        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let year: i32 = digits[0..4].parse().map_err(|_| malformed())?;
        let month: u32 = digits[4..6].parse().map_err(|_| malformed())?;
        let day: u32 = digits[6..8].parse().map_err(|_| malformed())?;
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self)
            .ok_or_else(malformed)
    }
}

impl TryFrom<String> for DayStamp {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DayStamp> for String {
    fn from(value: DayStamp) -> Self {
        value.to_string()
    }
}

/// Map an instant onto the day it counts toward.
///
/// The boundary is the local calendar date of `now` in `timezone` at
/// `cutoff`, compared on local wall-clock time.
pub fn day_stamp(now: DateTime<Utc>, timezone: Tz, cutoff: DayCutoff) -> DayStamp {
    let local = now.with_timezone(&timezone);
    let today = DayStamp(local.date_naive());
    let before_boundary = local.time() < cutoff.as_time();

    match cutoff.regime() {
        CutoffRegime::NightOwl if before_boundary => today.previous(),
        CutoffRegime::NightOwl => today,
        CutoffRegime::EarlyBird if before_boundary => today,
        CutoffRegime::EarlyBird => today.next(),
    }
}

/// Timezone plus cutoff: everything needed to stamp an instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayRule {
    pub timezone: Tz,
    pub cutoff: DayCutoff,
}

impl DayRule {
    pub fn new(timezone: Tz, cutoff: DayCutoff) -> Self {
        Self { timezone, cutoff }
    }

    pub fn stamp(&self, now: DateTime<Utc>) -> DayStamp {
        day_stamp(now, self.timezone, self.cutoff)
    }
}

impl Default for DayRule {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            cutoff: DayCutoff::MIDNIGHT,
        }
    }
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))
}
