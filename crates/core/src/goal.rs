use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DayRule, MetricKind, ValidationError};

/// Where a goal's document lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentRef {
    /// A fixed path, relative to the document store root unless absolute.
    Path(PathBuf),
    /// The daily note for the goal's current day-stamp.
    DailyNote,
}

impl DocumentRef {
    /// `"daily"` selects the daily note; anything else is a path.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.eq_ignore_ascii_case("daily") {
            Some(DocumentRef::DailyNote)
        } else {
            Some(DocumentRef::Path(PathBuf::from(trimmed)))
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentRef::Path(path) => write!(f, "{}", path.display()),
            DocumentRef::DailyNote => f.write_str("daily note"),
        }
    }
}

/// Periodic submission interval.  All-zero disables the timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollInterval {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl PollInterval {
    /// Longest accepted interval.
    pub const MAX_SECONDS: u64 = 366 * 24 * 3600;

    pub fn new(hours: u64, minutes: u64, seconds: u64) -> Self {
        Self { hours, minutes, seconds }
    }

    pub fn total_seconds(&self) -> u64 {
        self.hours
            .saturating_mul(3600)
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.seconds)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.total_seconds() > Self::MAX_SECONDS {
            return Err(ValidationError::IntervalTooLong(self.to_string()));
        }
        Ok(())
    }

    /// `None` when the interval is zero.  Never longer than
    /// [`PollInterval::MAX_SECONDS`], so timer deadlines cannot overflow.
    pub fn as_duration(&self) -> Option<Duration> {
        match self.total_seconds() {
            0 => None,
            secs => Some(Duration::from_secs(secs.min(Self::MAX_SECONDS))),
        }
    }
}

impl fmt::Display for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h{:02}m{:02}s", self.hours, self.minutes, self.seconds)
    }
}

/// One tracked remote series and how to compute its value locally.
///
/// Goals are configuration: they are built once from settings and shared
/// read-only with the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub slug: String,
    pub metric: MetricKind,
    pub document: DocumentRef,
    pub auto_submit: bool,
    pub interval: PollInterval,
    pub day: DayRule,
}

impl Goal {
    pub fn new(
        slug: impl Into<String>,
        metric: MetricKind,
        document: DocumentRef,
    ) -> Result<Self, ValidationError> {
        let slug = slug.into().trim().to_string();
        if slug.is_empty() {
            return Err(ValidationError::EmptySlug);
        }
        Ok(Self {
            slug,
            metric,
            document,
            auto_submit: false,
            interval: PollInterval::default(),
            day: DayRule::default(),
        })
    }

    pub fn with_schedule(mut self, auto_submit: bool, interval: PollInterval) -> Self {
        self.auto_submit = auto_submit;
        self.interval = interval;
        self
    }

    pub fn with_day_rule(mut self, day: DayRule) -> Self {
        self.day = day;
        self
    }

    /// Period of the recurring timer, if this goal has one.
    pub fn timer_period(&self) -> Option<Duration> {
        if self.auto_submit {
            self.interval.as_duration()
        } else {
            None
        }
    }
}

/// Slugs must be unique across the goals that get scheduled.
pub fn validate_unique_slugs<'a>(
    goals: impl IntoIterator<Item = &'a Goal>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for goal in goals {
        if !seen.insert(goal.slug.as_str()) {
            return Err(ValidationError::DuplicateSlug(goal.slug.clone()));
        }
    }
    Ok(())
}
