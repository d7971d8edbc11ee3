use thiserror::Error;

/// Configuration and input problems.  These are always reported, never
/// coerced into a nearby valid value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed day cutoff '{0}' (expected HH:MM)")]
    MalformedCutoff(String),

    #[error("day cutoff {0} is between 06:00 and 07:00; use 00:00-06:00 or 07:00-23:59")]
    CutoffOutOfRange(String),

    #[error("unsupported metric kind '{0}'")]
    UnsupportedMetricKind(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("malformed day-stamp '{0}' (expected YYYYMMDD or YYYY-MM-DD)")]
    MalformedDayStamp(String),

    #[error("goal slug must not be empty")]
    EmptySlug,

    #[error("goal slug '{0}' is configured more than once")]
    DuplicateSlug(String),

    #[error("goal '{0}' has an empty document reference")]
    EmptyDocument(String),

    #[error("submission interval {0} is longer than a year")]
    IntervalTooLong(String),
}
