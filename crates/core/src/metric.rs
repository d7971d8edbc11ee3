use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const COMPLETED_MARKER: &str = "- [x]";
const UNCOMPLETED_MARKER: &str = "- [ ]";

/// What gets counted in a tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    WordCount,
    #[serde(rename = "completed-task-count")]
    CompletedTasks,
    #[serde(rename = "uncompleted-task-count")]
    UncompletedTasks,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::WordCount,
        MetricKind::CompletedTasks,
        MetricKind::UncompletedTasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::WordCount => "word-count",
            MetricKind::CompletedTasks => "completed-task-count",
            MetricKind::UncompletedTasks => "uncompleted-task-count",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == trimmed)
            .ok_or_else(|| ValidationError::UnsupportedMetricKind(trimmed.to_string()))
    }
}

/// Count `kind` in `text`.
pub fn extract(text: &str, kind: MetricKind) -> u64 {
    match kind {
        MetricKind::WordCount => text.split_whitespace().count() as u64,
        MetricKind::CompletedTasks => count_marked_lines(text, COMPLETED_MARKER),
        MetricKind::UncompletedTasks => count_marked_lines(text, UNCOMPLETED_MARKER),
    }
}

// `lines()` splits on `\n` and strips a trailing `\r`, so CRLF files count the same.
fn count_marked_lines(text: &str, marker: &str) -> u64 {
    text.lines()
        .filter(|line| line.trim().starts_with(marker))
        .count() as u64
}
