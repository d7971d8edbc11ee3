use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    Manual,
    Timer,
    ContentChange,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Timer => "timer",
            TriggerSource::ContentChange => "content-change",
        })
    }
}

/// A request to reconcile one goal.  Consumed exactly once by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrigger {
    pub slug: String,
    pub source: TriggerSource,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingTrigger {
    pub fn new(slug: impl Into<String>, source: TriggerSource) -> Self {
        Self {
            slug: slug.into(),
            source,
            enqueued_at: Utc::now(),
        }
    }
}

/// FIFO shared by every trigger source.  Duplicates are kept: two triggers
/// for the same goal reconcile twice.
#[derive(Debug, Default)]
pub struct TriggerQueue {
    items: Mutex<VecDeque<PendingTrigger>>,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, trigger: PendingTrigger) {
        self.lock().push_back(trigger);
    }

    pub fn pop(&self) -> Option<PendingTrigger> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Slugs currently waiting, front first.
    pub fn pending(&self) -> Vec<String> {
        self.lock().iter().map(|t| t.slug.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingTrigger>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
