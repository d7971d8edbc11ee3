use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use goalsync_remote::ErrorClass;

use crate::reconcile::Action;
use crate::scheduler::TriggerSource;

/// Broadcast to subscribers as the scheduler works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    Enqueued {
        slug: String,
        source: TriggerSource,
    },
    Reconciled {
        slug: String,
        source: TriggerSource,
        action: Action,
    },
    Skipped {
        slug: String,
        reason: String,
    },
    Failed {
        slug: String,
        class: ErrorClass,
        message: String,
    },
    /// Credentials were rejected.  Kept apart from `Failed` so front ends
    /// can surface it prominently.
    AuthFailed {
        slug: String,
        message: String,
    },
    Reconfigured {
        goals: usize,
        timers: usize,
    },
}

impl SyncEvent {
    pub fn slug(&self) -> Option<&str> {
        match self {
            SyncEvent::Enqueued { slug, .. }
            | SyncEvent::Reconciled { slug, .. }
            | SyncEvent::Skipped { slug, .. }
            | SyncEvent::Failed { slug, .. }
            | SyncEvent::AuthFailed { slug, .. } => Some(slug),
            SyncEvent::Reconfigured { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncEvent::Failed { .. } | SyncEvent::AuthFailed { .. })
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::Enqueued { slug, source } => write!(f, "{slug}: queued ({source})"),
            SyncEvent::Reconciled { slug, source, action } => {
                let dp = action.datapoint();
                let day = dp
                    .daystamp
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "?".to_string());
                write!(f, "{slug}: {} {} for {day} ({source})", action.label(), dp.value)
            }
            SyncEvent::Skipped { slug, reason } => write!(f, "{slug}: skipped, {reason}"),
            SyncEvent::Failed { slug, class, message } => {
                write!(f, "{slug}: failed ({class:?}): {message}")
            }
            SyncEvent::AuthFailed { slug, message } => {
                write!(f, "{slug}: AUTHENTICATION FAILED: {message}")
            }
            SyncEvent::Reconfigured { goals, timers } => {
                write!(f, "configuration applied: {goals} goal(s), {timers} timer(s)")
            }
        }
    }
}

/// Most recent result recorded for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOutcome {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub summary: String,
}

impl LastOutcome {
    pub fn from_event(event: &SyncEvent, at: DateTime<Utc>) -> Self {
        Self {
            at,
            ok: !event.is_failure(),
            summary: event.to_string(),
        }
    }
}
