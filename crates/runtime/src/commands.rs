use serde::{Deserialize, Serialize};

use crate::SyncEvent;
use crate::events::LastOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalStatus {
    /// 1-based position, as accepted by `SubmitGoal`.
    pub index: usize,
    pub slug: String,
    pub metric: String,
    pub document: String,
    pub auto_submit: bool,
    pub interval: String,
    pub timer_armed: bool,
    /// Stopped after the remote reported the goal missing.
    pub disabled: bool,
    pub last_outcome: Option<LastOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    pub dry_run: bool,
    pub queue_depth: usize,
    pub in_flight: bool,
    pub goals: Vec<GoalStatus>,
    /// Goals from the configuration that failed validation.
    pub config_issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    /// Queue one goal by its 1-based position.
    SubmitGoal { index: usize },
    SubmitAll,
    GetStatus,
    ReloadConfig,
    /// Keep the connection open and receive every sync event.
    Subscribe,
    Shutdown,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Sync(SyncEvent),
    Status(DaemonStatus),
    Ack(String),
    Error(String),
}
