use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use goalsync_core::{
    DayCutoff, DayRule, DocumentRef, Goal, MetricKind, PollInterval, ValidationError,
    parse_timezone,
};

/// Environment variable that overrides `remote.auth_token`.
pub const AUTH_TOKEN_ENV: &str = "GOALSYNC_AUTH_TOKEN";

// ── Remote service ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API root; goal URLs are built as `{base_url}/users/{username}/goals/...`.
    pub base_url: String,
    pub username: String,
    /// Personal API token, sent with every request.  `GOALSYNC_AUTH_TOKEN`
    /// takes precedence when set.
    pub auth_token: String,
    /// Per-request timeout.  Expiry surfaces as a network failure.
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.beeminder.com/api/v1".to_string(),
            username: String::new(),
            auth_token: String::new(),
            timeout_secs: 15,
        }
    }
}

// ── Scheduling ───────────────────────────────────────────────────────────────

/// Whether an update for a day that already has a datapoint is always sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Overwrite today's datapoint on every reconciliation, so a value that
    /// went down (an unchecked task) is pushed too.
    #[default]
    AlwaysOverwrite,
    /// Skip the remote call when today's datapoint already holds the value.
    SkipUnchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA timezone used for day-stamps when a goal does not set its own.
    pub timezone: String,
    /// Default day boundary, `HH:MM`.  `00:00`-`06:00` keeps late nights on
    /// the previous day, `07:00`-`23:59` moves evenings onto the next day.
    pub day_cutoff: String,
    /// How often the worker checks the queue.
    pub drain_tick_ms: u64,
    /// Quiet period after a document change before its goals are queued.
    pub settle_delay_ms: u64,
    pub update_policy: UpdatePolicy,
    /// Queue auto-submit goals when their document changes on disk.
    pub submit_on_change: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            day_cutoff: "00:00".to_string(),
            drain_tick_ms: 1000,
            settle_delay_ms: 2000,
            update_policy: UpdatePolicy::AlwaysOverwrite,
            submit_on_change: false,
        }
    }
}

impl ScheduleConfig {
    pub fn day_rule(&self) -> Result<DayRule, ValidationError> {
        Ok(DayRule::new(
            parse_timezone(&self.timezone)?,
            self.day_cutoff.parse::<DayCutoff>()?,
        ))
    }
}

// ── Documents ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentsConfig {
    /// Root directory that relative document paths resolve against.
    pub vault_path: String,
    /// Folder (relative to the vault) holding daily notes.  Empty means the
    /// vault root.
    pub daily_notes_dir: String,
    /// chrono format string for daily note file names, without extension.
    pub daily_note_format: String,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            vault_path: ".".to_string(),
            daily_notes_dir: String::new(),
            daily_note_format: "%Y-%m-%d".to_string(),
        }
    }
}

// ── Goals ────────────────────────────────────────────────────────────────────

/// One `[[goals]]` entry as written by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalConfig {
    pub slug: String,
    /// `word-count`, `completed-task-count` or `uncompleted-task-count`.
    pub metric: String,
    /// `"daily"` for the daily note, otherwise a path relative to the vault.
    pub document: String,
    pub auto_submit: bool,
    pub interval_hours: u64,
    pub interval_minutes: u64,
    pub interval_seconds: u64,
    /// Overrides `schedule.timezone` for this goal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Overrides `schedule.day_cutoff` for this goal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_cutoff: Option<String>,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            slug: String::new(),
            metric: MetricKind::WordCount.to_string(),
            document: "daily".to_string(),
            auto_submit: false,
            interval_hours: 0,
            interval_minutes: 0,
            interval_seconds: 0,
            timezone: None,
            day_cutoff: None,
        }
    }
}

impl GoalConfig {
    /// Validate this entry against the global schedule defaults.
    pub fn resolve(&self, schedule: &ScheduleConfig) -> Result<Goal, ValidationError> {
        let metric = self.metric.parse::<MetricKind>()?;
        let document = DocumentRef::parse(&self.document)
            .ok_or_else(|| ValidationError::EmptyDocument(self.slug.clone()))?;
        let timezone = parse_timezone(self.timezone.as_deref().unwrap_or(&schedule.timezone))?;
        let cutoff = self
            .day_cutoff
            .as_deref()
            .unwrap_or(&schedule.day_cutoff)
            .parse::<DayCutoff>()?;
        let interval = PollInterval::new(
            self.interval_hours,
            self.interval_minutes,
            self.interval_seconds,
        );
        interval.validate()?;

        Ok(Goal::new(&self.slug, metric, document)?
            .with_schedule(self.auto_submit, interval)
            .with_day_rule(DayRule::new(timezone, cutoff)))
    }
}

/// A `[[goals]]` entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalIssue {
    /// 1-based position in the config file.
    pub position: usize,
    pub slug: String,
    pub error: ValidationError,
}

impl fmt::Display for GoalIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slug = if self.slug.trim().is_empty() { "<no slug>" } else { self.slug.as_str() };
        write!(f, "goal #{} ({slug}): {}", self.position, self.error)
    }
}

// ── Ambient sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/goalsync.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub schedule: ScheduleConfig,
    pub documents: DocumentsConfig,
    pub goals: Vec<GoalConfig>,
    pub telemetry: TelemetryConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(token) = env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                config.remote.auth_token = token;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Build every valid goal, collecting the invalid ones separately so a
    /// single bad entry never takes the others down.  A repeated slug is an
    /// issue for every occurrence after the first.
    pub fn resolve_goals(&self) -> (Vec<Goal>, Vec<GoalIssue>) {
        let mut goals: Vec<Goal> = Vec::new();
        let mut issues = Vec::new();

        for (idx, entry) in self.goals.iter().enumerate() {
            let issue = |error| GoalIssue {
                position: idx + 1,
                slug: entry.slug.clone(),
                error,
            };
            match entry.resolve(&self.schedule) {
                Ok(goal) if goals.iter().any(|g| g.slug == goal.slug) => {
                    issues.push(issue(ValidationError::DuplicateSlug(goal.slug)));
                }
                Ok(goal) => goals.push(goal),
                Err(err) => issues.push(issue(err)),
            }
        }

        (goals, issues)
    }

    /// Strict check: the global day rule and every goal must be valid.
    pub fn validate(&self) -> Result<Vec<Goal>, ValidationError> {
        self.schedule.day_rule()?;
        let (goals, issues) = self.resolve_goals();
        match issues.into_iter().next() {
            Some(issue) => Err(issue.error),
            None => Ok(goals),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.remote.username.trim().is_empty() && !self.remote.auth_token.trim().is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
