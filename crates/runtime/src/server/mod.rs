//! Sync daemon: owns the scheduler, its trigger sources and the control
//! socket.

mod connection;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tokio::net::UnixListener;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

use goalsync_config::AppConfig;
use goalsync_documents::{DocumentEvent, FsDocumentStore, spawn_document_watcher};
use goalsync_remote::{GoalService, HttpGoalService, InMemoryGoalService};

use crate::changes::spawn_change_trigger;
use crate::reconcile::Reconciler;
use crate::scheduler::Scheduler;
use crate::{DaemonStatus, GoalStatus};

struct DaemonState {
    scheduler: Scheduler,
    config_path: PathBuf,
    /// Invalid `[[goals]]` entries from the last load.
    config_issues: Vec<String>,
    started_at: Instant,
    dry_run: bool,
}

impl DaemonState {
    fn status(&self) -> DaemonStatus {
        DaemonStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            dry_run: self.dry_run,
            queue_depth: self.scheduler.queue_depth(),
            in_flight: self.scheduler.is_in_flight(),
            goals: self.scheduler.goal_statuses(),
            config_issues: self.config_issues.clone(),
        }
    }

    /// Re-read the goal list and apply it.  Remote credentials, the update
    /// policy and the document root are fixed for the daemon's lifetime.
    fn reload(&mut self) -> Result<String> {
        let config = AppConfig::load_from(&self.config_path)?;
        let goals = apply_goals(&self.scheduler, &config, &mut self.config_issues);
        Ok(format!(
            "config reloaded: {goals} goal(s), {} issue(s)",
            self.config_issues.len()
        ))
    }
}

/// Resolve the configured goals, log the invalid ones and hand the rest to
/// the scheduler.  Returns the number of goals applied.
fn apply_goals(scheduler: &Scheduler, config: &AppConfig, issues_out: &mut Vec<String>) -> usize {
    let (goals, issues) = config.resolve_goals();
    for issue in &issues {
        warn!(position = issue.position, slug = %issue.slug, error = %issue.error, "goal ignored");
    }
    *issues_out = issues.iter().map(ToString::to_string).collect();
    let count = goals.len();
    scheduler.reconfigure(goals);
    count
}

fn build_service(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn GoalService>> {
    if dry_run {
        info!("dry run: datapoints are kept in memory");
        return Ok(Arc::new(InMemoryGoalService::new()));
    }
    if !config.has_credentials() {
        bail!(
            "remote.username and remote.auth_token must be set (or export {}); use --dry-run to run without them",
            goalsync_config::AUTH_TOKEN_ENV
        );
    }
    let service = HttpGoalService::new(
        &config.remote.base_url,
        &config.remote.username,
        &config.remote.auth_token,
        Duration::from_secs(config.remote.timeout_secs.max(1)),
    )?;
    info!(base_url = %config.remote.base_url, user = %config.remote.username, "remote goal service configured");
    Ok(Arc::new(service))
}

/// Vault root made absolute so resolved document paths compare equal to
/// the paths the file watcher reports.
fn vault_root(config: &AppConfig) -> PathBuf {
    let raw = PathBuf::from(&config.documents.vault_path);
    std::fs::canonicalize(&raw).unwrap_or_else(|err| {
        warn!(path = %raw.display(), ?err, "vault path could not be resolved; using it as given");
        raw
    })
}

pub async fn run_sync_daemon(
    config: AppConfig,
    config_path: impl AsRef<Path>,
    socket_path: impl AsRef<Path>,
    dry_run: bool,
) -> Result<()> {
    let socket_path = socket_path.as_ref().to_path_buf();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    let service = build_service(&config, dry_run)?;
    let root = vault_root(&config);
    let documents = Arc::new(
        FsDocumentStore::new(&root).with_daily_notes(
            &config.documents.daily_notes_dir,
            config.documents.daily_note_format.clone(),
        ),
    );
    let reconciler = Reconciler::new(service, config.schedule.update_policy);
    let scheduler = Scheduler::new(
        reconciler,
        documents,
        Duration::from_millis(config.schedule.drain_tick_ms),
    );

    let mut config_issues = Vec::new();
    let goals = apply_goals(&scheduler, &config, &mut config_issues);
    if goals == 0 {
        warn!("no valid goals configured; waiting for a reload");
    }

    let drain = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    // The watcher stops when dropped, so it lives until the end of this function.
    let _watcher = if config.schedule.submit_on_change {
        let (tx, rx) = mpsc::unbounded_channel::<DocumentEvent>();
        match spawn_document_watcher(&root, tx) {
            Ok(watcher) => {
                spawn_change_trigger(
                    scheduler.clone(),
                    rx,
                    Duration::from_millis(config.schedule.settle_delay_ms),
                );
                info!(root = %root.display(), settle_ms = config.schedule.settle_delay_ms, "watching documents for changes");
                Some(watcher)
            }
            Err(err) => {
                warn!(?err, root = %root.display(), "document watcher unavailable; change triggers disabled");
                None
            }
        }
    } else {
        None
    };

    let state = Arc::new(Mutex::new(DaemonState {
        scheduler: scheduler.clone(),
        config_path: config_path.as_ref().to_path_buf(),
        config_issues,
        started_at: Instant::now(),
        dry_run,
    }));

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    info!(path = %socket_path.display(), goals, dry_run, "sync daemon listening");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let (stream, _) = accept?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection::handle_connection(stream, state, shutdown_tx).await {
                        error!(?err, "daemon connection handler failed");
                    }
                });
            }
        }
    }

    info!("daemon shutting down gracefully");
    scheduler.shutdown();
    // A reconciliation in flight runs to completion.
    if let Err(err) = drain.await {
        warn!(?err, "drain loop ended abnormally");
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// One-line rendering of a goal for the status listing.
pub fn describe_goal(goal: &GoalStatus) -> String {
    let timer = if goal.timer_armed {
        format!("every {}", goal.interval)
    } else {
        "manual".to_string()
    };
    let state = if goal.disabled { " [disabled]" } else { "" };
    format!(
        "{:>2}. {} ({} of {}, {timer}){state}",
        goal.index, goal.slug, goal.metric, goal.document
    )
}
