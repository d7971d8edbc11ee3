mod daemon;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use goalsync_config::AppConfig;
use goalsync_core::{DayRule, MetricKind, extract};
use goalsync_runtime::{DaemonClient, DaemonStatus, describe_goal};

use crate::daemon::{DaemonCommands, daemon_paths, is_socket_live};

pub(crate) const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(
    name = "goalsync",
    version,
    about = "Keep remote goal datapoints in step with your notes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sync daemon in the foreground.
    Start {
        /// Keep datapoints in memory instead of calling the remote service.
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Queue goals for reconciliation on the running daemon.
    Submit {
        /// 1-based goal position, as listed by `goalsync status`.
        #[arg(value_name = "N", required_unless_present = "all")]
        index: Option<usize>,
        #[arg(long, conflicts_with = "index")]
        all: bool,
    },
    /// Show goals, timers and the last outcome of each goal.
    Status,
    /// Reload the goal list from the configuration file.
    Reload,
    /// Print sync events as they happen.
    Watch,
    /// Print the day-stamp a submission would use.
    Daystamp {
        /// RFC 3339 instant; defaults to now.
        #[arg(long)]
        at: Option<String>,
        /// Use this goal's day rule instead of the global one.
        #[arg(long)]
        goal: Option<String>,
    },
    /// Print the metric value of a local file.
    Measure {
        path: PathBuf,
        #[arg(long, default_value = "word-count")]
        metric: String,
    },
    /// Check the configuration and report problems.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load_from(CONFIG_PATH)?;

    if std::env::var(daemon::DAEMON_PROCESS_ENV).ok().as_deref() == Some("1") {
        let dry_run = std::env::var(daemon::DAEMON_DRY_RUN_ENV).ok().as_deref() == Some("1");
        let _guard = init_daemon_logging(&config)?;
        daemon::run_daemon_process(config, dry_run).await?;
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { dry_run } => {
            daemon::run_daemon_process(config, dry_run).await?;
        }
        Commands::Daemon { command } => {
            daemon::run_daemon_command(command).await?;
        }
        Commands::Submit { index, all } => {
            let client = connect(&config)?;
            let ack = match (index, all) {
                (_, true) => client.submit_all().await?,
                (Some(index), false) => client.submit_goal(index).await?,
                (None, false) => bail!("pass a goal number or --all"),
            };
            println!("{ack}");
        }
        Commands::Status => {
            let client = connect(&config)?;
            let status = client.get_status().await?;
            for line in render_status(&status) {
                println!("{line}");
            }
        }
        Commands::Reload => {
            let client = connect(&config)?;
            println!("{}", client.reload_config().await?);
        }
        Commands::Watch => {
            let client = connect(&config)?;
            run_watch(client).await?;
        }
        Commands::Daystamp { at, goal } => {
            let now = match at {
                Some(raw) => parse_instant(&raw)?,
                None => Utc::now(),
            };
            let rule = day_rule_for(&config, goal.as_deref())?;
            println!(
                "{} ({} cutoff {}, {:?})",
                rule.stamp(now),
                rule.timezone,
                rule.cutoff,
                rule.cutoff.regime()
            );
        }
        Commands::Measure { path, metric } => {
            let kind: MetricKind = metric.parse()?;
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            println!("{}", extract(&text, kind));
        }
        Commands::Doctor => run_doctor(&config)?,
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured level.
fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.trim()))
}

/// Background daemons log to a file under the runtime directory.  The
/// returned guard flushes pending lines when dropped.
fn init_daemon_logging(config: &AppConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let file_name = paths
        .log_file
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "daemon.log".into());
    let appender = tracing_appender::rolling::never(&paths.runtime_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(guard)
}

fn connect(config: &AppConfig) -> Result<DaemonClient> {
    let socket = Path::new(&config.daemon.socket_path);
    if !is_socket_live(socket) {
        bail!(
            "daemon is not running on {}; start it with `goalsync daemon start`",
            socket.display()
        );
    }
    Ok(DaemonClient::new(socket))
}

async fn run_watch(client: DaemonClient) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = tokio::spawn(async move { client.subscribe(tx).await });
    println!("watching sync events (ctrl-c to stop)");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                println!("[{}] {event}", Local::now().format("%H:%M:%S"));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscription.abort();
    Ok(())
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("'{raw}' is not an RFC 3339 timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn day_rule_for(config: &AppConfig, goal: Option<&str>) -> Result<DayRule> {
    let Some(slug) = goal else {
        return Ok(config.schedule.day_rule()?);
    };
    let (goals, issues) = config.resolve_goals();
    if let Some(goal) = goals.into_iter().find(|g| g.slug == slug) {
        return Ok(goal.day);
    }
    if let Some(issue) = issues.iter().find(|i| i.slug.trim() == slug) {
        bail!("{issue}");
    }
    bail!("no goal '{slug}' in {CONFIG_PATH}")
}

fn render_status(status: &DaemonStatus) -> Vec<String> {
    let mut lines = vec![
        format!(
            "daemon up {}{}",
            format_uptime(status.uptime_secs),
            if status.dry_run { " (dry run)" } else { "" }
        ),
        format!(
            "queue: {} pending, worker {}",
            status.queue_depth,
            if status.in_flight { "busy" } else { "idle" }
        ),
    ];
    if status.goals.is_empty() {
        lines.push("no goals configured".to_string());
    }
    for goal in &status.goals {
        lines.push(describe_goal(goal));
        if let Some(last) = &goal.last_outcome {
            lines.push(format!(
                "      last {}: {}",
                last.at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                last.summary
            ));
        }
    }
    for issue in &status.config_issues {
        lines.push(format!("ignored {issue}"));
    }
    lines
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn run_doctor(config: &AppConfig) -> Result<()> {
    println!("goalsync doctor");
    println!(
        "- config: {CONFIG_PATH} ({})",
        if Path::new(CONFIG_PATH).exists() { "found" } else { "missing, using defaults" }
    );
    println!("- remote: {} as '{}'", config.remote.base_url, config.remote.username);
    println!(
        "- credentials: {}",
        if config.has_credentials() { "set" } else { "missing (only --dry-run will work)" }
    );
    println!(
        "- day rule: {} cutoff {}, policy {:?}",
        config.schedule.timezone, config.schedule.day_cutoff, config.schedule.update_policy
    );
    let vault = Path::new(&config.documents.vault_path);
    println!(
        "- vault: {} ({})",
        vault.display(),
        if vault.is_dir() { "found" } else { "missing" }
    );
    println!(
        "- daemon: {}",
        if is_socket_live(Path::new(&config.daemon.socket_path)) { "running" } else { "stopped" }
    );

    let mut problems = 0;
    if let Err(err) = config.schedule.day_rule() {
        println!("! schedule: {err}");
        problems += 1;
    }
    let (goals, issues) = config.resolve_goals();
    for (i, goal) in goals.iter().enumerate() {
        println!(
            "  {}. {} ({} of {}, interval {})",
            i + 1,
            goal.slug,
            goal.metric,
            goal.document,
            goal.interval
        );
    }
    for issue in &issues {
        println!("! {issue}");
    }
    problems += issues.len();

    if problems > 0 {
        bail!("{problems} configuration problem(s)");
    }
    println!("configuration ok: {} goal(s)", goals.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use goalsync_runtime::{GoalStatus, LastOutcome};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_takes_an_index_or_all() {
        let cli = Cli::try_parse_from(["goalsync", "submit", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Submit { index: Some(2), all: false }));

        let cli = Cli::try_parse_from(["goalsync", "submit", "--all"]).unwrap();
        assert!(matches!(cli.command, Commands::Submit { index: None, all: true }));

        assert!(Cli::try_parse_from(["goalsync", "submit"]).is_err());
        assert!(Cli::try_parse_from(["goalsync", "submit", "1", "--all"]).is_err());
    }

    #[test]
    fn daemon_subcommands_parse() {
        let cli = Cli::try_parse_from(["goalsync", "daemon", "start", "--force", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                command: DaemonCommands::Start { force: true, dry_run: true }
            }
        ));
    }

    #[test]
    fn instants_are_rfc3339() {
        let at = parse_instant("2024-03-01T02:00:00Z").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-03-01T02:00:00+00:00");
        let offset = parse_instant("2024-03-01T03:00:00+01:00").unwrap();
        assert_eq!(offset, at);
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn day_rule_lookup_prefers_the_goal() {
        let mut config = AppConfig::default();
        config.schedule.day_cutoff = "06:00".to_string();
        config.goals = vec![goalsync_config::GoalConfig {
            slug: "late".into(),
            timezone: Some("Europe/Berlin".into()),
            day_cutoff: Some("03:00".into()),
            ..Default::default()
        }];

        let global = day_rule_for(&config, None).unwrap();
        assert_eq!(global.cutoff.to_string(), "06:00");
        let goal = day_rule_for(&config, Some("late")).unwrap();
        assert_eq!(goal.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(goal.cutoff.to_string(), "03:00");
        assert!(day_rule_for(&config, Some("missing")).is_err());
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(125), "2m05s");
        assert_eq!(format_uptime(3 * 3600 + 7 * 60), "3h07m");
    }

    #[test]
    fn status_rendering_includes_outcomes_and_issues() {
        let status = DaemonStatus {
            uptime_secs: 61,
            dry_run: true,
            queue_depth: 2,
            in_flight: true,
            goals: vec![GoalStatus {
                index: 1,
                slug: "writing".into(),
                metric: "word-count".into(),
                document: "daily".into(),
                auto_submit: false,
                interval: "0s".into(),
                timer_armed: false,
                disabled: false,
                last_outcome: Some(LastOutcome {
                    at: Utc::now(),
                    ok: true,
                    summary: "writing: created 412 for 2024-02-29 (manual)".into(),
                }),
            }],
            config_issues: vec!["goal #2 (x): goal slug must not be empty".into()],
        };
        let lines = render_status(&status);
        assert_eq!(lines[0], "daemon up 1m01s (dry run)");
        assert_eq!(lines[1], "queue: 2 pending, worker busy");
        assert!(lines[3].ends_with("writing: created 412 for 2024-02-29 (manual)"));
        assert_eq!(lines[4], "ignored goal #2 (x): goal slug must not be empty");
    }
}
