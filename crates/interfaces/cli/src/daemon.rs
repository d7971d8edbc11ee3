use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use clap::Subcommand;
use fs2::FileExt;
use tracing::info;

use goalsync_config::AppConfig;
use goalsync_runtime::{DaemonClient, run_sync_daemon};

use crate::CONFIG_PATH;

/// Set on the background child so `main` runs the daemon instead of the CLI.
pub(crate) const DAEMON_PROCESS_ENV: &str = "GOALSYNC_DAEMON_PROCESS";
/// Set together with [`DAEMON_PROCESS_ENV`] for a dry-run background daemon.
pub(crate) const DAEMON_DRY_RUN_ENV: &str = "GOALSYNC_DAEMON_DRY_RUN";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(4);
const STOP_GRACE: Duration = Duration::from_secs(2);
const KILL_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Subcommand)]
pub(crate) enum DaemonCommands {
    /// Start the daemon in the background.
    Start {
        /// Replace a daemon that is already running.
        #[arg(long)]
        force: bool,
        /// Keep datapoints in memory instead of calling the remote service.
        #[arg(long)]
        dry_run: bool,
    },
    Stop,
    Restart {
        #[arg(long)]
        dry_run: bool,
    },
    Status,
}

#[derive(Debug, Clone)]
pub(crate) struct DaemonPaths {
    pub(crate) runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    /// tracing output of the background daemon.
    pub(crate) log_file: PathBuf,
    /// Raw stdout/stderr of the background process.
    out_file: PathBuf,
    /// `live` or `dry-run`, for `daemon status`.
    mode_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

pub(crate) fn daemon_paths() -> DaemonPaths {
    daemon_paths_in(Path::new(".goalsync"))
}

fn daemon_paths_in(state_dir: &Path) -> DaemonPaths {
    let runtime_dir = state_dir.join("runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        out_file: runtime_dir.join("daemon.out"),
        mode_file: runtime_dir.join("daemon.mode"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

fn mode_label(dry_run: bool) -> &'static str {
    if dry_run { "dry-run" } else { "live" }
}

pub(crate) async fn run_daemon_command(command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Start { force, dry_run } => daemon_start(force, dry_run),
        DaemonCommands::Stop => daemon_stop().await,
        DaemonCommands::Restart { dry_run } => {
            daemon_stop().await?;
            daemon_start(true, dry_run)
        }
        DaemonCommands::Status => daemon_status().await,
    }
}

fn daemon_start(force: bool, dry_run: bool) -> Result<()> {
    let config = AppConfig::load_from(CONFIG_PATH)?;
    if !dry_run && !config.has_credentials() {
        bail!("remote credentials missing; set [remote] in {CONFIG_PATH} or pass --dry-run");
    }

    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let socket = PathBuf::from(&config.daemon.socket_path);
    clear_previous(&paths, &socket, force)?;

    let mut child = spawn_background(&paths, dry_run)?;
    fs::write(&paths.pid_file, child.id().to_string())?;
    fs::write(&paths.mode_file, mode_label(dry_run))?;

    let ready = wait_until_ready(&mut child, &socket, &paths);
    if !matches!(ready, Ok(true)) {
        let _ = fs::remove_file(&paths.pid_file);
    }
    if !ready? {
        bail!(
            "daemon did not start listening on {} within {}s; check {}",
            socket.display(),
            STARTUP_TIMEOUT.as_secs(),
            paths.log_file.display()
        );
    }

    println!("daemon started");
    println!("- pid: {}", child.id());
    println!("- mode: {}", mode_label(dry_run));
    println!("- socket: {}", socket.display());
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

/// Refuse to start over a running daemon unless `force`.  With `force` the
/// old process is terminated.  Either way the files it left behind are
/// removed.
fn clear_previous(paths: &DaemonPaths, socket: &Path, force: bool) -> Result<()> {
    let running = read_pid(&paths.pid_file)?.filter(|pid| pid_alive(*pid));
    if !force {
        if let Some(pid) = running {
            bail!(
                "daemon already running with pid {pid}; use `goalsync daemon restart` or `goalsync daemon start --force`"
            );
        }
        if is_socket_live(socket) {
            bail!(
                "a daemon is already listening on {}; use `goalsync daemon restart`",
                socket.display()
            );
        }
    }

    if let Some(pid) = running {
        terminate(pid)?;
        if !wait_for_exit(pid, KILL_TIMEOUT) {
            bail!("daemon pid {pid} did not exit");
        }
    }
    for stale in [paths.pid_file.as_path(), paths.lock_file.as_path(), socket] {
        let _ = fs::remove_file(stale);
    }
    Ok(())
}

/// Re-run this executable detached, marked as the daemon process.
fn spawn_background(paths: &DaemonPaths, dry_run: bool) -> Result<Child> {
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.out_file)?;

    let mut command = Command::new(std::env::current_exe()?);
    command
        .env(DAEMON_PROCESS_ENV, "1")
        .stdin(Stdio::null())
        .stderr(Stdio::from(out.try_clone()?))
        .stdout(Stdio::from(out));
    if dry_run {
        command.env(DAEMON_DRY_RUN_ENV, "1");
    }
    Ok(command.spawn()?)
}

/// `Ok(false)` when the socket is still dead at the deadline.
fn wait_until_ready(child: &mut Child, socket: &Path, paths: &DaemonPaths) -> Result<bool> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    while Instant::now() < deadline {
        if is_socket_live(socket) {
            return Ok(true);
        }
        if let Some(status) = child.try_wait()? {
            bail!(
                "daemon exited during startup ({status}); check {} and {}",
                paths.log_file.display(),
                paths.out_file.display()
            );
        }
        thread::sleep(Duration::from_millis(100));
    }
    Ok(false)
}

async fn daemon_stop() -> Result<()> {
    let config = AppConfig::load_from(CONFIG_PATH)?;
    let paths = daemon_paths();
    let requested = DaemonClient::new(&config.daemon.socket_path)
        .graceful_shutdown()
        .await
        .is_ok();

    let outcome = match read_pid(&paths.pid_file)? {
        None if requested => "daemon stop requested (no pid file)".to_string(),
        None => "daemon is not running".to_string(),
        Some(pid) if !pid_alive(pid) => format!("daemon was not running; removed stale pid {pid}"),
        Some(pid) => {
            if !wait_for_exit(pid, STOP_GRACE) {
                terminate(pid)?;
                if !wait_for_exit(pid, KILL_TIMEOUT) {
                    bail!("daemon pid {pid} is still running");
                }
            }
            format!("daemon stopped (pid {pid})")
        }
    };

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("{outcome}");
    Ok(())
}

async fn daemon_status() -> Result<()> {
    let config = AppConfig::load_from(CONFIG_PATH)?;
    let paths = daemon_paths();
    let socket = PathBuf::from(&config.daemon.socket_path);
    let live = is_socket_live(&socket);
    let pid = read_pid(&paths.pid_file)?.filter(|pid| pid_alive(*pid));
    let mode = fs::read_to_string(&paths.mode_file)
        .map(|raw| raw.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let state = if live || pid.is_some() { "running" } else { "stopped" };
    let mut lines = vec![format!("daemon status: {state}")];
    if let Some(pid) = pid {
        lines.push(format!("- pid: {pid}"));
    }
    lines.push(format!("- mode: {mode}"));
    lines.push(format!("- socket: {}", socket.display()));
    lines.push(format!("- log: {}", paths.log_file.display()));

    if live {
        match DaemonClient::new(&socket).get_status().await {
            Ok(status) => lines.push(format!(
                "- goals: {}, queue depth: {}, in flight: {}",
                status.goals.len(),
                status.queue_depth,
                status.in_flight
            )),
            Err(err) => lines.push(format!("- status unavailable: {err}")),
        }
    }

    println!("{}", lines.join("\n"));
    Ok(())
}

pub(crate) fn is_socket_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(raw.trim().parse().ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn kill(args: &[&str]) -> bool {
    Command::new("kill")
        .args(args)
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// `kill -0` checks for the process without signalling it.
fn pid_alive(pid: u32) -> bool {
    kill(&["-0", &pid.to_string()])
}

fn terminate(pid: u32) -> Result<()> {
    if !kill(&[&pid.to_string()]) {
        bail!("failed to signal daemon pid {pid}");
    }
    Ok(())
}

/// Poll until `pid` is gone.  `false` if it outlives `timeout`.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while pid_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
    true
}

async fn termination_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

/// Run the sync daemon in this process until it is asked to stop or a
/// termination signal arrives.  Used by both `goalsync start` and the
/// background child.
pub(crate) async fn run_daemon_process(config: AppConfig, dry_run: bool) -> Result<()> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let lock = File::create(&paths.lock_file)?;
    lock.try_lock_exclusive()
        .map_err(|_| anyhow!("another goalsync daemon holds {}", paths.lock_file.display()))?;

    let pid = std::process::id();
    fs::write(&paths.pid_file, pid.to_string())?;
    fs::write(&paths.mode_file, mode_label(dry_run))?;
    info!(pid, mode = mode_label(dry_run), "daemon process starting");

    let socket_path = config.daemon.socket_path.clone();
    let daemon = run_sync_daemon(config, CONFIG_PATH, &socket_path, dry_run);
    tokio::pin!(daemon);

    let result = tokio::select! {
        result = &mut daemon => result,
        signalled = termination_signal() => {
            signalled?;
            info!("termination signal received; stopping after the current reconciliation");
            let _ = DaemonClient::new(&socket_path).graceful_shutdown().await;
            daemon.await
        }
    };

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}
