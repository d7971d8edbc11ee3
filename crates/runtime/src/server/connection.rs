//! Unix domain socket connection handling and command dispatch.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{info, warn};

use crate::{ClientCommand, ServerEvent};

use super::DaemonState;

pub(super) async fn handle_connection(
    stream: UnixStream,
    state: Arc<Mutex<DaemonState>>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ClientCommand = match serde_json::from_str(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            warn!(%err, "unreadable client command");
            send_event(&mut write_half, ServerEvent::Error(format!("bad command: {err}"))).await?;
            return Ok(());
        }
    };

    // Submissions only touch the queue; the lock is never held across a
    // reconciliation.
    let scheduler = state.lock().await.scheduler.clone();

    match command {
        ClientCommand::Subscribe => {
            let mut rx = scheduler.subscribe();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if send_event(&mut write_half, ServerEvent::Sync(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "subscribe client lagged; {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        ClientCommand::SubmitGoal { index } => match scheduler.submit_goal(index) {
            Ok(slug) => {
                info!(index, slug = %slug, "manual submission queued");
                send_event(&mut write_half, ServerEvent::Ack(format!("queued {slug}"))).await?;
            }
            Err(err) => {
                send_event(&mut write_half, ServerEvent::Error(err.to_string())).await?;
            }
        },
        ClientCommand::SubmitAll => {
            let queued = scheduler.submit_all();
            info!(count = queued.len(), "manual submission of all goals queued");
            let msg = if queued.is_empty() {
                "no goals configured".to_string()
            } else {
                format!("queued {}", queued.join(", "))
            };
            send_event(&mut write_half, ServerEvent::Ack(msg)).await?;
        }
        ClientCommand::GetStatus => {
            let status = state.lock().await.status();
            send_event(&mut write_half, ServerEvent::Status(status)).await?;
        }
        ClientCommand::ReloadConfig => {
            let reloaded = state.lock().await.reload();
            match reloaded {
                Ok(msg) => {
                    info!("{msg}");
                    send_event(&mut write_half, ServerEvent::Ack(msg)).await?;
                }
                Err(err) => {
                    warn!(?err, "config reload failed; keeping the current goals");
                    send_event(&mut write_half, ServerEvent::Error(format!("reload failed: {err}")))
                        .await?;
                }
            }
        }
        ClientCommand::Shutdown => {
            let _ = shutdown_tx.send(true);
            send_event(&mut write_half, ServerEvent::Ack("shutdown requested".to_string())).await?;
        }
        ClientCommand::Ping => {
            send_event(&mut write_half, ServerEvent::Ack("pong".to_string())).await?;
        }
    }

    Ok(())
}

async fn send_event(writer: &mut OwnedWriteHalf, event: ServerEvent) -> Result<()> {
    let encoded = serde_json::to_string(&event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use goalsync_config::{AppConfig, GoalConfig};
    use goalsync_documents::FsDocumentStore;
    use goalsync_remote::InMemoryGoalService;

    use crate::reconcile::Reconciler;
    use crate::scheduler::Scheduler;
    use crate::{DaemonClient, SyncEvent};

    fn write_config(path: &Path, slugs: &[&str]) {
        let mut config = AppConfig::default();
        config.goals = slugs
            .iter()
            .map(|slug| GoalConfig {
                slug: slug.to_string(),
                document: "note.md".into(),
                ..GoalConfig::default()
            })
            .collect();
        config.save_to(path).unwrap();
    }

    /// Serve the control socket for a scheduler with the given goals.
    async fn serve(dir: &TempDir, slugs: &[&str]) -> (DaemonClient, Scheduler, watch::Receiver<bool>) {
        let config_path = dir.path().join("config.toml");
        write_config(&config_path, slugs);

        let reconciler = Reconciler::new(Arc::new(InMemoryGoalService::new()), Default::default());
        let scheduler = Scheduler::new(
            reconciler,
            Arc::new(FsDocumentStore::new(dir.path())),
            Duration::from_secs(1),
        );
        let mut issues = Vec::new();
        let config = AppConfig::load_from(&config_path).unwrap();
        super::super::apply_goals(&scheduler, &config, &mut issues);

        let state = Arc::new(Mutex::new(DaemonState {
            scheduler: scheduler.clone(),
            config_path,
            config_issues: issues,
            started_at: Instant::now(),
            dry_run: true,
        }));
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, shutdown_tx).await;
                });
            }
        });
        (DaemonClient::new(&socket), scheduler, shutdown_rx)
    }

    #[tokio::test]
    async fn submit_commands_enqueue_and_ack() {
        let dir = TempDir::new().unwrap();
        let (client, scheduler, _) = serve(&dir, &["a", "b"]).await;

        client.ping().await.unwrap();
        assert_eq!(client.submit_goal(2).await.unwrap(), "queued b");
        assert_eq!(client.submit_all().await.unwrap(), "queued a, b");
        assert_eq!(scheduler.queue_depth(), 3);

        let err = client.submit_goal(7).await.unwrap_err();
        assert!(err.to_string().contains("no goal #7"));
    }

    #[tokio::test]
    async fn status_lists_goals_and_queue() {
        let dir = TempDir::new().unwrap();
        let (client, _, _) = serve(&dir, &["a", "b"]).await;
        client.submit_goal(1).await.unwrap();

        let status = client.get_status().await.unwrap();
        assert!(status.dry_run);
        assert_eq!(status.queue_depth, 1);
        assert!(!status.in_flight);
        let slugs: Vec<_> = status.goals.iter().map(|g| g.slug.as_str()).collect();
        assert_eq!(slugs, vec!["a", "b"]);
        assert_eq!(status.goals[1].index, 2);
    }

    #[tokio::test]
    async fn reload_applies_the_new_goal_list() {
        let dir = TempDir::new().unwrap();
        let (client, scheduler, _) = serve(&dir, &["a"]).await;
        write_config(&dir.path().join("config.toml"), &["a", "b", "c"]);

        let msg = client.reload_config().await.unwrap();
        assert!(msg.contains("3 goal(s)"));
        assert_eq!(scheduler.snapshot().goals().len(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_sync_events() {
        let dir = TempDir::new().unwrap();
        let (client, scheduler, _) = serve(&dir, &["a"]).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscriber = client.clone();
        tokio::spawn(async move { subscriber.subscribe(tx).await });

        // Give the subscription time to register before emitting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.enqueue("a", crate::TriggerSource::Manual);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SyncEvent::Enqueued { ref slug, .. } if slug == "a"));
    }

    #[tokio::test]
    async fn shutdown_command_signals_the_daemon() {
        let dir = TempDir::new().unwrap();
        let (client, _, mut shutdown_rx) = serve(&dir, &[]).await;
        client.graceful_shutdown().await.unwrap();
        shutdown_rx.changed().await.unwrap();
        assert!(*shutdown_rx.borrow());
    }
}
