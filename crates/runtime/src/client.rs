use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{ClientCommand, DaemonStatus, ServerEvent, SyncEvent};

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.expect_ack(ClientCommand::Ping).await.map(|_| ())
    }

    /// Queue the goal at 1-based `index`.  Returns the daemon's
    /// acknowledgement once the trigger is queued.
    pub async fn submit_goal(&self, index: usize) -> Result<String> {
        self.expect_ack(ClientCommand::SubmitGoal { index }).await
    }

    pub async fn submit_all(&self) -> Result<String> {
        self.expect_ack(ClientCommand::SubmitAll).await
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        let events = self.request_events(ClientCommand::GetStatus).await?;
        for event in events {
            match event {
                ServerEvent::Status(status) => return Ok(status),
                ServerEvent::Error(msg) => bail!("daemon error: {msg}"),
                _ => {}
            }
        }
        bail!("daemon status response missing")
    }

    pub async fn reload_config(&self) -> Result<String> {
        self.expect_ack(ClientCommand::ReloadConfig).await
    }

    pub async fn graceful_shutdown(&self) -> Result<()> {
        let _ = self.request_events(ClientCommand::Shutdown).await?;
        Ok(())
    }

    /// Forward every sync event the daemon broadcasts.  Runs until the
    /// connection drops or the receiver goes away.
    pub async fn subscribe(&self, tx: mpsc::UnboundedSender<SyncEvent>) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_command(&mut write_half, &ClientCommand::Subscribe).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event: ServerEvent = match serde_json::from_str(trimmed) {
                Ok(e) => e,
                Err(err) => {
                    warn!("subscribe: bad json: {err}");
                    continue;
                }
            };
            if let ServerEvent::Sync(event) = event {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn expect_ack(&self, command: ClientCommand) -> Result<String> {
        let events = self.request_events(command).await?;
        for event in events {
            match event {
                ServerEvent::Ack(msg) => return Ok(msg),
                ServerEvent::Error(msg) => bail!("daemon error: {msg}"),
                _ => {}
            }
        }
        bail!("daemon acknowledgement missing")
    }

    async fn request_events(&self, command: ClientCommand) -> Result<Vec<ServerEvent>> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_command(&mut write_half, &command).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut events = Vec::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            let event: ServerEvent = serde_json::from_str(line.trim())?;
            let done = matches!(
                event,
                ServerEvent::Ack(_) | ServerEvent::Status(_) | ServerEvent::Error(_)
            );
            events.push(event);
            if done {
                break;
            }
        }

        Ok(events)
    }
}

async fn write_command(writer: &mut OwnedWriteHalf, command: &ClientCommand) -> Result<()> {
    let request = serde_json::to_string(command)?;
    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
