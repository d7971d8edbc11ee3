use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::debug;

use goalsync_documents::DocumentEvent;

use crate::scheduler::Scheduler;

/// Turn raw document events into content-change triggers.
///
/// A path must stay quiet for `settle` before its goals are queued; every
/// new event for the path restarts the wait.  The task ends when the event
/// sender is dropped.
pub fn spawn_change_trigger(
    scheduler: Scheduler,
    mut rx: UnboundedReceiver<DocumentEvent>,
    settle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();
        while let Some(DocumentEvent::Changed(path)) = rx.recv().await {
            pending.retain(|_, task| !task.is_finished());
            if let Some(previous) = pending.remove(&path) {
                previous.abort();
                debug!(path = %path.display(), "change superseded; settle timer restarted");
            }

            let scheduler = scheduler.clone();
            let key = path.clone();
            let task = tokio::spawn(async move {
                if !settle.is_zero() {
                    tokio::time::sleep(settle).await;
                }
                let queued = scheduler.enqueue_for_path(&path, Utc::now());
                if !queued.is_empty() {
                    debug!(path = %path.display(), goals = ?queued, "document change queued");
                }
            });
            pending.insert(key, task);
        }
        for (_, task) in pending {
            task.abort();
        }
    })
}
