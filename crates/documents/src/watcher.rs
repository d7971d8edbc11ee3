use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// A note under the watched root was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Changed(PathBuf),
}

/// Watch `root` recursively and forward writes to Markdown files.
///
/// The returned watcher must be kept alive; dropping it stops the
/// notifications.  Events arrive raw: editors that save in bursts produce
/// several, so consumers debounce.
pub fn spawn_document_watcher(
    root: impl AsRef<Path>,
    tx: UnboundedSender<DocumentEvent>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in changed_notes(&event) {
                debug!(path = %path.display(), "document watcher: change detected");
                if tx.send(DocumentEvent::Changed(path)).is_err() {
                    return;
                }
            }
        }
        Err(err) => warn!(?err, "document watcher error"),
    })?;
    watcher.watch(root.as_ref(), RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn changed_notes(event: &Event) -> Vec<PathBuf> {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| is_note(p))
        .cloned()
        .collect()
}

fn is_note(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("md"))
        .unwrap_or(false)
}
