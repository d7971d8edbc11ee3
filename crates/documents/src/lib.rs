//! Local documents that goals measure: reading, daily-note resolution and
//! change notification.

mod fs_store;
mod watcher;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use goalsync_core::{DayStamp, DocumentRef};

pub use fs_store::FsDocumentStore;
pub use watcher::{DocumentEvent, spawn_document_watcher};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document {0} does not exist")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Concrete path for a goal's document on `day`, or `None` when it
    /// cannot be determined.
    fn resolve(&self, document: &DocumentRef, day: &DayStamp) -> Option<PathBuf>;

    async fn read(&self, path: &Path) -> Result<String, DocumentError>;
}
