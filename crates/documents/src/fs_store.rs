use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use goalsync_core::{DayStamp, DocumentRef};

use crate::{DocumentError, DocumentStore};

const NOTE_EXTENSION: &str = "md";

/// Documents on the local filesystem under a vault root.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
    daily_notes_dir: PathBuf,
    daily_note_format: String,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            daily_notes_dir: PathBuf::new(),
            daily_note_format: "%Y-%m-%d".to_string(),
        }
    }

    pub fn with_daily_notes(mut self, dir: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        self.daily_notes_dir = dir.into();
        self.daily_note_format = format.into();
        self
    }

    fn daily_note_path(&self, day: &DayStamp) -> Option<PathBuf> {
        let mut name = String::new();
        // chrono reports unknown specifiers as a formatting error.
        if write!(name, "{}", day.date().format(&self.daily_note_format)).is_err() {
            warn!(format = %self.daily_note_format, "invalid daily note format");
            return None;
        }
        if name.trim().is_empty() {
            return None;
        }
        Some(
            self.root
                .join(&self.daily_notes_dir)
                .join(format!("{name}.{NOTE_EXTENSION}")),
        )
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    fn resolve(&self, document: &DocumentRef, day: &DayStamp) -> Option<PathBuf> {
        match document {
            // `join` keeps absolute paths as they are.
            DocumentRef::Path(path) => Some(self.root.join(path)),
            DocumentRef::DailyNote => self.daily_note_path(day),
        }
    }

    async fn read(&self, path: &Path) -> Result<String, DocumentError> {
        let full = self.root.join(path);
        match tokio::fs::read_to_string(&full).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(DocumentError::NotFound(full)),
            Err(source) => Err(DocumentError::Io { path: full, source }),
        }
    }
}
