//! Durable single-file persistence variant (§6 `--timeline-storage sqlite`,
//! A.6): an append-only JSON-lines log rather than an actual embedded SQL
//! engine. The CLI flag name is kept for operator-facing continuity with
//! collaborators that do back this with a database; nothing in this core
//! needs query capability beyond "replay everything written since the
//! process last started", which a line-oriented log gives for free. See
//! DESIGN.md for the reasoning behind not pulling in a SQL crate for this.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::errors::EngineResult;
use super::TimelineEntry;

pub struct TimelinePersistence {
    path: PathBuf,
    file: Mutex<File>,
}

impl TimelinePersistence {
    pub async fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub async fn append(&self, entry: &TimelineEntry) -> EngineResult<()> {
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::from)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Replays every entry previously written to disk, used to hydrate the
    /// in-memory ring buffer at startup.
    pub async fn load_existing(path: impl AsRef<Path>) -> EngineResult<Vec<TimelineEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TimelineEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed timeline persistence line");
                }
            }
        }
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
