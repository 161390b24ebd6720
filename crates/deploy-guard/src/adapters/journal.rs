//! Append-only JSONL journal of remediation events.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::history::RemediationEvent;

/// One JSON-encoded [`RemediationEvent`] per line.
///
/// With a size limit, a write that would push the file past it first moves
/// the file to `<path>.1`, replacing the previous rotation. Reads cover both
/// files, so at most two limits' worth of history stays on disk.
pub struct EventJournal {
    path: PathBuf,
    max_bytes: Option<u64>,
    write_lock: Mutex<()>,
}

impl EventJournal {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: None,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous generation of the journal is kept.
    #[must_use]
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    /// Append an event.
    pub async fn append(&self, event: &RemediationEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(limit) = self.max_bytes {
            self.rotate_if_full(limit, line.len() as u64).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rotate_if_full(&self, limit: u64, incoming: u64) -> Result<()> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to stat journal: {}", self.path.display()))
            }
        };
        if size == 0 || size + incoming <= limit {
            return Ok(());
        }

        let rotated = self.rotated_path();
        tokio::fs::rename(&self.path, &rotated)
            .await
            .with_context(|| format!("Failed to rotate journal to {}", rotated.display()))?;
        info!(path = %rotated.display(), size, limit, "Rotated event journal");
        Ok(())
    }

    /// Events of `target` at or after `cutoff`, oldest first. Unparseable
    /// lines are skipped.
    pub async fn read(&self, target: &str, cutoff: DateTime<Utc>) -> Result<Vec<RemediationEvent>> {
        let mut events = Vec::new();
        for path in [self.rotated_path(), self.path.clone()] {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read journal: {}", path.display()))
                }
            };

            for (number, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RemediationEvent>(line) {
                    Ok(event) if event.target == target && event.occurred_at >= cutoff => {
                        events.push(event);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        file = %path.display(),
                        line = number + 1,
                        error = %e,
                        "Skipping malformed journal line"
                    ),
                }
            }
        }
        events.sort_by_key(|e| e.occurred_at);
        Ok(events)
    }
}
