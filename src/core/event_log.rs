//! JSONL event log.
//!
//! One serialized [`Event`] per line, appended in publish order. A log can
//! be fed from a live [`EventBus`](super::EventBus) subscription with
//! [`EventLog::record`] and read back with [`EventLog::replay`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::Event;

/// File-based event log using JSONL format
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Create or open an event log, creating parent directories
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;

        let mut line = serde_json::to_vec(event)
            .with_context(|| format!("Failed to serialize event {}", event.name()))?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;

        Ok(())
    }

    /// Every logged event, oldest first; a missing file is an empty log
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut number = 0usize;

        while let Some(line) = lines.next_line().await? {
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).with_context(|| {
                format!("Malformed event on line {} of {}", number, self.path.display())
            })?;
            events.push(event);
        }

        Ok(events)
    }

    pub async fn find_events<F>(&self, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .filter(|event| predicate(event))
            .collect())
    }

    /// Most recent event with this name
    pub async fn last_event_named(&self, name: &str) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.name() == name))
    }

    /// Drain a bus subscription into this log until `cancel` fires.
    ///
    /// Events already queued on the receiver when cancellation arrives are
    /// still written.
    pub fn record(
        self,
        mut receiver: broadcast::Receiver<Event>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    received = receiver.recv() => received,
                    _ = cancel.cancelled() => break,
                };

                match received {
                    Ok(event) => {
                        if let Err(e) = self.append(&event).await {
                            error!(error = %e, "Failed to append event to log");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event log fell behind, events dropped");
                    }
                    Err(RecvError::Closed) => return,
                }
            }

            while let Ok(event) = receiver.try_recv() {
                if let Err(e) = self.append(&event).await {
                    error!(error = %e, "Failed to append event to log");
                }
            }
        })
    }
}
