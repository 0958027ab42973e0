//! Checkpoint file persistence.
//!
//! The whole registry is written as one JSON object keyed by device address.
//! Loading never fails the caller: an unreadable file means "no prior state",
//! and entries older than the configured max age are dropped one by one.

use crate::error::Result;
use crate::registry::Snapshot;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
}

impl CheckpointStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Read the checkpoint and keep only entries sampled within `max_age` of `now`.
    pub async fn load(&self, now: DateTime<Utc>, max_age: Duration) -> Snapshot {
        let Some(path) = self.path.as_deref() else {
            return Snapshot::new();
        };

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "error opening checkpoint file, starting fresh"
                );
                return Snapshot::new();
            }
        };
        let decoded = match decode(&raw) {
            Ok(states) => states,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "error decoding checkpoint file, starting fresh"
                );
                return Snapshot::new();
            }
        };
        info!(path = %path.display(), devices = decoded.len(), "got checkpoint");

        decoded
            .into_iter()
            .filter(|(addr, state)| match state.cycle.timestamp {
                Some(ts) => {
                    let age = (now - ts).to_std().unwrap_or_default();
                    if age <= max_age {
                        true
                    } else {
                        warn!(
                            addr = %addr,
                            age = ?age,
                            limit = ?max_age,
                            "checkpointed state is too old, ignoring"
                        );
                        false
                    }
                }
                None => {
                    debug!(addr = %addr, "checkpointed state was never sampled, ignoring");
                    false
                }
            })
            .collect()
    }

    /// Overwrite the checkpoint with `states`. A no-op when no path is configured.
    pub async fn save(&self, states: &Snapshot) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        info!(path = %path.display(), devices = states.len(), "checkpointing");
        write_file(path, states).await
    }
}

async fn write_file(path: &Path, states: &Snapshot) -> Result<()> {
    let body = encode(states)?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub fn encode(states: &Snapshot) -> Result<String> {
    let mut body = serde_json::to_string(states)?;
    body.push('\n');
    Ok(body)
}

pub fn decode(raw: &str) -> Result<Snapshot> {
    Ok(serde_json::from_str(raw)?)
}
