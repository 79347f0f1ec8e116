//! Zone publisher: writes the block set to the zone file and reloads the nameserver.
//!
//! Publishes are serialized by an async mutex. Each request carries the
//! block set generation it was taken at; a request older than the last
//! successful write is dropped, so a slow publish can never overwrite a
//! newer zone. Failures are returned to the caller and not retried: the
//! next block or unblock publishes the full set again.

use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ZoneSettings;
use crate::tracker::BlockSnapshot;
use crate::{zone, DecoyError};

/// Destination for rendered zone text (file write plus nameserver reload).
#[async_trait]
pub trait ZoneSink: Send + Sync {
    /// Persist the zone and make the nameserver pick it up.
    async fn install(&self, zone: &str) -> crate::Result<()>;
}

/// Writes the zone file atomically, then runs the reload command.
#[derive(Debug, Clone)]
pub struct BindZoneSink {
    path: PathBuf,
    reload_command: Vec<String>,
}

impl BindZoneSink {
    pub fn new(path: impl Into<PathBuf>, reload_command: Vec<String>) -> Self {
        Self {
            path: path.into(),
            reload_command,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, zone: &str) -> crate::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, zone)
            .await
            .map_err(|e| DecoyError::Write(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DecoyError::Write(format!("rename to {}: {e}", self.path.display())))?;
        Ok(())
    }

    async fn reload(&self) -> crate::Result<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            debug!("no reload command configured, skipping nameserver reload");
            return Ok(());
        };

        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| DecoyError::Reload(format!("failed to run {program}: {e}")))?;

        if !status.success() {
            return Err(DecoyError::Reload(format!(
                "{} exited with {status}",
                self.reload_command.join(" ")
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ZoneSink for BindZoneSink {
    async fn install(&self, zone: &str) -> crate::Result<()> {
        self.write(zone).await?;
        self.reload().await
    }
}

/// What a publish request ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// Zone written and reloaded.
    Written { serial: u32, blocked: usize },
    /// A newer block set was already written; nothing to do.
    Superseded,
}

#[derive(Debug, Default)]
struct PublishState {
    /// Generation of the last successfully installed snapshot.
    generation: u64,
    /// Last serial handed to the sink.
    serial: Option<u32>,
}

/// Serializes zone publishes for the whole process.
pub struct ZonePublisher {
    settings: ZoneSettings,
    sink: Arc<dyn ZoneSink>,
    state: Mutex<PublishState>,
}

impl ZonePublisher {
    /// `last_serial` is the serial already on disk, so new writes stay ahead of it.
    pub fn new(settings: ZoneSettings, sink: Arc<dyn ZoneSink>, last_serial: Option<u32>) -> Self {
        Self {
            settings,
            sink,
            state: Mutex::new(PublishState {
                generation: 0,
                serial: last_serial,
            }),
        }
    }

    /// Render and install `snapshot` unless a newer one is already live.
    pub async fn publish(&self, snapshot: &BlockSnapshot) -> crate::Result<PublishStatus> {
        let mut state = self.state.lock().await;

        if snapshot.generation <= state.generation {
            debug!(
                generation = snapshot.generation,
                published = state.generation,
                "skipping superseded block set"
            );
            return Ok(PublishStatus::Superseded);
        }

        let serial = zone::next_serial(&Local::now(), state.serial)?;
        // Burn the serial even if the install fails; it may already be on disk.
        state.serial = Some(serial);

        let text = zone::render(&self.settings, serial, &snapshot.ips);
        self.sink.install(&text).await?;
        state.generation = snapshot.generation;

        info!(
            serial,
            blocked = snapshot.ips.len(),
            generation = snapshot.generation,
            "published blocklist zone"
        );
        Ok(PublishStatus::Written {
            serial,
            blocked: snapshot.ips.len(),
        })
    }

    /// Serial of the most recent write attempt.
    pub async fn last_serial(&self) -> Option<u32> {
        self.state.lock().await.serial
    }
}
