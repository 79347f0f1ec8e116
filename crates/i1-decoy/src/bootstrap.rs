//! Staged startup and shutdown.
//!
//! Stages run in order and each returns its own typed result:
//!
//! 1. **Settings** - runtime TOML (fatal)
//! 2. **Config** - decoy service list (fatal)
//! 3. **Blocklist** - existing zone file, rehydrated into the tracker (fatal)
//! 4. **Listeners** - one bind per service (per-port failures are isolated)
//!
//! Then the expiry scheduler starts and the process runs until SIGINT or
//! SIGTERM, at which point listeners stop accepting, the current sweep
//! finishes and every task is joined.

use chrono::Utc;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{self, DecoyService, Settings};
use crate::engine::DecoyEngine;
use crate::listener::{ListenerFailure, ListenerPool};
use crate::publisher::{BindZoneSink, ZonePublisher, ZoneSink};
use crate::tracker::AttemptTracker;
use crate::{scheduler, zone, DecoyError};

/// Startup stage, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Settings,
    Config,
    Blocklist,
    Listeners,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Settings => write!(f, "settings"),
            Self::Config => write!(f, "config"),
            Self::Blocklist => write!(f, "blocklist"),
            Self::Listeners => write!(f, "listeners"),
        }
    }
}

/// A startup stage failed; nothing downstream of it was started.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StartupError {
    pub stage: Stage,
    #[source]
    pub source: DecoyError,
}

impl StartupError {
    const fn new(stage: Stage, source: DecoyError) -> Self {
        Self { stage, source }
    }
}

/// Stage 1: runtime settings.
pub fn load_settings(path: &Path) -> Result<Settings, StartupError> {
    Settings::load(path).map_err(|e| fatal(Stage::Settings, e))
}

/// Stage 1 with command-line overrides applied on top of the file.
///
/// The merged result is validated again so a bad override fails this stage.
pub fn load_settings_with<F>(path: &Path, overrides: F) -> Result<Settings, StartupError>
where
    F: FnOnce(&mut Settings),
{
    let mut settings = load_settings(path)?;
    overrides(&mut settings);
    settings
        .validate()
        .map_err(|e| fatal(Stage::Settings, e))?;
    Ok(settings)
}

/// Stage 2: decoy service list.
pub fn load_services(path: &Path) -> Result<Vec<DecoyService>, StartupError> {
    let services = config::load_services(path).map_err(|e| fatal(Stage::Config, e))?;
    if services.is_empty() {
        warn!(path = %path.display(), "no decoy services configured");
    }
    Ok(services)
}

/// Stage 3: existing blocklist.
pub fn load_blocklist(path: &Path) -> Result<zone::ParsedZone, StartupError> {
    let parsed = zone::load(path).map_err(|e| fatal(Stage::Blocklist, e))?;
    if parsed.skipped > 0 {
        warn!(skipped = parsed.skipped, "ignored unparseable block records");
    }
    Ok(parsed)
}

fn fatal(stage: Stage, source: DecoyError) -> StartupError {
    error!(stage = %stage, error = %source, "startup stage failed");
    StartupError::new(stage, source)
}

/// A running decoy fleet.
pub struct Decoy {
    engine: Arc<DecoyEngine>,
    listeners: ListenerPool,
    failures: Vec<ListenerFailure>,
    scheduler: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Decoy {
    pub const fn engine(&self) -> &Arc<DecoyEngine> {
        &self.engine
    }

    pub const fn listeners(&self) -> &ListenerPool {
        &self.listeners
    }

    /// Services whose port could not be bound.
    pub fn failures(&self) -> &[ListenerFailure] {
        &self.failures
    }

    /// Stop accepting, let the current sweep finish and join every task.
    pub async fn shutdown(self) {
        // Receivers live inside the tasks; if they are all gone there is nothing to stop.
        let _ = self.shutdown.send(true);
        self.listeners.join().await;
        if let Err(e) = self.scheduler.await {
            warn!(error = %e, "expiry scheduler ended abnormally");
        }
        info!("decoy shut down");
    }
}

/// Stages 3 and 4 plus the scheduler, with an explicit zone sink.
pub async fn start(
    services: &[DecoyService],
    settings: &Settings,
    sink: Arc<dyn ZoneSink>,
) -> Result<Decoy, StartupError> {
    let parsed = load_blocklist(&settings.zone_path)?;

    let engine = Arc::new(DecoyEngine::new(
        AttemptTracker::new(settings.threshold, settings.timeout()),
        ZonePublisher::new(settings.zone.clone(), sink, parsed.serial),
    ));
    let loaded = engine.rehydrate(parsed.blocked, Utc::now());
    info!(count = loaded, "loaded previously blocked IPs");

    let (shutdown, shutdown_rx) = watch::channel(false);

    let (listeners, failures) =
        ListenerPool::start(services, settings.bind_address, &engine, &shutdown_rx).await;
    if listeners.is_empty() && !services.is_empty() {
        error!(
            stage = %Stage::Listeners,
            failed = failures.len(),
            "no decoy listener could be started, only expiry will run"
        );
    } else {
        info!(
            started = listeners.len(),
            failed = failures.len(),
            "decoy listeners ready"
        );
    }

    let scheduler = tokio::spawn(scheduler::run(
        Arc::clone(&engine),
        settings.sweep_interval(),
        shutdown_rx,
    ));

    Ok(Decoy {
        engine,
        listeners,
        failures,
        scheduler,
        shutdown,
    })
}

/// Load the service list and start everything against the real zone file.
pub async fn launch(services_path: &Path, settings: &Settings) -> Result<Decoy, StartupError> {
    let services = load_services(services_path)?;
    let sink = Arc::new(BindZoneSink::new(
        settings.zone_path.clone(),
        settings.reload_command.clone(),
    ));
    start(&services, settings, sink).await
}

/// Run until SIGINT or SIGTERM, then shut down cleanly.
pub async fn run(services_path: &Path, settings: &Settings) -> Result<(), StartupError> {
    let decoy = launch(services_path, settings).await?;
    wait_for_signal().await;
    info!("shutdown signal received");
    decoy.shutdown().await;
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::tests::RecordingSink;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};

    fn settings(zone_path: &Path) -> Settings {
        Settings {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            zone_path: zone_path.to_path_buf(),
            reload_command: Vec::new(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Blocklist.to_string(), "blocklist");
        let err = StartupError::new(Stage::Config, DecoyError::Config("bad".into()));
        assert_eq!(err.to_string(), "config stage failed: config error: bad");
    }

    #[test]
    fn test_bad_override_fails_settings_stage() {
        let missing = Path::new("/tmp/nonexistent_i1_decoy_settings.toml");
        let err = load_settings_with(missing, |s| s.threshold = 0).unwrap_err();
        assert_eq!(err.stage, Stage::Settings);
        assert!(matches!(err.source, DecoyError::Config(_)));

        let settings = load_settings_with(missing, |s| s.threshold = 3).unwrap();
        assert_eq!(settings.threshold, 3);
    }

    #[test]
    fn test_load_services_stage_error() {
        let err = load_services(Path::new("/tmp/nonexistent_i1_decoy_services.json")).unwrap_err();
        assert_eq!(err.stage, Stage::Config);
    }

    #[test]
    fn test_load_services_duplicate_port_is_fatal() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmpfile,
            r#"[{{"port": 2222, "serviceName": "ssh"}}, {{"port": 2222, "serviceName": "ssh2"}}]"#
        )
        .unwrap();
        let err = load_services(tmpfile.path()).unwrap_err();
        assert_eq!(err.stage, Stage::Config);
        assert!(matches!(err.source, DecoyError::DuplicatePort { port: 2222, .. }));
    }

    #[tokio::test]
    async fn test_start_rehydrates_without_publishing() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(
            tmpfile,
            "{}",
            zone::render(
                &Default::default(),
                2_601_010_000,
                &[
                    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                    IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
                ],
            )
        )
        .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let decoy = start(&[], &settings(tmpfile.path()), sink.clone())
            .await
            .unwrap();

        assert_eq!(decoy.engine().tracker().blocked().len(), 2);
        assert!(decoy.listeners().is_empty());
        assert_eq!(decoy.engine().publisher().last_serial().await, Some(2_601_010_000));
        decoy.shutdown().await;
        assert!(sink.installs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_on_unreadable_blocklist() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let err = start(&[], &settings(dir.path()), sink).await.err().unwrap();
        assert_eq!(err.stage, Stage::Blocklist);
    }

    #[tokio::test]
    async fn test_start_survives_bind_failure() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let services = [
            DecoyService {
                port: taken.local_addr().unwrap().port(),
                service_name: "ssh".into(),
            },
            DecoyService {
                port: 0,
                service_name: "rdp".into(),
            },
        ];

        let sink = Arc::new(RecordingSink::default());
        let decoy = start(&services, &settings(&dir.path().join("zone.db")), sink)
            .await
            .unwrap();
        assert_eq!(decoy.listeners().len(), 1);
        assert_eq!(decoy.failures().len(), 1);
        assert_eq!(decoy.failures()[0].service.service_name, "ssh");
        decoy.shutdown().await;
    }
}
