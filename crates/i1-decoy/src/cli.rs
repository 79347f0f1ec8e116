//! Command-line entry point.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::bootstrap;
use crate::config::{Settings, DEFAULT_SERVICES_PATH, DEFAULT_SETTINGS_PATH};

/// Multi-port decoy listener that blocks repeat offenders via a DNS zone.
///
/// Every connection to a decoy port is recorded and closed. Sources that
/// connect `threshold` times are written into the zone file and the
/// nameserver is reloaded; they drop out again after `timeout` minutes of
/// silence.
#[derive(Parser, Debug)]
#[command(name = "i1-decoy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Decoy service list (JSON array of {port, serviceName})
    #[arg(long, env = "I1_DECOY_SERVICES", default_value = DEFAULT_SERVICES_PATH)]
    pub services: PathBuf,

    /// Runtime settings (TOML, optional)
    #[arg(long, env = "I1_DECOY_SETTINGS", default_value = DEFAULT_SETTINGS_PATH)]
    pub settings: PathBuf,

    /// Zone file to rehydrate from and publish to
    #[arg(long)]
    pub zone_file: Option<PathBuf>,

    /// Connections before an IP is blocked
    #[arg(long)]
    pub threshold: Option<u32>,

    /// Minutes of silence before an IP is forgotten (and unblocked)
    #[arg(long)]
    pub timeout_minutes: Option<u64>,

    /// Log filter (overrides RUST_LOG), e.g. "info" or "i1_decoy=debug"
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded settings.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.zone_file {
            settings.zone_path.clone_from(path);
        }
        if let Some(threshold) = self.threshold {
            settings.threshold = threshold;
        }
        if let Some(minutes) = self.timeout_minutes {
            settings.timeout_minutes = minutes;
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Run the decoy until it is signalled to stop.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let settings = bootstrap::load_settings_with(&cli.settings, |s| cli.apply(s))?;

    bootstrap::run(&cli.services, &settings).await?;
    Ok(())
}
