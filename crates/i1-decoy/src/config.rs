//! Decoy service list and runtime settings.
//!
//! Two files feed the process:
//! - the decoy service list, a JSON array of `{port, serviceName}` pairs
//! - the runtime settings, a TOML file that falls back to defaults when absent

use chrono::TimeDelta;
use hickory_proto::rr::Name;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use crate::DecoyError;

/// Default location of the decoy service list.
pub const DEFAULT_SERVICES_PATH: &str = "/etc/honeypot.conf";

/// Default location of the runtime settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/i1-decoy.toml";

/// Upper bound for `timeout_minutes` (ten years).
const MAX_TIMEOUT_MINUTES: u64 = 10 * 365 * 24 * 60;

/// One decoy listener: a port impersonating a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoyService {
    /// TCP port to listen on.
    pub port: u16,

    /// Service being impersonated (for logs only).
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

/// Load and validate the decoy service list.
///
/// Malformed JSON, port 0 and duplicate ports are all rejected. Order is
/// preserved.
pub fn load_services(path: &Path) -> crate::Result<Vec<DecoyService>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DecoyError::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_services(&content)
}

/// Parse and validate a decoy service list from JSON text.
pub fn parse_services(content: &str) -> crate::Result<Vec<DecoyService>> {
    let services: Vec<DecoyService> = serde_json::from_str(content)
        .map_err(|e| DecoyError::Config(format!("invalid service list: {e}")))?;

    let mut seen: HashMap<u16, &str> = HashMap::with_capacity(services.len());
    for service in &services {
        if service.port == 0 {
            return Err(DecoyError::Config(format!(
                "service '{}' has port 0",
                service.service_name
            )));
        }
        if let Some(first) = seen.insert(service.port, &service.service_name) {
            return Err(DecoyError::DuplicatePort {
                port: service.port,
                first: first.to_string(),
                second: service.service_name.clone(),
            });
        }
    }

    Ok(services)
}

/// Runtime settings for the decoy process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Connections needed before an IP is blocked (comparison is `>=`).
    pub threshold: u32,

    /// Minutes of silence after which an IP's record expires.
    pub timeout_minutes: u64,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,

    /// Address every decoy listener binds on.
    pub bind_address: IpAddr,

    /// Zone file read at startup and rewritten on every block/unblock.
    pub zone_path: PathBuf,

    /// Command run after each zone write. Empty disables the reload.
    pub reload_command: Vec<String>,

    /// Fixed zone preamble.
    pub zone: ZoneSettings,
}

/// Zone preamble: TTL, SOA and NS values written ahead of the block records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneSettings {
    /// `$TTL` directive.
    pub ttl: u32,
    /// SOA MNAME.
    pub primary_ns: String,
    /// SOA RNAME (mailbox in DNS form).
    pub admin_mailbox: String,
    /// Target of the apex NS record.
    pub nameserver: String,
    /// SOA refresh.
    pub refresh: u32,
    /// SOA retry.
    pub retry: u32,
    /// SOA expire.
    pub expire: u32,
    /// SOA minimum (negative cache TTL).
    pub negative_ttl: u32,
    /// Owner name of every block record.
    pub record_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_minutes: 60,
            sweep_interval_secs: 1,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            zone_path: PathBuf::from("/etc/bind/honeypot.db"),
            reload_command: default_reload_command(),
            zone: ZoneSettings::default(),
        }
    }
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            ttl: 60,
            primary_ns: String::from("honeypot.localhost."),
            admin_mailbox: String::from("noc.localhost."),
            nameserver: String::from("localhost."),
            refresh: 604_800,
            retry: 300,
            expire: 2_419_200,
            negative_ttl: 60,
            record_name: String::from("blocked"),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| DecoyError::Config(e.to_string()))?
        } else {
            Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the tracker or the zone writer cannot work with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.threshold == 0 {
            return Err(DecoyError::Config("threshold must be at least 1".into()));
        }
        if self.timeout_minutes == 0 || self.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(DecoyError::Config(format!(
                "timeout_minutes must be between 1 and {MAX_TIMEOUT_MINUTES}"
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(DecoyError::Config(
                "sweep_interval_secs must be at least 1".into(),
            ));
        }
        self.zone.validate()
    }

    /// Expiry timeout as a chrono delta.
    pub fn timeout(&self) -> TimeDelta {
        i64::try_from(self.timeout_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::MAX)
    }

    /// Sweep interval as a std duration.
    pub const fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ZoneSettings {
    /// Every name written into the zone must parse as a DNS name.
    pub fn validate(&self) -> crate::Result<()> {
        for (field, value) in [
            ("primary_ns", &self.primary_ns),
            ("admin_mailbox", &self.admin_mailbox),
            ("nameserver", &self.nameserver),
            ("record_name", &self.record_name),
        ] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(DecoyError::Config(format!(
                    "zone.{field} must be a non-empty name without whitespace"
                )));
            }
            Name::parse(value, None)
                .map_err(|e| DecoyError::Config(format!("zone.{field} '{value}': {e}")))?;
        }
        Ok(())
    }
}

fn default_reload_command() -> Vec<String> {
    if cfg!(target_os = "linux") {
        vec![String::from("/usr/sbin/rndc"), String::from("reload")]
    } else {
        Vec::new()
    }
}
