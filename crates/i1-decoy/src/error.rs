//! Error types for the i1-decoy listener.

use thiserror::Error;

/// Errors that can occur in i1-decoy operations.
#[derive(Error, Debug)]
pub enum DecoyError {
    /// Decoy service list or runtime settings are invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Two decoy services claim the same port.
    #[error("duplicate decoy port {port}: '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    /// Persisted blocklist could not be read.
    #[error("blocklist error: {0}")]
    Blocklist(String),

    /// Zone rendering failed (bad template name, serial).
    #[error("zone error: {0}")]
    Zone(String),

    /// Decoy listener failed to bind its port.
    #[error("bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Zone file write failed.
    #[error("zone write failed: {0}")]
    Write(String),

    /// Nameserver reload command failed.
    #[error("nameserver reload failed: {0}")]
    Reload(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
