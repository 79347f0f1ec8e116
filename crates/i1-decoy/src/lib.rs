//! i1-decoy: multi-port decoy listener feeding a DNS blocklist zone.
//!
//! Opens a set of TCP ports that look like real services, records the
//! source IP of every connection and escalates repeat offenders from
//! "observed" to "blocked". Blocked addresses are published as records in
//! a BIND zone file which the nameserver is asked to reload.
//!
//! # Architecture
//!
//! - [`listener`] - one accept loop per decoy port, closes every connection
//! - [`tracker`] - per-IP state machine and the block set, behind one lock
//! - [`publisher`] - serialized zone writes and nameserver reloads
//! - [`scheduler`] - periodic expiry sweep
//! - [`bootstrap`] - staged startup, rehydration from the zone file, shutdown
//!
//! Data flows one way: listener -> tracker -> (maybe) publisher, and
//! scheduler -> tracker -> (maybe) publisher. [`engine::DecoyEngine`] glues
//! the tracker to the publisher so that publish I/O never runs under the
//! tracker lock.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod publisher;
pub mod scheduler;
pub mod tracker;
pub mod zone;

// Re-exports for convenience.
pub use config::{DecoyService, Settings};
pub use engine::DecoyEngine;
pub use error::DecoyError;
pub use tracker::{AttemptState, AttemptTracker};

/// Result type for i1-decoy operations.
pub type Result<T> = std::result::Result<T, DecoyError>;
